//! OpenAI-compatible chat completions over a supervised worker process
//!
//! One long-lived backend worker speaks line-delimited JSON-RPC over stdio.
//! This crate multiplexes concurrent chat turns onto it, correlates the
//! worker's event notifications back to their turns, and translates them
//! into `chat.completion` objects or `chat.completion.chunk` SSE streams.
//!
//! # Architecture
//!
//! The gateway is built on three layers:
//!
//! 1. **Protocol Layer** (`workergate-protocol`): JSON-RPC envelopes, backend
//!    events, OpenAI wire types

#![deny(unsafe_code)]
//! 2. **Transport Layer** (`workergate-transport`): Worker spawning, restart
//!    backoff, health snapshots
//! 3. **Gateway Layer** (this crate): RPC multiplexing, tool-call
//!    aggregation, streaming translation, client error mapping
//!
//! # Usage Example
//!
//! ```no_run
//! use futures::StreamExt;
//! use workergate::{ChatTurn, Gateway, GatewayConfig, ProcessConfig, SupervisorConfig};
//!
//! # async fn run() -> Result<(), workergate::ClientError> {
//! let config = GatewayConfig::new().with_supervisor(SupervisorConfig::new(
//!     ProcessConfig::new("codex").with_arg("app-server"),
//! ));
//! let gateway = Gateway::new(config)?;
//! gateway.start()?;
//!
//! let options = gateway.stream_options("gpt-5");
//! let mut stream = gateway
//!     .stream_chat_completion(ChatTurn::new("What is 2+2?"), options)
//!     .await?;
//! while let Some(frame) = stream.next().await {
//!     print!("{}", String::from_utf8_lossy(&frame));
//! }
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]

pub mod aggregator;
pub mod completion;
pub mod config;
pub mod error;
pub mod gateway;
pub mod rpc;
pub mod sanitize;
pub mod translator;

pub mod testing;

// Re-export commonly used types
pub use aggregator::{ToolCallAggregator, ToolCallRecord};
pub use completion::{CompletionOptions, build_chat_completion, chat_completion};
pub use config::{
    GatewayConfig, ProcessConfig, StopAfterTools, StreamConfig, SupervisorConfig,
    TransportConfig, TurnMethod,
};
pub use error::{
    BackoffStrategy, ClientError, ConfigError, ErrorMapping, ErrorRecovery, Result,
    StatusCategory,
};
pub use gateway::{Gateway, GatewayHealth};
pub use rpc::{ChatTurn, CollectedTurn, RpcTransport, TurnEvent, TurnHandle, TurnOutcome};
pub use sanitize::{Passthrough, SanitizeContext, SanitizeError, TextSanitizer};
pub use translator::{SseFrame, SseStream, StreamOptions, StreamTranslator, stream_chat_completion};

pub use workergate_protocol::{ChatCompletion, ChatCompletionChunk, FinishReason, TokenUsage};
pub use workergate_transport::{ErrorCode, TransportError, WorkerHandle, WorkerStatus};

/// Install a `tracing` subscriber filtered by `RUST_LOG`
///
/// Returns `false` if a global subscriber was already set.
#[cfg(feature = "trace")]
pub fn init_tracing() -> bool {
    use tracing_subscriber::EnvFilter;

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("workergate=info")),
        )
        .try_init()
        .is_ok()
}
