//! Shared protocol types for workergate
//!
//! This crate holds the data definitions spoken on both sides of the gateway:
//! the line-delimited JSON-RPC dialect used with the backend worker, and the
//! OpenAI-compatible chat completion objects returned to clients.
//!
//! # Type Organization
//!
//! - **Worker RPC**: [`rpc`] - Request/response/notification envelopes, method names
//! - **Backend events**: [`events`] - Decoded notification kinds and correlation keys
//! - **Client wire types**: [`openai`] - Chunks, completions, tool calls
//! - **Common types**: [`types`] - Token usage, finish reasons
//! - **Error types**: [`error`] - Protocol errors
//!
//! # Design Principles
//!
//! - **Zero I/O**: All types are pure data structures
//! - **Tolerant decoding**: Worker events accept camelCase and snake_case keys
//! - **No circular dependencies**: depends only on serde/chrono

#![deny(unsafe_code)]
#![warn(missing_docs)]
//!
//! # Usage
//!
//! ```
//! use workergate_protocol::rpc::IncomingMessage;
//! use workergate_protocol::events::{BackendEvent, BackendNotification};
//!
//! let line = r#"{"jsonrpc":"2.0","method":"codex/event","params":{"msg":{"type":"agent_message_delta","delta":"Hi"}}}"#;
//! if let Ok(IncomingMessage::Notification(n)) = IncomingMessage::parse_line(line) {
//!     let decoded = BackendNotification::from_notification(&n);
//!     assert_eq!(decoded.event, BackendEvent::TextDelta("Hi".to_string()));
//! }
//! ```

pub mod error;
pub mod events;
pub mod openai;
pub mod rpc;
pub mod types;

// Re-export commonly used types at crate level
pub use error::{ProtocolError, Result};
pub use events::{BackendEvent, BackendNotification, CorrelationKeys, ToolCallFragment};
pub use openai::{
    AssistantMessage, ChatCompletion, ChatCompletionChunk, ChunkChoice, ChunkDelta,
    CompletionChoice, FunctionCall, ToolCall, Usage,
};
pub use rpc::{IncomingMessage, RpcErrorObject, RpcNotification, RpcRequest, RpcResponse, methods};
pub use types::{FinishReason, TokenUsage};

/// Current unix time in seconds, used for `created` fields
pub fn unix_now() -> i64 {
    chrono::Utc::now().timestamp()
}
