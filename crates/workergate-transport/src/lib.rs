//! Worker process supervision and stdio channel plumbing for workergate
//!
//! Owns the one long-lived backend worker: spawning it with piped stdio,
//! restarting it with backoff after crashes, and publishing a readiness /
//! liveness snapshot. The RPC layer talks to the worker only through the
//! [`WorkerHandle`] trait and the per-generation [`WorkerChannel`].
//!
//! # Architecture
//!
//! - **Supervisor**: Lifecycle state machine and restart policy

#![deny(unsafe_code)]
#![warn(missing_docs)]
//! - **Worker channel**: Serialized line writer plus inbound line feed
//! - **Health**: Immutable status snapshots for probes and waiters
//! - **Error handling**: Stable error codes with a retryable flag
//!
//! # Usage
//!
//! ```no_run
//! use std::time::Duration;
//! use workergate_transport::{ProcessConfig, Supervisor, SupervisorConfig, WorkerHandle};
//!
//! # async fn run() -> workergate_transport::Result<()> {
//! let config = SupervisorConfig::new(ProcessConfig::new("codex").with_arg("app-server"));
//! let supervisor = Supervisor::new(config)?;
//! supervisor.start()?;
//! let channel = supervisor.acquire_channel(Duration::from_secs(10)).await?;
//! channel.send_line(r#"{"jsonrpc":"2.0","id":1,"method":"initialize","params":{}}"#).await?;
//! # Ok(())
//! # }
//! ```

pub mod error;
pub mod subprocess;
pub mod traits;

// Re-export commonly used types
pub use error::{ErrorCode, Result, TransportError};
pub use subprocess::{
    ExitInfo, HealthReason, HealthSignal, ProcessConfig, ShutdownOptions, ShutdownSignal,
    Supervisor, SupervisorConfig, WorkerPhase, WorkerStatus,
};
pub use traits::{WorkerChannel, WorkerHandle};
