//! Transport error types
//!
//! Every failure that reaches a turn carries a stable [`ErrorCode`] and a
//! `retryable` flag. Callers map these onto client-visible errors; nothing in
//! this crate retries on a caller's behalf.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use thiserror::Error;
use workergate_protocol::ProtocolError;

/// Result type for transport operations
pub type Result<T> = std::result::Result<T, TransportError>;

/// Stable failure codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    /// Worker has not become ready in time
    WorkerNotReady,
    /// Worker is not running or cannot be reached
    WorkerUnavailable,
    /// Concurrency cap reached
    WorkerBusy,
    /// Worker process exited while the call was in flight
    WorkerExited,
    /// A single RPC timed out
    WorkerRequestTimeout,
    /// The `initialize` exchange timed out
    HandshakeTimeout,
    /// The `initialize` exchange failed
    HandshakeFailed,
    /// The transport was torn down
    TransportDestroyed,
    /// The turn was cancelled
    RequestAborted,
    /// Application-level error reported by the worker
    WorkerError,
    /// The whole turn exceeded its deadline
    TurnTimeout,
    /// No backend frame arrived within the stream idle window
    StreamIdleTimeout,
    /// The worker is disabled by configuration
    WorkerDisabled,
    /// Anything else
    Other,
}

impl ErrorCode {
    /// Stable string form
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::WorkerNotReady => "worker_not_ready",
            Self::WorkerUnavailable => "worker_unavailable",
            Self::WorkerBusy => "worker_busy",
            Self::WorkerExited => "worker_exited",
            Self::WorkerRequestTimeout => "worker_request_timeout",
            Self::HandshakeTimeout => "handshake_timeout",
            Self::HandshakeFailed => "handshake_failed",
            Self::TransportDestroyed => "transport_destroyed",
            Self::RequestAborted => "request_aborted",
            Self::WorkerError => "worker_error",
            Self::TurnTimeout => "turn_timeout",
            Self::StreamIdleTimeout => "stream_idle_timeout",
            Self::WorkerDisabled => "worker_disabled",
            Self::Other => "error",
        }
    }

    /// Whether failures with this code are transient by default
    pub fn default_retryable(&self) -> bool {
        matches!(
            self,
            Self::WorkerNotReady
                | Self::WorkerUnavailable
                | Self::WorkerBusy
                | Self::WorkerExited
                | Self::WorkerRequestTimeout
                | Self::HandshakeTimeout
                | Self::HandshakeFailed
                | Self::TurnTimeout
                | Self::StreamIdleTimeout
        )
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A transport failure
#[derive(Debug, Clone, Error, PartialEq)]
#[error("{code}: {message}")]
pub struct TransportError {
    /// Failure code
    pub code: ErrorCode,
    /// Human-readable detail
    pub message: String,
    /// Whether retrying is safe
    pub retryable: bool,
    /// Optional structured detail (worker error payloads and similar)
    pub details: Option<Value>,
}

impl TransportError {
    /// Create an error with the code's default retryability
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            retryable: code.default_retryable(),
            details: None,
        }
    }

    /// Override retryability
    pub fn with_retryable(mut self, retryable: bool) -> Self {
        self.retryable = retryable;
        self
    }

    /// Attach structured detail
    pub fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }

    /// Worker exited mid-flight
    pub fn worker_exited(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::WorkerExited, message)
    }

    /// Worker is not reachable
    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::WorkerUnavailable, message)
    }

    /// Turn was cancelled
    pub fn aborted(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::RequestAborted, message)
    }

    /// Error reported by the worker application
    pub fn worker_error(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::WorkerError, message)
    }
}

impl From<std::io::Error> for TransportError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::BrokenPipe | std::io::ErrorKind::UnexpectedEof => {
                Self::worker_exited(format!("worker pipe closed: {err}"))
            }
            _ => Self::unavailable(format!("worker I/O error: {err}")),
        }
    }
}

impl From<ProtocolError> for TransportError {
    fn from(err: ProtocolError) -> Self {
        Self::new(ErrorCode::Other, err.to_string())
    }
}
