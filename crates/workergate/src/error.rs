//! Client-facing error mapping
//!
//! Transport failures carry a stable code and a retryable bit. This module
//! turns them into the OpenAI-style error body clients see, through a pure
//! lookup table, and attaches recovery guidance via [`ErrorRecovery`]:
//! - Retryability assessment (should this be retried?)
//! - Suggested caller action
//! - Retry limits and backoff hints
//!
//! Retryability is only signaled here; nothing in this crate retries.

use serde::Serialize;
use serde_json::{Value, json};
use std::time::Duration;
use thiserror::Error;
use workergate_transport::{ErrorCode, TransportError};

/// Result type for gateway operations
pub type Result<T> = std::result::Result<T, TransportError>;

/// Configuration loading errors
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    /// A setting had a value outside its accepted set
    #[error("invalid value {value:?} for {key}")]
    InvalidValue {
        /// Setting name
        key: String,
        /// Offending value
        value: String,
    },
}

/// Backoff hint for callers that choose to retry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackoffStrategy {
    /// No backoff (don't retry)
    None,

    /// Linear backoff: base_ms * attempt_number
    Linear {
        /// Base delay in milliseconds
        base_ms: u64,
    },

    /// Exponential backoff: base_ms * 2^(attempt-1), capped at max_ms
    Exponential {
        /// Base delay in milliseconds
        base_ms: u64,
        /// Maximum delay cap in milliseconds
        max_ms: u64,
    },
}

impl BackoffStrategy {
    /// Calculate delay for a given attempt number (1-indexed)
    pub fn delay_for_attempt(&self, attempt: u32) -> Option<Duration> {
        match self {
            BackoffStrategy::None => None,
            BackoffStrategy::Linear { base_ms } => {
                Some(Duration::from_millis(base_ms.saturating_mul(attempt as u64)))
            }
            BackoffStrategy::Exponential { base_ms, max_ms } => {
                let delay_ms =
                    base_ms.saturating_mul(2_u64.saturating_pow(attempt.saturating_sub(1)));
                Some(Duration::from_millis(delay_ms.min(*max_ms)))
            }
        }
    }
}

/// Error recovery guidance
pub trait ErrorRecovery {
    /// Whether this error should be retried
    fn is_retriable(&self) -> bool;

    /// Caller-facing action to take
    fn suggested_action(&self) -> &str;

    /// Maximum number of retry attempts (None = don't retry)
    fn max_retries(&self) -> Option<u32>;

    /// Backoff strategy for retries
    fn backoff_strategy(&self) -> BackoffStrategy;
}

/// Coarse HTTP status class for a client error
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StatusCategory {
    /// 503
    ServiceUnavailable,
    /// 429
    TooManyRequests,
    /// 504
    GatewayTimeout,
    /// 499, the client went away
    ClientClosedRequest,
    /// 500
    InternalError,
}

impl StatusCategory {
    /// HTTP status code
    pub fn http_status(&self) -> u16 {
        match self {
            Self::ServiceUnavailable => 503,
            Self::TooManyRequests => 429,
            Self::GatewayTimeout => 504,
            Self::ClientClosedRequest => 499,
            Self::InternalError => 500,
        }
    }
}

/// One row of the code table
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ErrorMapping {
    /// Status class
    pub status: StatusCategory,
    /// OpenAI-style `type`
    pub error_type: &'static str,
    /// Client-facing message
    pub message: &'static str,
    /// Whether clients may retry
    pub retryable: bool,
}

const fn row(
    status: StatusCategory,
    error_type: &'static str,
    message: &'static str,
    retryable: bool,
) -> ErrorMapping {
    ErrorMapping {
        status,
        error_type,
        message,
        retryable,
    }
}

/// Look up the client mapping for a known code
pub fn lookup(code: ErrorCode) -> Option<ErrorMapping> {
    use StatusCategory::*;

    let mapping = match code {
        ErrorCode::WorkerNotReady => row(
            ServiceUnavailable,
            "service_unavailable",
            "The backend worker is not ready yet",
            true,
        ),
        ErrorCode::WorkerUnavailable => row(
            ServiceUnavailable,
            "service_unavailable",
            "The backend worker is unavailable",
            true,
        ),
        ErrorCode::WorkerBusy => row(
            TooManyRequests,
            "rate_limit_error",
            "The backend worker is at capacity",
            true,
        ),
        ErrorCode::WorkerExited => row(
            ServiceUnavailable,
            "service_unavailable",
            "The backend worker exited while handling the request",
            true,
        ),
        ErrorCode::WorkerRequestTimeout => row(
            GatewayTimeout,
            "timeout_error",
            "The backend worker did not answer in time",
            true,
        ),
        ErrorCode::HandshakeTimeout => row(
            ServiceUnavailable,
            "service_unavailable",
            "The backend worker did not finish initializing in time",
            true,
        ),
        ErrorCode::HandshakeFailed => row(
            ServiceUnavailable,
            "service_unavailable",
            "The backend worker failed to initialize",
            true,
        ),
        ErrorCode::TransportDestroyed => row(
            ServiceUnavailable,
            "service_unavailable",
            "The gateway is shutting down",
            false,
        ),
        ErrorCode::RequestAborted => row(
            ClientClosedRequest,
            "request_cancelled",
            "The request was cancelled",
            false,
        ),
        ErrorCode::WorkerError => row(
            InternalError,
            "server_error",
            "The backend worker reported an error",
            false,
        ),
        ErrorCode::TurnTimeout => row(
            GatewayTimeout,
            "timeout_error",
            "The request exceeded its deadline",
            true,
        ),
        ErrorCode::StreamIdleTimeout => row(
            GatewayTimeout,
            "timeout_error",
            "The backend stopped producing output",
            true,
        ),
        ErrorCode::WorkerDisabled => row(
            ServiceUnavailable,
            "service_unavailable",
            "The backend worker is disabled",
            false,
        ),
        ErrorCode::Other => return None,
    };
    Some(mapping)
}

/// Error object returned to clients
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Error)]
#[error("{code}: {message}")]
pub struct ClientError {
    /// Status class; not part of the body
    #[serde(skip)]
    pub status: StatusCategory,
    /// Client-facing message
    pub message: String,
    /// OpenAI-style error type
    #[serde(rename = "type")]
    pub error_type: String,
    /// Stable machine-readable code
    pub code: String,
    /// Present on the wire only when true
    #[serde(skip_serializing_if = "is_false")]
    pub retryable: bool,
}

fn is_false(value: &bool) -> bool {
    !*value
}

impl ClientError {
    /// Map a transport failure
    ///
    /// Known codes use the table; the error's own retryable bit can only
    /// narrow it. Unknown codes fall back on the retryable bit alone.
    pub fn from_transport(err: &TransportError) -> Self {
        match lookup(err.code) {
            Some(mapping) => Self {
                status: mapping.status,
                message: match err.code {
                    // Application-level errors pass the worker's text through
                    ErrorCode::WorkerError if !err.message.is_empty() => err.message.clone(),
                    _ => mapping.message.to_string(),
                },
                error_type: mapping.error_type.to_string(),
                code: err.code.as_str().to_string(),
                retryable: mapping.retryable && err.retryable,
            },
            None if err.retryable => Self {
                status: StatusCategory::ServiceUnavailable,
                message: "The backend is temporarily unavailable".to_string(),
                error_type: "service_unavailable".to_string(),
                code: err.code.as_str().to_string(),
                retryable: true,
            },
            None => Self {
                status: StatusCategory::InternalError,
                message: "Internal server error".to_string(),
                error_type: "server_error".to_string(),
                code: err.code.as_str().to_string(),
                retryable: false,
            },
        }
    }

    /// HTTP status code
    pub fn http_status(&self) -> u16 {
        self.status.http_status()
    }

    /// `{"error": {...}}` body
    pub fn to_body(&self) -> Value {
        json!({ "error": self })
    }
}

impl From<TransportError> for ClientError {
    fn from(err: TransportError) -> Self {
        Self::from_transport(&err)
    }
}

impl From<&TransportError> for ClientError {
    fn from(err: &TransportError) -> Self {
        Self::from_transport(err)
    }
}

impl ErrorRecovery for ClientError {
    fn is_retriable(&self) -> bool {
        self.retryable
    }

    fn suggested_action(&self) -> &str {
        match self.status {
            StatusCategory::TooManyRequests => {
                "Too many concurrent requests. Retry after in-flight requests finish."
            }
            StatusCategory::GatewayTimeout if self.retryable => {
                "The backend timed out. Retry, possibly with a shorter prompt."
            }
            StatusCategory::ServiceUnavailable if self.retryable => {
                "The backend is restarting or initializing. Retry shortly."
            }
            StatusCategory::ServiceUnavailable => {
                "The backend is not available. Check gateway configuration \
                and worker health."
            }
            StatusCategory::ClientClosedRequest => "The request was cancelled. No action needed.",
            _ => "The backend reported an error. Check worker logs for details.",
        }
    }

    fn max_retries(&self) -> Option<u32> {
        self.retryable.then_some(3)
    }

    fn backoff_strategy(&self) -> BackoffStrategy {
        match (self.retryable, self.status) {
            (false, _) => BackoffStrategy::None,
            (true, StatusCategory::TooManyRequests) => BackoffStrategy::Linear { base_ms: 250 },
            (true, _) => BackoffStrategy::Exponential {
                base_ms: 500,
                max_ms: 30_000,
            },
        }
    }
}

impl ErrorRecovery for TransportError {
    fn is_retriable(&self) -> bool {
        ClientError::from_transport(self).retryable
    }

    fn suggested_action(&self) -> &str {
        match self.code {
            ErrorCode::WorkerBusy => {
                "Too many concurrent requests. Retry after in-flight requests finish."
            }
            ErrorCode::WorkerDisabled => "Enable the worker in configuration.",
            ErrorCode::TransportDestroyed => "The gateway is shutting down. Do not retry.",
            ErrorCode::RequestAborted => "The request was cancelled. No action needed.",
            ErrorCode::WorkerError => "The worker rejected the turn. Check worker logs.",
            _ if self.retryable => "Transient worker failure. Retry shortly.",
            _ => "Worker failure. Check worker logs for details.",
        }
    }

    fn max_retries(&self) -> Option<u32> {
        ClientError::from_transport(self).max_retries()
    }

    fn backoff_strategy(&self) -> BackoffStrategy {
        ClientError::from_transport(self).backoff_strategy()
    }
}
