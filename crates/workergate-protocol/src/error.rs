//! Error types for protocol operations
//!
//! Covers decoding of worker output lines and encoding of outbound frames.

use thiserror::Error;

/// Result type for protocol operations
pub type Result<T> = std::result::Result<T, ProtocolError>;

/// Errors that can occur while encoding or decoding protocol messages
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ProtocolError {
    /// JSON serialization/deserialization error
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// The line was valid JSON but not a JSON-RPC 2.0 message
    #[error("Invalid message: {0}")]
    InvalidMessage(String),

    /// Missing required field
    #[error("Missing required field: {0}")]
    MissingField(String),

    /// Unsupported JSON-RPC version marker
    #[error("Version mismatch: expected {expected}, got {got}")]
    VersionMismatch {
        /// The expected protocol version.
        expected: String,
        /// The version that was actually received.
        got: String,
    },
}

impl From<serde_json::Error> for ProtocolError {
    fn from(err: serde_json::Error) -> Self {
        Self::SerializationError(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = ProtocolError::MissingField("method".to_string());
        assert_eq!(err.to_string(), "Missing required field: method");

        let err = ProtocolError::VersionMismatch {
            expected: "2.0".to_string(),
            got: "1.0".to_string(),
        };
        assert_eq!(err.to_string(), "Version mismatch: expected 2.0, got 1.0");
    }

    #[test]
    fn test_from_serde_error() {
        let err: ProtocolError = serde_json::from_str::<serde_json::Value>("{oops")
            .unwrap_err()
            .into();
        assert!(matches!(err, ProtocolError::SerializationError(_)));
    }
}
