//! Text sanitization hook
//!
//! Every content segment forwarded to a client passes through a
//! [`TextSanitizer`]. A failing sanitizer never breaks the stream: the
//! failure is logged and the original segment goes out unchanged.

use std::sync::Arc;
use thiserror::Error;
use tracing::warn;

/// Sanitizer failure
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("sanitizer failed: {0}")]
pub struct SanitizeError(pub String);

/// Per-request context handed to the sanitizer
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SanitizeContext {
    /// Completion id
    pub completion_id: String,
    /// Model echoed to the client
    pub model: String,
}

/// Rewrites text before it reaches a client
pub trait TextSanitizer: Send + Sync {
    /// Return the text to forward for `segment`
    fn sanitize(
        &self,
        segment: &str,
        context: &SanitizeContext,
    ) -> Result<String, SanitizeError>;
}

/// Forwards text unchanged
#[derive(Debug, Clone, Copy, Default)]
pub struct Passthrough;

impl TextSanitizer for Passthrough {
    fn sanitize(&self, segment: &str, _context: &SanitizeContext) -> Result<String, SanitizeError> {
        Ok(segment.to_string())
    }
}

impl<F> TextSanitizer for F
where
    F: Fn(&str) -> Result<String, SanitizeError> + Send + Sync,
{
    fn sanitize(&self, segment: &str, _context: &SanitizeContext) -> Result<String, SanitizeError> {
        self(segment)
    }
}

/// Default sanitizer
pub fn passthrough() -> Arc<dyn TextSanitizer> {
    Arc::new(Passthrough)
}

/// Run `sanitizer`, falling back to `segment` on failure
pub fn apply(sanitizer: &dyn TextSanitizer, segment: &str, context: &SanitizeContext) -> String {
    match sanitizer.sanitize(segment, context) {
        Ok(text) => text,
        Err(err) => {
            warn!(
                completion_id = %context.completion_id,
                error = %err,
                "sanitizer failed, forwarding original text"
            );
            segment.to_string()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_passthrough() {
        let ctx = SanitizeContext::default();
        assert_eq!(apply(&Passthrough, "hello", &ctx), "hello");
    }

    #[test]
    fn test_closure_sanitizer() {
        let upper = |s: &str| Ok::<_, SanitizeError>(s.to_uppercase());
        assert_eq!(apply(&upper, "abc", &SanitizeContext::default()), "ABC");
    }

    #[test]
    fn test_failure_forwards_original() {
        let broken = |_: &str| Err::<String, _>(SanitizeError("boom".to_string()));
        assert_eq!(apply(&broken, "keep me", &SanitizeContext::default()), "keep me");
    }
}
