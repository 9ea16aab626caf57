//! Server-sent event framing

use crate::error::ClientError;
use bytes::Bytes;
use serde::Serialize;
use tracing::error;
use workergate_protocol::ChatCompletionChunk;

/// Terminal sentinel payload
pub const DONE: &str = "[DONE]";

/// One SSE frame
#[derive(Debug, Clone, PartialEq)]
pub enum SseFrame {
    /// `data: <chunk>`
    Data(ChatCompletionChunk),
    /// `data: {"error": {...}}`
    Error(ClientError),
    /// `: <text>`
    Comment(String),
    /// `data: [DONE]`
    Done,
}

impl SseFrame {
    /// Keepalive comment frame
    pub fn keepalive() -> Self {
        Self::Comment("keepalive".to_string())
    }

    /// Encode for the wire, including the blank-line terminator
    pub fn encode(&self) -> Bytes {
        match self {
            Self::Data(chunk) => data_frame(chunk),
            Self::Error(err) => data_frame(&err.to_body()),
            Self::Comment(text) => Bytes::from(format!(": {text}\n\n")),
            Self::Done => Bytes::from(format!("data: {DONE}\n\n")),
        }
    }

    /// Whether this frame ends the stream
    pub fn is_done(&self) -> bool {
        matches!(self, Self::Done)
    }
}

fn data_frame<T: Serialize>(payload: &T) -> Bytes {
    match serde_json::to_string(payload) {
        Ok(json) => Bytes::from(format!("data: {json}\n\n")),
        Err(err) => {
            error!(error = %err, "failed to encode SSE payload");
            Bytes::from_static(
                b"data: {\"error\":{\"message\":\"Internal server error\",\"type\":\"server_error\",\"code\":\"error\"}}\n\n",
            )
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use workergate_protocol::ChunkDelta;
    use workergate_transport::TransportError;

    #[test]
    fn test_data_frame() {
        let chunk = ChatCompletionChunk::with_delta("id", 1, "m", ChunkDelta::default(), None);
        let bytes = SseFrame::Data(chunk).encode();
        let text = std::str::from_utf8(&bytes).unwrap();
        assert!(text.starts_with("data: {"));
        assert!(text.ends_with("}\n\n"));
    }

    #[test]
    fn test_error_and_sentinels() {
        let err = ClientError::from(TransportError::worker_exited("gone"));
        let bytes = SseFrame::Error(err).encode();
        let text = std::str::from_utf8(&bytes).unwrap();
        assert!(text.contains("\"code\":\"worker_exited\""));
        assert!(text.contains("\"retryable\":true"));

        assert_eq!(SseFrame::keepalive().encode(), Bytes::from(": keepalive\n\n"));
        assert_eq!(SseFrame::Done.encode(), Bytes::from("data: [DONE]\n\n"));
        assert!(SseFrame::Done.is_done());
    }
}
