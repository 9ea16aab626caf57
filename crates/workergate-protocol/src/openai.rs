//! OpenAI-compatible chat completion wire types
//!
//! Streaming responses are sequences of [`ChatCompletionChunk`]; non-stream
//! responses are a single [`ChatCompletion`]. `finish_reason` is always
//! present on the wire and serialized as `null` until a choice finishes.

use crate::types::{FinishReason, TokenUsage};
use serde::{Deserialize, Serialize};

/// Object tag for streamed chunks
pub const CHUNK_OBJECT: &str = "chat.completion.chunk";

/// Object tag for non-stream responses
pub const COMPLETION_OBJECT: &str = "chat.completion";

/// Assistant role name
pub const ASSISTANT_ROLE: &str = "assistant";

/// Token usage in OpenAI shape
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct Usage {
    /// Prompt tokens
    pub prompt_tokens: u32,
    /// Completion tokens
    pub completion_tokens: u32,
    /// Sum of both
    pub total_tokens: u32,
}

impl From<TokenUsage> for Usage {
    fn from(usage: TokenUsage) -> Self {
        Self {
            prompt_tokens: usage.prompt_tokens,
            completion_tokens: usage.completion_tokens,
            total_tokens: usage.total_tokens(),
        }
    }
}

/// Function name and serialized arguments
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct FunctionCall {
    /// Function name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Arguments as a JSON string
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub arguments: Option<String>,
}

/// A tool call inside a message or a chunk delta
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ToolCall {
    /// Position among the message's tool calls
    pub index: u32,
    /// Stable call id
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// Always `"function"` when present
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    /// Function payload
    pub function: FunctionCall,
}

impl ToolCall {
    /// A function tool call with all fields populated
    pub fn function(
        index: u32,
        id: impl Into<String>,
        name: Option<String>,
        arguments: impl Into<String>,
    ) -> Self {
        Self {
            index,
            id: Some(id.into()),
            kind: Some("function".to_string()),
            function: FunctionCall {
                name,
                arguments: Some(arguments.into()),
            },
        }
    }
}

/// Delta payload of one streamed choice
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct ChunkDelta {
    /// Role announcement, first chunk only
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    /// Assistant text
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    /// Tool call updates
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCall>>,
    /// Legacy function call
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub function_call: Option<FunctionCall>,
}

/// One choice inside a chunk
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChunkChoice {
    /// Choice index
    pub index: u32,
    /// Incremental payload
    pub delta: ChunkDelta,
    /// Set only on the choice's finish chunk
    pub finish_reason: Option<FinishReason>,
}

/// A `chat.completion.chunk` object
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChatCompletionChunk {
    /// Completion id, shared by all chunks of one stream
    pub id: String,
    /// Always [`CHUNK_OBJECT`]
    pub object: String,
    /// Unix seconds
    pub created: i64,
    /// Model name echoed to the client
    pub model: String,
    /// Choices; empty on the trailing usage chunk
    pub choices: Vec<ChunkChoice>,
    /// Usage, only on the trailing usage chunk
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
}

impl ChatCompletionChunk {
    /// A chunk with a single choice carrying `delta`
    pub fn with_delta(
        id: impl Into<String>,
        created: i64,
        model: impl Into<String>,
        delta: ChunkDelta,
        finish_reason: Option<FinishReason>,
    ) -> Self {
        Self {
            id: id.into(),
            object: CHUNK_OBJECT.to_string(),
            created,
            model: model.into(),
            choices: vec![ChunkChoice {
                index: 0,
                delta,
                finish_reason,
            }],
            usage: None,
        }
    }

    /// A choice-less chunk carrying usage
    pub fn usage_only(
        id: impl Into<String>,
        created: i64,
        model: impl Into<String>,
        usage: Usage,
    ) -> Self {
        Self {
            id: id.into(),
            object: CHUNK_OBJECT.to_string(),
            created,
            model: model.into(),
            choices: Vec::new(),
            usage: Some(usage),
        }
    }
}

/// Assistant message of a non-stream response
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AssistantMessage {
    /// Always `"assistant"`
    pub role: String,
    /// Text content, `null` when only tool calls were produced
    pub content: Option<String>,
    /// Tool calls, when any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCall>>,
    /// Legacy function call, when any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub function_call: Option<FunctionCall>,
}

/// One choice of a non-stream response
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CompletionChoice {
    /// Choice index
    pub index: u32,
    /// The assistant message
    pub message: AssistantMessage,
    /// Canonical finish reason
    pub finish_reason: FinishReason,
}

/// A `chat.completion` object
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChatCompletion {
    /// Completion id
    pub id: String,
    /// Always [`COMPLETION_OBJECT`]
    pub object: String,
    /// Unix seconds
    pub created: i64,
    /// Model name echoed to the client
    pub model: String,
    /// Choices
    pub choices: Vec<CompletionChoice>,
    /// Token usage
    pub usage: Usage,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{Value, json};

    #[test]
    fn test_chunk_finish_reason_null() {
        let chunk = ChatCompletionChunk::with_delta(
            "chatcmpl-1",
            1,
            "m",
            ChunkDelta {
                content: Some("Hello".to_string()),
                ..Default::default()
            },
            None,
        );
        let value = serde_json::to_value(&chunk).unwrap();
        assert_eq!(value["object"], "chat.completion.chunk");
        assert_eq!(value["choices"][0]["finish_reason"], Value::Null);
        assert_eq!(value["choices"][0]["delta"], json!({"content": "Hello"}));
        assert!(value.get("usage").is_none());
    }

    #[test]
    fn test_usage_chunk_has_no_choices() {
        let chunk = ChatCompletionChunk::usage_only("c", 1, "m", TokenUsage::new(2, 3).into());
        let value = serde_json::to_value(&chunk).unwrap();
        assert_eq!(value["choices"], json!([]));
        assert_eq!(value["usage"]["total_tokens"], 5);
    }

    #[test]
    fn test_tool_call_delta_shape() {
        let call = ToolCall::function(0, "call_1", Some("lookup".to_string()), "{\"id\":");
        let value = serde_json::to_value(&call).unwrap();
        assert_eq!(
            value,
            json!({
                "index": 0,
                "id": "call_1",
                "type": "function",
                "function": {"name": "lookup", "arguments": "{\"id\":"}
            })
        );
    }

    #[test]
    fn test_completion_null_content() {
        let message = AssistantMessage {
            role: ASSISTANT_ROLE.to_string(),
            content: None,
            tool_calls: Some(vec![ToolCall::function(0, "c", None, "{}")]),
            function_call: None,
        };
        let value = serde_json::to_value(&message).unwrap();
        assert_eq!(value["content"], Value::Null);
        assert!(value.get("function_call").is_none());
    }
}
