//! Backend event notifications
//!
//! Workers push conversation events as JSON-RPC notifications. The event kind
//! is read from `params.msg.type` when present, otherwise from the last path
//! segment of the method (`codex/event/agent_message_delta` and
//! `agent_message_delta` are equivalent). Correlation keys may live at the top
//! of `params` or inside `params.msg`, in camelCase or snake_case.

use crate::rpc::RpcNotification;
use crate::types::TokenUsage;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Identifiers used to route a notification to its turn
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CorrelationKeys {
    /// Worker-assigned conversation id (may equal a client conversation id)
    pub conversation_id: Option<String>,
    /// Caller-supplied request id
    pub request_id: Option<String>,
}

impl CorrelationKeys {
    /// Whether the notification carried no correlation data at all
    pub fn is_empty(&self) -> bool {
        self.conversation_id.is_none() && self.request_id.is_none()
    }
}

/// One fragment or full record of a tool invocation
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolCallFragment {
    /// Stable call id
    pub id: String,
    /// Position among parallel calls, when the worker reports it
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub index: Option<u32>,
    /// Function name (usually only on the first fragment)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Argument text; a fragment for deltas, the full value for messages
    #[serde(default)]
    pub arguments: String,
}

/// A decoded backend event
#[derive(Debug, Clone, PartialEq)]
pub enum BackendEvent {
    /// Incremental assistant text
    TextDelta(String),
    /// Full assistant message
    Message(String),
    /// Partial tool call
    ToolCallDelta(ToolCallFragment),
    /// Complete tool call record
    ToolCallMessage(ToolCallFragment),
    /// Legacy single function call payload
    FunctionCall {
        /// Function name
        name: String,
        /// Serialized arguments
        arguments: String,
    },
    /// Token counters
    Usage(TokenUsage),
    /// Content filter signal
    ContentFiltered,
    /// Explicit turn completion marker
    TurnComplete {
        /// Raw finish reason, if the worker supplied one
        finish_reason: Option<String>,
        /// The structured result payload
        result: Value,
    },
    /// Worker-reported error for this turn
    Error {
        /// Error message
        message: String,
        /// Worker-specific code, if any
        code: Option<String>,
    },
    /// Any other kind; carried for logging and otherwise ignored
    Other(String),
}

impl BackendEvent {
    /// Short name of the event kind, for logging
    pub fn kind(&self) -> &str {
        match self {
            Self::TextDelta(_) => "text_delta",
            Self::Message(_) => "message",
            Self::ToolCallDelta(_) => "tool_call_delta",
            Self::ToolCallMessage(_) => "tool_call",
            Self::FunctionCall { .. } => "function_call",
            Self::Usage(_) => "usage",
            Self::ContentFiltered => "content_filter",
            Self::TurnComplete { .. } => "turn_complete",
            Self::Error { .. } => "error",
            Self::Other(kind) => kind,
        }
    }
}

/// A notification decoded into routing keys plus event
#[derive(Debug, Clone, PartialEq)]
pub struct BackendNotification {
    /// Routing keys
    pub keys: CorrelationKeys,
    /// Decoded event
    pub event: BackendEvent,
}

impl BackendNotification {
    /// Decode a worker notification
    pub fn from_notification(notification: &RpcNotification) -> Self {
        let params = &notification.params;
        let msg = params.get("msg").filter(|m| m.is_object());
        let body = msg.unwrap_or(params);

        let kind = msg
            .and_then(|m| m.get("type"))
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| {
                notification
                    .method
                    .rsplit('/')
                    .next()
                    .unwrap_or_default()
                    .to_string()
            });

        Self {
            keys: correlation_keys(params),
            event: parse_event(&kind, body),
        }
    }
}

/// Extract routing keys from notification parameters
pub fn correlation_keys(params: &Value) -> CorrelationKeys {
    let msg = params.get("msg");
    let lookup = |names: &[&str]| {
        [Some(params), msg]
            .into_iter()
            .flatten()
            .find_map(|scope| names.iter().find_map(|name| string_field(scope, name)))
    };

    // A bare `id` inside `msg` usually names a tool call, so it only counts
    // at the top level.
    CorrelationKeys {
        conversation_id: lookup(&["conversationId", "conversation_id"]),
        request_id: lookup(&["requestId", "request_id"])
            .or_else(|| string_field(params, "id")),
    }
}

fn parse_event(kind: &str, body: &Value) -> BackendEvent {
    match kind {
        "agent_message_delta" | "text_delta" | "delta" => {
            BackendEvent::TextDelta(text_field(body, &["delta", "text", "content"]))
        }
        "agent_message" | "message" | "final_message" => {
            BackendEvent::Message(text_field(body, &["message", "text", "content"]))
        }
        "tool_call_delta" | "function_call_arguments_delta" => {
            BackendEvent::ToolCallDelta(tool_fragment(body, &["delta", "arguments_delta", "arguments"]))
        }
        "tool_call" | "tool_calls" | "tool_call_message" => {
            BackendEvent::ToolCallMessage(tool_fragment(body, &["arguments", "input"]))
        }
        "function_call" => BackendEvent::FunctionCall {
            name: text_field(body, &["name"]),
            arguments: arguments_text(body, &["arguments"]),
        },
        "token_count" | "usage" => BackendEvent::Usage(parse_usage(body)),
        "content_filter" | "content_filtered" => BackendEvent::ContentFiltered,
        "task_complete" | "turn_complete" | "result" => BackendEvent::TurnComplete {
            finish_reason: ["finish_reason", "finishReason", "stop_reason", "reason"]
                .iter()
                .find_map(|name| string_field(body, name)),
            result: body.clone(),
        },
        "error" | "stream_error" => BackendEvent::Error {
            message: text_field(body, &["message", "error"]),
            code: string_field(body, "code"),
        },
        other => BackendEvent::Other(other.to_string()),
    }
}

/// Read token counters from the shapes workers are known to use
pub fn parse_usage(body: &Value) -> TokenUsage {
    let scope = body
        .pointer("/info/total_token_usage")
        .or_else(|| body.get("usage"))
        .unwrap_or(body);

    let count = |names: &[&str]| {
        names
            .iter()
            .find_map(|name| scope.get(*name).and_then(Value::as_u64))
            .map(|n| u32::try_from(n).unwrap_or(u32::MAX))
            .unwrap_or(0)
    };

    TokenUsage::new(
        count(&["prompt_tokens", "input_tokens", "promptTokens"]),
        count(&["completion_tokens", "output_tokens", "completionTokens"]),
    )
}

fn tool_fragment(body: &Value, argument_fields: &[&str]) -> ToolCallFragment {
    let function = body.get("function");
    let name = string_field(body, "name")
        .or_else(|| function.and_then(|f| string_field(f, "name")));
    let arguments = {
        let direct = arguments_text(body, argument_fields);
        match function {
            Some(f) if direct.is_empty() => arguments_text(f, &["arguments"]),
            _ => direct,
        }
    };

    ToolCallFragment {
        id: ["call_id", "id", "tool_call_id", "callId"]
            .iter()
            .find_map(|field| string_field(body, field))
            .unwrap_or_default(),
        index: body
            .get("index")
            .and_then(Value::as_u64)
            .and_then(|i| u32::try_from(i).ok()),
        name,
        arguments,
    }
}

/// Arguments arrive either as a string or as an already-parsed object.
fn arguments_text(body: &Value, fields: &[&str]) -> String {
    fields
        .iter()
        .find_map(|field| match body.get(*field) {
            Some(Value::String(s)) => Some(s.clone()),
            Some(Value::Null) | None => None,
            Some(other) => Some(other.to_string()),
        })
        .unwrap_or_default()
}

fn text_field(body: &Value, fields: &[&str]) -> String {
    fields
        .iter()
        .find_map(|field| body.get(*field).and_then(Value::as_str))
        .unwrap_or_default()
        .to_string()
}

fn string_field(scope: &Value, name: &str) -> Option<String> {
    match scope.get(name)? {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn decode(method: &str, params: Value) -> BackendNotification {
        BackendNotification::from_notification(&RpcNotification::new(method, params))
    }

    #[test]
    fn test_kind_from_msg_type() {
        let n = decode(
            "codex/event",
            json!({"conversationId": "conv-1", "msg": {"type": "agent_message_delta", "delta": "Hel"}}),
        );
        assert_eq!(n.event, BackendEvent::TextDelta("Hel".to_string()));
        assert_eq!(n.keys.conversation_id.as_deref(), Some("conv-1"));
    }

    #[test]
    fn test_kind_from_method_suffix() {
        let n = decode(
            "codex/event/agent_message",
            json!({"conversation_id": "conv-2", "message": "Hello"}),
        );
        assert_eq!(n.event, BackendEvent::Message("Hello".to_string()));
        assert_eq!(n.keys.conversation_id.as_deref(), Some("conv-2"));
    }

    #[test]
    fn test_request_id_numeric() {
        let keys = correlation_keys(&json!({"msg": {"requestId": 17}}));
        assert_eq!(keys.request_id.as_deref(), Some("17"));
        assert!(keys.conversation_id.is_none());
        assert!(correlation_keys(&json!({})).is_empty());
    }

    #[test]
    fn test_tool_call_delta() {
        let n = decode(
            "codex/event",
            json!({"msg": {"type": "tool_call_delta", "call_id": "call_1", "name": "lookup", "delta": "{\"id\":"}}),
        );
        assert_eq!(
            n.event,
            BackendEvent::ToolCallDelta(ToolCallFragment {
                id: "call_1".to_string(),
                index: None,
                name: Some("lookup".to_string()),
                arguments: "{\"id\":".to_string(),
            })
        );
    }

    #[test]
    fn test_tool_call_message_with_object_arguments() {
        let n = decode(
            "tool_call",
            json!({"id": "call_9", "function": {"name": "f", "arguments": {"a": 1}}}),
        );
        match n.event {
            BackendEvent::ToolCallMessage(frag) => {
                assert_eq!(frag.id, "call_9");
                assert_eq!(frag.name.as_deref(), Some("f"));
                assert_eq!(frag.arguments, r#"{"a":1}"#);
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn test_usage_shapes() {
        let nested = json!({"info": {"total_token_usage": {"input_tokens": 10, "output_tokens": 4}}});
        assert_eq!(parse_usage(&nested), TokenUsage::new(10, 4));

        let openai = json!({"usage": {"prompt_tokens": 3, "completion_tokens": 2}});
        assert_eq!(parse_usage(&openai), TokenUsage::new(3, 2));

        assert_eq!(parse_usage(&json!({})), TokenUsage::default());
    }

    #[test]
    fn test_task_complete() {
        let n = decode(
            "codex/event",
            json!({"msg": {"type": "task_complete", "finish_reason": "stop", "last_agent_message": "hi"}}),
        );
        match n.event {
            BackendEvent::TurnComplete {
                finish_reason,
                result,
            } => {
                assert_eq!(finish_reason.as_deref(), Some("stop"));
                assert_eq!(result["last_agent_message"], "hi");
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn test_error_and_other() {
        let n = decode("codex/event", json!({"msg": {"type": "error", "message": "bad"}}));
        assert_eq!(
            n.event,
            BackendEvent::Error {
                message: "bad".to_string(),
                code: None
            }
        );

        let n = decode("codex/event", json!({"msg": {"type": "task_started"}}));
        assert_eq!(n.event.kind(), "task_started");
    }
}
