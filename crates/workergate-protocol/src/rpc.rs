//! Line-delimited JSON-RPC 2.0 envelopes spoken with the worker
//!
//! Every message is one JSON object terminated by `\n`. Requests carry a
//! numeric `id`; notifications omit it and embed their correlation keys in
//! `params`.

use crate::error::{ProtocolError, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// JSON-RPC version marker carried on every envelope
pub const JSONRPC_VERSION: &str = "2.0";

/// Method names consumed from the worker
pub mod methods {
    /// One-time-per-generation capability exchange
    pub const INITIALIZE: &str = "initialize";
    /// Create a worker-side conversation
    pub const NEW_CONVERSATION: &str = "newConversation";
    /// Subscribe to a conversation's event notifications
    pub const ADD_CONVERSATION_LISTENER: &str = "addConversationListener";
    /// Drop a previously attached subscription
    pub const REMOVE_CONVERSATION_LISTENER: &str = "removeConversationListener";
    /// Send a user message into a conversation
    pub const SEND_USER_MESSAGE: &str = "sendUserMessage";
    /// Send a full user turn (message plus turn settings)
    pub const SEND_USER_TURN: &str = "sendUserTurn";
}

/// JSON-RPC error code for an unknown method
pub const METHOD_NOT_FOUND: i64 = -32601;

/// Outbound request
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RpcRequest {
    /// Always `"2.0"`
    pub jsonrpc: String,
    /// Correlation id, unique among in-flight calls
    pub id: u32,
    /// Method name
    pub method: String,
    /// Method parameters
    #[serde(default)]
    pub params: Value,
}

impl RpcRequest {
    /// Create a new request envelope
    pub fn new(id: u32, method: impl Into<String>, params: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
            method: method.into(),
            params,
        }
    }

    /// Encode as one newline-terminated line
    pub fn to_line(&self) -> Result<String> {
        encode_line(self)
    }
}

/// Notification without an id
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RpcNotification {
    /// Always `"2.0"`
    #[serde(default = "default_version")]
    pub jsonrpc: String,
    /// Notification method
    pub method: String,
    /// Notification payload
    #[serde(default)]
    pub params: Value,
}

impl RpcNotification {
    /// Create a new notification envelope
    pub fn new(method: impl Into<String>, params: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            method: method.into(),
            params,
        }
    }

    /// Encode as one newline-terminated line
    pub fn to_line(&self) -> Result<String> {
        encode_line(self)
    }
}

/// Error object carried by a failed response
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RpcErrorObject {
    /// Numeric error code
    #[serde(default)]
    pub code: i64,
    /// Human-readable message
    #[serde(default)]
    pub message: String,
    /// Optional structured detail
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl RpcErrorObject {
    /// Create an error object without extra data
    pub fn new(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }
}

/// Response envelope, as written by either side
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RpcResponse {
    /// Always `"2.0"`
    #[serde(default = "default_version")]
    pub jsonrpc: String,
    /// Id of the request being answered
    pub id: Value,
    /// Success payload
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    /// Failure payload
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcErrorObject>,
}

impl RpcResponse {
    /// Build an error reply to a worker-initiated request
    pub fn error(id: Value, error: RpcErrorObject) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
            result: None,
            error: Some(error),
        }
    }

    /// Encode as one newline-terminated line
    pub fn to_line(&self) -> Result<String> {
        encode_line(self)
    }
}

/// A decoded line read from the worker
#[derive(Debug, Clone, PartialEq)]
pub enum IncomingMessage {
    /// Answer to one of our requests
    Response {
        /// Request id being answered
        id: u32,
        /// `Ok(result)` or the worker-reported error
        outcome: std::result::Result<Value, RpcErrorObject>,
    },
    /// Asynchronous event notification
    Notification(RpcNotification),
    /// Request initiated by the worker (approvals and similar)
    Request {
        /// Worker-chosen id, echoed in our reply
        id: Value,
        /// Method name
        method: String,
        /// Parameters
        params: Value,
    },
}

impl IncomingMessage {
    /// Decode one line of worker output
    pub fn parse_line(line: &str) -> Result<Self> {
        let value: Value = serde_json::from_str(line.trim())?;
        Self::from_value(value)
    }

    /// Classify an already-parsed JSON value
    pub fn from_value(value: Value) -> Result<Self> {
        let Value::Object(mut obj) = value else {
            return Err(ProtocolError::InvalidMessage(
                "expected a JSON object".to_string(),
            ));
        };

        if let Some(version) = obj.get("jsonrpc") {
            let got = version.as_str().unwrap_or_default();
            if got != JSONRPC_VERSION {
                return Err(ProtocolError::VersionMismatch {
                    expected: JSONRPC_VERSION.to_string(),
                    got: version.to_string(),
                });
            }
        }

        let id = obj.remove("id").filter(|v| !v.is_null());
        let method = obj
            .remove("method")
            .and_then(|m| m.as_str().map(str::to_string));
        let params = obj.remove("params").unwrap_or(Value::Null);

        match (id, method) {
            (Some(id), Some(method)) => Ok(Self::Request { id, method, params }),
            (None, Some(method)) => Ok(Self::Notification(RpcNotification::new(method, params))),
            (Some(id), None) => {
                let id = numeric_id(&id).ok_or_else(|| {
                    ProtocolError::InvalidMessage(format!("response id is not numeric: {id}"))
                })?;
                let outcome = match obj.remove("error").filter(|v| !v.is_null()) {
                    Some(err) => Err(serde_json::from_value::<RpcErrorObject>(err.clone())
                        .unwrap_or_else(|_| RpcErrorObject::new(0, err.to_string()))),
                    None => Ok(obj.remove("result").unwrap_or(Value::Null)),
                };
                Ok(Self::Response { id, outcome })
            }
            (None, None) => Err(ProtocolError::MissingField("method or id".to_string())),
        }
    }
}

/// Accept numeric ids and numeric strings; workers differ on this.
fn numeric_id(id: &Value) -> Option<u32> {
    match id {
        Value::Number(n) => n.as_u64().and_then(|n| u32::try_from(n).ok()),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

fn default_version() -> String {
    JSONRPC_VERSION.to_string()
}

fn encode_line<T: Serialize>(message: &T) -> Result<String> {
    let mut line = serde_json::to_string(message)?;
    line.push('\n');
    Ok(line)
}
