//! Turn requests, events, and the caller-side handle

use super::state::TurnKey;
use super::transport::Shared;
use crate::aggregator::ToolCallAggregator;
use crate::error::Result;
use serde_json::{Map, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use workergate_protocol::{BackendEvent, TokenUsage};
use workergate_transport::{ErrorCode, TransportError};

/// One user turn to run on the worker
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChatTurn {
    /// Prompt text sent as the user's message
    pub prompt: String,
    /// Caller-supplied correlation key; generated when absent
    pub request_id: Option<String>,
    /// Existing worker conversation to continue
    pub conversation_id: Option<String>,
    /// Model to request
    pub model: Option<String>,
    /// Extra parameters merged into the turn request
    pub params: Map<String, Value>,
}

impl ChatTurn {
    /// Create a turn for `prompt`
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            ..Default::default()
        }
    }

    /// Set the correlation key
    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = Some(request_id.into());
        self
    }

    /// Continue an existing worker conversation
    pub fn with_conversation_id(mut self, conversation_id: impl Into<String>) -> Self {
        self.conversation_id = Some(conversation_id.into());
        self
    }

    /// Set the model
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    /// Add a parameter to the turn request
    pub fn with_param(mut self, key: impl Into<String>, value: Value) -> Self {
        self.params.insert(key.into(), value);
        self
    }
}

/// Final state of a completed turn
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TurnOutcome {
    /// Correlation key
    pub request_id: String,
    /// Worker conversation the turn ran in
    pub conversation_id: Option<String>,
    /// Concatenated text deltas
    pub text: String,
    /// Final assistant message, if one arrived
    pub final_message: Option<String>,
    /// Result marker payload
    pub result: Option<Value>,
    /// Merged token counters
    pub usage: TokenUsage,
    /// Raw finish reason from the result marker
    pub finish_reason: Option<String>,
}

impl TurnOutcome {
    /// Final message when non-empty, otherwise the concatenated deltas
    pub fn content(&self) -> &str {
        match self.final_message.as_deref() {
            Some(message) if !message.is_empty() => message,
            _ => &self.text,
        }
    }
}

/// Event delivered to a turn's mailbox
#[derive(Debug, Clone, PartialEq)]
pub enum TurnEvent {
    /// A backend event routed to this turn
    Backend(BackendEvent),
    /// The turn completed
    End(TurnOutcome),
    /// The turn failed
    Failed(TransportError),
}

/// A completed turn plus everything collected from its events
#[derive(Debug, Clone)]
pub struct CollectedTurn {
    /// Final state
    pub outcome: TurnOutcome,
    /// Aggregated tool calls
    pub tool_calls: ToolCallAggregator,
    /// Whether a content filter signal arrived
    pub content_filtered: bool,
}

/// Caller side of an active turn
///
/// Dropping the handle before the turn ends cancels it.
pub struct TurnHandle {
    shared: Arc<Shared>,
    generation: u64,
    key: TurnKey,
    request_id: String,
    client_conversation_id: String,
    pub(crate) conversation_id: Option<String>,
    events: mpsc::UnboundedReceiver<TurnEvent>,
    turn_timeout: Duration,
    finished: bool,
}

impl TurnHandle {
    pub(crate) fn new(
        shared: Arc<Shared>,
        generation: u64,
        key: TurnKey,
        request_id: String,
        client_conversation_id: String,
        events: mpsc::UnboundedReceiver<TurnEvent>,
        turn_timeout: Duration,
    ) -> Self {
        Self {
            shared,
            generation,
            key,
            request_id,
            client_conversation_id,
            conversation_id: None,
            events,
            turn_timeout,
            finished: false,
        }
    }

    /// Correlation key
    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    /// Locally generated conversation key
    pub fn client_conversation_id(&self) -> &str {
        &self.client_conversation_id
    }

    /// Worker conversation id
    pub fn conversation_id(&self) -> Option<&str> {
        self.conversation_id.as_deref()
    }

    /// Worker generation the turn runs on
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Deadline for the whole turn
    pub fn turn_timeout(&self) -> Duration {
        self.turn_timeout
    }

    /// Next mailbox event; `None` after the terminal event
    pub async fn next_event(&mut self) -> Option<TurnEvent> {
        if self.finished {
            return None;
        }
        let event = self.events.recv().await;
        if !matches!(event, Some(TurnEvent::Backend(_))) {
            self.finished = true;
        }
        event
    }

    /// Cancel the turn; it fails with `request_aborted`
    pub fn cancel(&self) {
        self.abort(TransportError::aborted("turn cancelled by caller"));
    }

    /// End the turn with `err`
    pub fn abort(&self, err: TransportError) {
        self.shared.abort_turn(self.generation, self.key, err);
    }

    /// Wait for the turn to end, collecting tool calls along the way
    ///
    /// Fails with `turn_timeout` when the turn outlives its deadline.
    pub async fn finish(mut self, parallel_tool_calls: bool) -> Result<CollectedTurn> {
        let timeout = self.turn_timeout;
        match tokio::time::timeout(timeout, self.collect(parallel_tool_calls)).await {
            Ok(result) => result,
            Err(_) => {
                let err = TransportError::new(
                    ErrorCode::TurnTimeout,
                    format!("turn exceeded {}ms", timeout.as_millis()),
                );
                self.abort(err.clone());
                self.finished = true;
                Err(err)
            }
        }
    }

    async fn collect(&mut self, parallel_tool_calls: bool) -> Result<CollectedTurn> {
        let mut tool_calls = ToolCallAggregator::new(parallel_tool_calls);
        let mut content_filtered = false;

        while let Some(event) = self.next_event().await {
            match event {
                TurnEvent::Backend(BackendEvent::ToolCallDelta(fragment)) => {
                    tool_calls.ingest_delta(&fragment);
                }
                TurnEvent::Backend(BackendEvent::ToolCallMessage(fragment)) => {
                    tool_calls.ingest_message(&fragment);
                }
                TurnEvent::Backend(BackendEvent::FunctionCall { name, arguments }) => {
                    tool_calls.ingest_function_call(&name, &arguments);
                }
                TurnEvent::Backend(BackendEvent::ContentFiltered) => content_filtered = true,
                TurnEvent::Backend(_) => {}
                TurnEvent::End(outcome) => {
                    return Ok(CollectedTurn {
                        outcome,
                        tool_calls,
                        content_filtered,
                    });
                }
                TurnEvent::Failed(err) => return Err(err),
            }
        }

        Err(TransportError::worker_exited("turn ended without an outcome"))
    }
}

impl Drop for TurnHandle {
    fn drop(&mut self) {
        if !self.finished {
            self.shared.abort_turn(
                self.generation,
                self.key,
                TransportError::aborted("turn handle dropped"),
            );
        }
    }
}

impl std::fmt::Debug for TurnHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TurnHandle")
            .field("request_id", &self.request_id)
            .field("conversation_id", &self.conversation_id)
            .field("generation", &self.generation)
            .field("finished", &self.finished)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_chat_turn_builder() {
        let turn = ChatTurn::new("hi")
            .with_request_id("req-1")
            .with_model("gpt-x")
            .with_param("effort", json!("low"));
        assert_eq!(turn.prompt, "hi");
        assert_eq!(turn.request_id.as_deref(), Some("req-1"));
        assert_eq!(turn.params["effort"], "low");
        assert!(turn.conversation_id.is_none());
    }

    #[test]
    fn test_outcome_content_prefers_final_message() {
        let mut outcome = TurnOutcome {
            text: "partial".to_string(),
            ..Default::default()
        };
        assert_eq!(outcome.content(), "partial");
        outcome.final_message = Some(String::new());
        assert_eq!(outcome.content(), "partial");
        outcome.final_message = Some("full".to_string());
        assert_eq!(outcome.content(), "full");
    }
}
