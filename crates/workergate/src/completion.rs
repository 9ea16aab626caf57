//! Non-stream response assembly
//!
//! Applies the same tool-block policies as the streaming path to the
//! completed text, then builds one `chat.completion` object.

use crate::config::{StopAfterTools, StreamConfig};
use crate::error::Result;
use crate::rpc::{CollectedTurn, TurnHandle};
use crate::sanitize::{self, SanitizeContext, TextSanitizer};
use crate::translator::{FinishResolver, ToolBlockScanner};
use std::sync::Arc;
use uuid::Uuid;
use workergate_protocol::openai::{ASSISTANT_ROLE, COMPLETION_OBJECT};
use workergate_protocol::{AssistantMessage, ChatCompletion, CompletionChoice, unix_now};

/// Per-request options for non-stream responses
#[derive(Clone)]
pub struct CompletionOptions {
    /// Model echoed in the response
    pub model: String,
    /// Completion id; generated when absent
    pub completion_id: Option<String>,
    /// Tool-block policies
    pub config: StreamConfig,
    /// Applied to the final content
    pub sanitizer: Arc<dyn TextSanitizer>,
}

impl CompletionOptions {
    /// Options for `model` with default policies
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            completion_id: None,
            config: StreamConfig::default(),
            sanitizer: sanitize::passthrough(),
        }
    }

    /// Use a fixed completion id
    pub fn with_completion_id(mut self, id: impl Into<String>) -> Self {
        self.completion_id = Some(id.into());
        self
    }

    /// Replace the tool-block policies
    pub fn with_config(mut self, config: StreamConfig) -> Self {
        self.config = config;
        self
    }

    /// Install a sanitizer
    pub fn with_sanitizer(mut self, sanitizer: Arc<dyn TextSanitizer>) -> Self {
        self.sanitizer = sanitizer;
        self
    }
}

impl std::fmt::Debug for CompletionOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompletionOptions")
            .field("model", &self.model)
            .field("completion_id", &self.completion_id)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

/// Wait for `turn` and build the response
pub async fn chat_completion(turn: TurnHandle, options: &CompletionOptions) -> Result<ChatCompletion> {
    let collected = turn.finish(options.config.parallel_tool_calls).await?;
    Ok(build_chat_completion(&collected, options))
}

/// Build a `chat.completion` from a finished turn
pub fn build_chat_completion(turn: &CollectedTurn, options: &CompletionOptions) -> ChatCompletion {
    let id = options
        .completion_id
        .clone()
        .unwrap_or_else(|| format!("chatcmpl-{}", Uuid::new_v4().simple()));

    let text = turn.outcome.content();
    let (text, blocks) = apply_tool_policies(text, &options.config);

    let tool_calls = turn.tool_calls.tool_calls();
    let function_call = if tool_calls.is_none() {
        turn.tool_calls.function_call().cloned()
    } else {
        None
    };

    let mut finish = FinishResolver::new();
    if turn.outcome.result.is_some() {
        finish.record_terminal(turn.outcome.finish_reason.as_deref());
    }
    if turn.content_filtered {
        finish.record_content_filter();
    }
    let finish_reason = finish.resolve(
        tool_calls.is_some() || blocks > 0,
        function_call.is_some(),
    );

    let context = SanitizeContext {
        completion_id: id.clone(),
        model: options.model.clone(),
    };
    let content = if text.is_empty() {
        None
    } else {
        Some(sanitize::apply(options.sanitizer.as_ref(), text, &context))
    };
    // Null only when the turn produced calls instead of text
    let content = match content {
        None if tool_calls.is_none() && function_call.is_none() => Some(String::new()),
        other => other,
    };

    ChatCompletion {
        id,
        object: COMPLETION_OBJECT.to_string(),
        created: unix_now(),
        model: options.model.clone(),
        choices: vec![CompletionChoice {
            index: 0,
            message: AssistantMessage {
                role: ASSISTANT_ROLE.to_string(),
                content,
                tool_calls,
                function_call,
            },
            finish_reason,
        }],
        usage: turn.outcome.usage.into(),
    }
}

/// Truncate `text` the way the streaming path would have forwarded it
fn apply_tool_policies<'a>(text: &'a str, config: &StreamConfig) -> (&'a str, usize) {
    let mut scanner = ToolBlockScanner::new();
    scanner.scan(
        text,
        config.stop_after_tools == StopAfterTools::First,
        config.max_tool_blocks,
    );
    let blocks = scanner.block_count();
    match scanner.last_block_end() {
        Some(end) if config.withholds_tail() || capped(config, blocks) => (&text[..end], blocks),
        _ => (text, blocks),
    }
}

fn capped(config: &StreamConfig, blocks: usize) -> bool {
    config.max_tool_blocks.is_some_and(|max| blocks >= max)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregator::ToolCallAggregator;
    use crate::rpc::TurnOutcome;
    use serde_json::json;
    use workergate_protocol::{FinishReason, TokenUsage, ToolCallFragment};

    fn collected(text: &str, finish: Option<&str>) -> CollectedTurn {
        CollectedTurn {
            outcome: TurnOutcome {
                request_id: "req-1".to_string(),
                text: text.to_string(),
                result: Some(json!({})),
                finish_reason: finish.map(str::to_string),
                usage: TokenUsage::new(4, 6),
                ..Default::default()
            },
            tool_calls: ToolCallAggregator::default(),
            content_filtered: false,
        }
    }

    #[test]
    fn test_plain_completion() {
        let response = build_chat_completion(
            &collected("Hello", Some("stop")),
            &CompletionOptions::new("gpt-test").with_completion_id("chatcmpl-1"),
        );
        assert_eq!(response.id, "chatcmpl-1");
        assert_eq!(response.object, "chat.completion");
        let choice = &response.choices[0];
        assert_eq!(choice.message.content.as_deref(), Some("Hello"));
        assert_eq!(choice.finish_reason, FinishReason::Stop);
        assert_eq!(response.usage.total_tokens, 10);
    }

    #[test]
    fn test_tool_calls_null_content() {
        let mut turn = collected("", None);
        turn.tool_calls.ingest_delta(&ToolCallFragment {
            id: "call_1".to_string(),
            index: None,
            name: Some("lookup".to_string()),
            arguments: "{\"id\":\"42\"}".to_string(),
        });
        let response = build_chat_completion(&turn, &CompletionOptions::new("m"));
        let message = &response.choices[0].message;
        assert!(message.content.is_none());
        assert_eq!(message.tool_calls.as_ref().unwrap().len(), 1);
        assert_eq!(response.choices[0].finish_reason, FinishReason::ToolCalls);
    }

    #[test]
    fn test_empty_text_without_calls_is_empty_string() {
        let response = build_chat_completion(&collected("", Some("stop")), &CompletionOptions::new("m"));
        assert_eq!(response.choices[0].message.content.as_deref(), Some(""));
    }

    #[test]
    fn test_stop_after_first_block_truncates() {
        let options = CompletionOptions::new("m")
            .with_config(StreamConfig::new().with_stop_after_tools(StopAfterTools::First));
        let response = build_chat_completion(
            &collected("a<use_tool>1</use_tool><use_tool>2</use_tool>", Some("stop")),
            &options,
        );
        let choice = &response.choices[0];
        assert_eq!(choice.message.content.as_deref(), Some("a<use_tool>1</use_tool>"));
        assert_eq!(choice.finish_reason, FinishReason::ToolCalls);
    }

    #[test]
    fn test_legacy_function_call() {
        let mut turn = collected("", None);
        turn.tool_calls.ingest_function_call("legacy", "{}");
        let response = build_chat_completion(&turn, &CompletionOptions::new("m"));
        let choice = &response.choices[0];
        assert!(choice.message.tool_calls.is_none());
        assert_eq!(
            choice.message.function_call.as_ref().and_then(|f| f.name.as_deref()),
            Some("legacy")
        );
        assert_eq!(choice.finish_reason, FinishReason::FunctionCall);
    }

    #[test]
    fn test_final_message_preferred() {
        let mut turn = collected("Hel", Some("stop"));
        turn.outcome.final_message = Some("Hello".to_string());
        let response = build_chat_completion(&turn, &CompletionOptions::new("m"));
        assert_eq!(response.choices[0].message.content.as_deref(), Some("Hello"));
    }

    #[test]
    fn test_missing_terminal_is_length() {
        let mut turn = collected("cut off", None);
        turn.outcome.result = None;
        let response = build_chat_completion(&turn, &CompletionOptions::new("m"));
        assert_eq!(response.choices[0].finish_reason, FinishReason::Length);
    }
}
