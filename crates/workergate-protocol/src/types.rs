//! Common type definitions used across the protocol
//!
//! Token usage counters and the canonical finish reasons surfaced to clients.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Token usage reported by the worker for one turn
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct TokenUsage {
    /// Number of tokens in the prompt
    #[serde(default)]
    pub prompt_tokens: u32,

    /// Number of tokens generated
    #[serde(default)]
    pub completion_tokens: u32,
}

impl TokenUsage {
    /// Create a new usage structure
    pub fn new(prompt_tokens: u32, completion_tokens: u32) -> Self {
        Self {
            prompt_tokens,
            completion_tokens,
        }
    }

    /// Get total tokens (prompt + completion)
    pub fn total_tokens(&self) -> u32 {
        self.prompt_tokens.saturating_add(self.completion_tokens)
    }

    /// Merge a newer report into this one.
    ///
    /// Workers report running totals, so a non-zero counter replaces the
    /// stored value and a zero counter leaves it untouched.
    pub fn merge(&mut self, other: TokenUsage) {
        if other.prompt_tokens > 0 {
            self.prompt_tokens = other.prompt_tokens;
        }
        if other.completion_tokens > 0 {
            self.completion_tokens = other.completion_tokens;
        }
    }

    /// Whether no tokens were reported at all
    pub fn is_empty(&self) -> bool {
        self.prompt_tokens == 0 && self.completion_tokens == 0
    }
}

/// Canonical finish reason as seen by OpenAI-compatible clients
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    /// Natural end of the assistant message
    Stop,
    /// Output truncated, or the turn ended without a definitive signal
    Length,
    /// The assistant requested one or more tool calls
    ToolCalls,
    /// Output withheld by a content filter
    ContentFilter,
    /// Legacy single function call
    FunctionCall,
}

impl FinishReason {
    /// Normalize a raw worker-supplied reason.
    ///
    /// Returns `None` for strings that have no canonical counterpart.
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "stop" | "end_turn" | "completed" | "complete" | "stop_sequence" => Some(Self::Stop),
            "length" | "max_tokens" | "max_output_tokens" => Some(Self::Length),
            "tool_calls" | "tool_use" | "tool_call" => Some(Self::ToolCalls),
            "content_filter" | "content_filtered" | "safety" => Some(Self::ContentFilter),
            "function_call" => Some(Self::FunctionCall),
            _ => None,
        }
    }

    /// Wire string for this reason
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Stop => "stop",
            Self::Length => "length",
            Self::ToolCalls => "tool_calls",
            Self::ContentFilter => "content_filter",
            Self::FunctionCall => "function_call",
        }
    }
}

impl fmt::Display for FinishReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn test_usage_total() {
        let usage = TokenUsage::new(100, 50);
        assert_eq!(usage.total_tokens(), 150);
    }

    #[test]
    fn test_usage_merge_keeps_known_counters() {
        let mut usage = TokenUsage::new(12, 0);
        usage.merge(TokenUsage::new(0, 7));
        assert_eq!(usage, TokenUsage::new(12, 7));

        usage.merge(TokenUsage::new(0, 9));
        assert_eq!(usage, TokenUsage::new(12, 9));
    }

    #[rstest]
    #[case("stop", Some(FinishReason::Stop))]
    #[case("end_turn", Some(FinishReason::Stop))]
    #[case("COMPLETED", Some(FinishReason::Stop))]
    #[case("max_tokens", Some(FinishReason::Length))]
    #[case("tool_use", Some(FinishReason::ToolCalls))]
    #[case("content_filter", Some(FinishReason::ContentFilter))]
    #[case("function_call", Some(FinishReason::FunctionCall))]
    #[case("weird_reason", None)]
    #[case("", None)]
    fn test_finish_reason_parse(#[case] raw: &str, #[case] expected: Option<FinishReason>) {
        assert_eq!(FinishReason::parse(raw), expected);
    }

    #[test]
    fn test_finish_reason_serde() {
        let json = serde_json::to_string(&FinishReason::ToolCalls).unwrap();
        assert_eq!(json, "\"tool_calls\"");
        let back: FinishReason = serde_json::from_str("\"content_filter\"").unwrap();
        assert_eq!(back, FinishReason::ContentFilter);
    }
}
