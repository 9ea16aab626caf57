//! Finish reason resolution
//!
//! Precedence: tool calls, then a legacy function call, then a content
//! filter signal, then the worker's explicit reason. A terminal signal
//! without a reason means `stop`; an unrecognized reason or no terminal
//! signal at all falls back to `length`.

use tracing::warn;
use workergate_protocol::FinishReason;

/// Collects finish signals for one turn
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FinishResolver {
    explicit: Option<FinishReason>,
    unrecognized: Vec<String>,
    content_filtered: bool,
    terminal: bool,
}

impl FinishResolver {
    /// Create an empty resolver
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a terminal signal carrying an optional raw reason
    pub fn record_terminal(&mut self, raw: Option<&str>) {
        self.terminal = true;
        let Some(raw) = raw.map(str::trim).filter(|r| !r.is_empty()) else {
            return;
        };
        match FinishReason::parse(raw) {
            Some(FinishReason::ContentFilter) => {
                self.content_filtered = true;
                self.explicit = Some(FinishReason::ContentFilter);
            }
            Some(reason) => self.explicit = Some(reason),
            None => {
                warn!(finish_reason = %raw, "unrecognized finish reason");
                self.unrecognized.push(raw.to_string());
            }
        }
    }

    /// Record a content filter signal
    pub fn record_content_filter(&mut self) {
        self.content_filtered = true;
    }

    /// Raw reasons that matched no canonical value
    pub fn unrecognized(&self) -> &[String] {
        &self.unrecognized
    }

    /// Whether a terminal signal was seen
    pub fn saw_terminal(&self) -> bool {
        self.terminal
    }

    /// Resolve the canonical reason
    pub fn resolve(&self, has_tool_calls: bool, has_function_call: bool) -> FinishReason {
        if has_tool_calls {
            FinishReason::ToolCalls
        } else if has_function_call {
            FinishReason::FunctionCall
        } else if self.content_filtered {
            FinishReason::ContentFilter
        } else if let Some(reason) = self.explicit {
            reason
        } else if self.terminal && self.unrecognized.is_empty() {
            FinishReason::Stop
        } else {
            FinishReason::Length
        }
    }
}
