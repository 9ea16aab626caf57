//! Tool call aggregation
//!
//! Accumulates per-call argument text across fragments. Arguments only ever
//! grow, so a streamed value is always a prefix of every later value for the
//! same call id.

use std::collections::HashMap;
use tracing::debug;
use workergate_protocol::{FunctionCall, ToolCall, ToolCallFragment};

/// Accumulated state of one tool call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolCallRecord {
    /// Stable call id
    pub id: String,
    /// Position in first-seen order
    pub index: u32,
    /// Function name, once known
    pub name: Option<String>,
    /// Cumulative argument text
    pub arguments: String,
}

impl ToolCallRecord {
    /// OpenAI-shaped tool call
    pub fn to_tool_call(&self) -> ToolCall {
        ToolCall::function(
            self.index,
            self.id.clone(),
            self.name.clone(),
            self.arguments.clone(),
        )
    }
}

/// Accumulates tool calls for one turn
#[derive(Debug, Clone)]
pub struct ToolCallAggregator {
    calls: Vec<ToolCallRecord>,
    by_id: HashMap<String, usize>,
    function_call: Option<FunctionCall>,
    parallel: bool,
}

impl Default for ToolCallAggregator {
    fn default() -> Self {
        Self::new(true)
    }
}

impl ToolCallAggregator {
    /// Create an aggregator; with `parallel` false only the first call id is kept
    pub fn new(parallel: bool) -> Self {
        Self {
            calls: Vec::new(),
            by_id: HashMap::new(),
            function_call: None,
            parallel,
        }
    }

    /// Whether more than one call id is accepted
    pub fn supports_parallel_calls(&self) -> bool {
        self.parallel
    }

    /// Fold an incremental fragment in
    ///
    /// Returns the id of the call whose visible state changed, if any.
    pub fn ingest_delta(&mut self, fragment: &ToolCallFragment) -> Option<String> {
        let (slot, created) = self.slot_for(fragment)?;
        let call = &mut self.calls[slot];
        let named = call.name.is_none() && fragment.name.is_some();
        if named {
            call.name = fragment.name.clone();
        }
        call.arguments.push_str(&fragment.arguments);

        (created || named || !fragment.arguments.is_empty()).then(|| call.id.clone())
    }

    /// Fold a complete tool call record in
    ///
    /// The record's arguments are the full value. When they extend what was
    /// already accumulated the call is reported as changed; a diverging value
    /// replaces the stored one without being reported, so callers that stream
    /// never emit a non-prefix update.
    pub fn ingest_message(&mut self, fragment: &ToolCallFragment) -> Option<String> {
        let (slot, created) = self.slot_for(fragment)?;
        let call = &mut self.calls[slot];
        let named = call.name.is_none() && fragment.name.is_some();
        if named {
            call.name = fragment.name.clone();
        }

        let full = fragment.arguments.as_str();
        let extended = match full.strip_prefix(call.arguments.as_str()) {
            Some(rest) => {
                let grew = !rest.is_empty();
                call.arguments.push_str(rest);
                grew
            }
            None => {
                debug!(
                    call_id = %call.id,
                    "tool call record diverges from streamed arguments"
                );
                call.arguments = full.to_string();
                false
            }
        };

        (created || named || extended).then(|| call.id.clone())
    }

    /// Record a legacy function call payload
    pub fn ingest_function_call(&mut self, name: &str, arguments: &str) {
        let call = self.function_call.get_or_insert_with(FunctionCall::default);
        if call.name.is_none() && !name.is_empty() {
            call.name = Some(name.to_string());
        }
        call.arguments
            .get_or_insert_with(String::new)
            .push_str(arguments);
    }

    /// Look up a call by id
    pub fn get(&self, id: &str) -> Option<&ToolCallRecord> {
        self.by_id.get(id).map(|&slot| &self.calls[slot])
    }

    /// Calls in first-seen order
    pub fn snapshot(&self) -> &[ToolCallRecord] {
        &self.calls
    }

    /// OpenAI-shaped tool calls, `None` when there are none
    pub fn tool_calls(&self) -> Option<Vec<ToolCall>> {
        (!self.calls.is_empty())
            .then(|| self.calls.iter().map(ToolCallRecord::to_tool_call).collect())
    }

    /// Whether any tool call was seen
    pub fn has_calls(&self) -> bool {
        !self.calls.is_empty()
    }

    /// The legacy function call, if one was seen
    pub fn function_call(&self) -> Option<&FunctionCall> {
        self.function_call.as_ref()
    }

    /// Whether a legacy function call was seen
    pub fn has_function_call(&self) -> bool {
        self.function_call.is_some()
    }

    fn slot_for(&mut self, fragment: &ToolCallFragment) -> Option<(usize, bool)> {
        let id = if fragment.id.is_empty() {
            // Anonymous fragments continue the call at their index, else the latest call
            match fragment.index {
                Some(index) => self
                    .calls
                    .iter()
                    .find(|c| c.index == index)
                    .map(|c| c.id.clone())
                    .unwrap_or_else(|| format!("call_{index}")),
                None => self
                    .calls
                    .last()
                    .map(|c| c.id.clone())
                    .unwrap_or_else(|| format!("call_{}", self.calls.len())),
            }
        } else {
            fragment.id.clone()
        };

        if let Some(&slot) = self.by_id.get(&id) {
            return Some((slot, false));
        }
        if !self.parallel && !self.calls.is_empty() {
            debug!(call_id = %id, "ignoring additional tool call, parallel calls disabled");
            return None;
        }

        let slot = self.calls.len();
        self.calls.push(ToolCallRecord {
            id: id.clone(),
            index: slot as u32,
            name: None,
            arguments: String::new(),
        });
        self.by_id.insert(id, slot);
        Some((slot, true))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frag(id: &str, name: Option<&str>, arguments: &str) -> ToolCallFragment {
        ToolCallFragment {
            id: id.to_string(),
            index: None,
            name: name.map(str::to_string),
            arguments: arguments.to_string(),
        }
    }

    #[test]
    fn test_deltas_accumulate() {
        let mut agg = ToolCallAggregator::default();
        assert_eq!(
            agg.ingest_delta(&frag("c1", Some("lookup"), "{\"id\":")),
            Some("c1".to_string())
        );
        assert_eq!(agg.ingest_delta(&frag("c1", None, "\"42\"}")), Some("c1".to_string()));
        let call = agg.get("c1").unwrap();
        assert_eq!(call.arguments, "{\"id\":\"42\"}");
        assert_eq!(call.name.as_deref(), Some("lookup"));
        assert_eq!(call.index, 0);
    }

    #[test]
    fn test_empty_delta_is_not_an_update() {
        let mut agg = ToolCallAggregator::default();
        agg.ingest_delta(&frag("c1", Some("f"), ""));
        assert_eq!(agg.ingest_delta(&frag("c1", None, "")), None);
    }

    #[test]
    fn test_message_extends_streamed_prefix() {
        let mut agg = ToolCallAggregator::default();
        agg.ingest_delta(&frag("c1", Some("f"), "{\"a\""));
        assert_eq!(
            agg.ingest_message(&frag("c1", None, "{\"a\":1}")),
            Some("c1".to_string())
        );
        assert_eq!(agg.get("c1").unwrap().arguments, "{\"a\":1}");
        // Same value again is not a change
        assert_eq!(agg.ingest_message(&frag("c1", None, "{\"a\":1}")), None);
    }

    #[test]
    fn test_diverging_message_replaces_silently() {
        let mut agg = ToolCallAggregator::default();
        agg.ingest_delta(&frag("c1", Some("f"), "{\"a\":1"));
        assert_eq!(agg.ingest_message(&frag("c1", None, "{\"b\":2}")), None);
        assert_eq!(agg.get("c1").unwrap().arguments, "{\"b\":2}");
    }

    #[test]
    fn test_parallel_disabled_keeps_first_call() {
        let mut agg = ToolCallAggregator::new(false);
        agg.ingest_delta(&frag("c1", Some("f"), "{}"));
        assert_eq!(agg.ingest_delta(&frag("c2", Some("g"), "{}")), None);
        assert_eq!(agg.snapshot().len(), 1);
        assert!(!agg.supports_parallel_calls());
    }

    #[test]
    fn test_anonymous_fragments_continue_latest_call() {
        let mut agg = ToolCallAggregator::default();
        agg.ingest_delta(&frag("c1", Some("f"), "{\"x\""));
        agg.ingest_delta(&frag("", None, ":1}"));
        assert_eq!(agg.get("c1").unwrap().arguments, "{\"x\":1}");
    }

    #[test]
    fn test_function_call_and_tool_calls_shape() {
        let mut agg = ToolCallAggregator::default();
        assert!(agg.tool_calls().is_none());
        agg.ingest_function_call("legacy", "{\"q\":");
        agg.ingest_function_call("", "1}");
        let call = agg.function_call().unwrap();
        assert_eq!(call.name.as_deref(), Some("legacy"));
        assert_eq!(call.arguments.as_deref(), Some("{\"q\":1}"));

        agg.ingest_delta(&frag("c1", Some("f"), "{}"));
        agg.ingest_delta(&frag("c2", Some("g"), "{}"));
        let calls = agg.tool_calls().unwrap();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[1].index, 1);
        assert_eq!(calls[1].id.as_deref(), Some("c2"));
    }
}
