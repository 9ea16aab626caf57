//! Streaming translation state machine
//!
//! Turns backend events into `chat.completion.chunk` frames. The stream moves
//! through three phases: pending (nothing sent), streaming (role chunk sent),
//! closed (finish or error chunk plus `[DONE]` sent). Nothing is emitted once
//! closed.
//!
//! Text is scanned for `<use_tool>` blocks as it accumulates. Partial blocks
//! are withheld, and the stop-after-tools policy decides whether the stream
//! is cut after the first block, after a quiet period following a burst of
//! blocks, or not at all.

use super::finish::FinishResolver;
use super::sse::SseFrame;
use super::tool_blocks::ToolBlockScanner;
use crate::aggregator::ToolCallAggregator;
use crate::config::{StopAfterTools, StreamConfig};
use crate::error::ClientError;
use crate::rpc::TurnOutcome;
use crate::sanitize::{self, SanitizeContext, TextSanitizer};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;
use uuid::Uuid;
use workergate_protocol::openai::ASSISTANT_ROLE;
use workergate_protocol::{
    BackendEvent, ChatCompletionChunk, ChunkDelta, FinishReason, FunctionCall, TokenUsage,
    unix_now,
};
use workergate_transport::{ErrorCode, TransportError};

/// Per-request streaming options
#[derive(Clone)]
pub struct StreamOptions {
    /// Model echoed in every chunk
    pub model: String,
    /// Send a usage chunk before `[DONE]`
    pub include_usage: bool,
    /// Completion id; generated when absent
    pub completion_id: Option<String>,
    /// Translator policies
    pub config: StreamConfig,
    /// Applied to every forwarded text segment
    pub sanitizer: Arc<dyn TextSanitizer>,
}

impl StreamOptions {
    /// Options for `model` with default policies
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            include_usage: false,
            completion_id: None,
            config: StreamConfig::default(),
            sanitizer: sanitize::passthrough(),
        }
    }

    /// Request a trailing usage chunk
    pub fn with_include_usage(mut self, include: bool) -> Self {
        self.include_usage = include;
        self
    }

    /// Use a fixed completion id
    pub fn with_completion_id(mut self, id: impl Into<String>) -> Self {
        self.completion_id = Some(id.into());
        self
    }

    /// Replace the translator policies
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

impl std::fmt::Debug for StreamOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamOptions")
            .field("model", &self.model)
            .field("include_usage", &self.include_usage)
            .field("completion_id", &self.completion_id)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

/// Stream phase
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Nothing sent yet
    Pending,
    /// Role chunk sent
    Streaming,
    /// Terminal frames sent
    Closed,
}

/// What the driver must do after a step
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamAction {
    /// Keep going
    Continue,
    /// (Re)arm the burst cutoff timer
    ArmCutoff(Duration),
    /// The stream was cut; stop the backend turn
    Cut,
}

/// Frames produced by one step plus the follow-up action
#[derive(Debug, Clone, PartialEq)]
pub struct Step {
    /// Frames to send, in order
    pub frames: Vec<SseFrame>,
    /// Follow-up
    pub action: StreamAction,
}

impl Step {
    fn new(frames: Vec<SseFrame>) -> Self {
        Self {
            frames,
            action: StreamAction::Continue,
        }
    }
}

/// Translator for one streamed completion
pub struct StreamTranslator {
    id: String,
    created: i64,
    model: String,
    phase: Phase,
    emitted: String,
    forwarded: usize,
    scanner: ToolBlockScanner,
    tool_calls: ToolCallAggregator,
    finish: FinishResolver,
    usage: TokenUsage,
    include_usage: bool,
    config: StreamConfig,
    sanitizer: Arc<dyn TextSanitizer>,
    context: SanitizeContext,
    streamed_output: bool,
}

impl StreamTranslator {
    /// Create a translator
    pub fn new(options: &StreamOptions) -> Self {
        let id = options
            .completion_id
            .clone()
            .unwrap_or_else(|| format!("chatcmpl-{}", Uuid::new_v4().simple()));
        Self {
            context: SanitizeContext {
                completion_id: id.clone(),
                model: options.model.clone(),
            },
            id,
            created: unix_now(),
            model: options.model.clone(),
            phase: Phase::Pending,
            emitted: String::new(),
            forwarded: 0,
            scanner: ToolBlockScanner::new(),
            tool_calls: ToolCallAggregator::new(options.config.parallel_tool_calls),
            finish: FinishResolver::new(),
            usage: TokenUsage::default(),
            include_usage: options.include_usage,
            config: options.config.clone(),
            sanitizer: Arc::clone(&options.sanitizer),
            streamed_output: false,
        }
    }

    /// Completion id shared by every chunk
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Current phase
    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Whether terminal frames were sent
    pub fn is_closed(&self) -> bool {
        self.phase == Phase::Closed
    }

    /// Text accepted from the backend so far
    pub fn emitted(&self) -> &str {
        &self.emitted
    }

    /// Bytes of emitted text already forwarded
    pub fn forwarded(&self) -> usize {
        self.forwarded
    }

    /// Announce the assistant role; only the first call emits anything
    pub fn start(&mut self) -> Vec<SseFrame> {
        if self.phase != Phase::Pending {
            return Vec::new();
        }
        self.phase = Phase::Streaming;
        vec![self.chunk(
            ChunkDelta {
                role: Some(ASSISTANT_ROLE.to_string()),
                ..Default::default()
            },
            None,
        )]
    }

    /// Apply one backend event
    pub fn on_event(&mut self, event: BackendEvent) -> Step {
        let mut frames = self.start();
        if self.phase != Phase::Streaming {
            return Step::new(frames);
        }

        match event {
            BackendEvent::TextDelta(delta) => {
                self.emitted.push_str(&delta);
                return self.advance(frames);
            }
            BackendEvent::Message(message) => {
                if self.absorb_message(&message) {
                    return self.advance(frames);
                }
            }
            BackendEvent::ToolCallDelta(fragment) => {
                if let Some(id) = self.tool_calls.ingest_delta(&fragment) {
                    frames.extend(self.tool_call_chunk(&id));
                }
            }
            BackendEvent::ToolCallMessage(fragment) => {
                if let Some(id) = self.tool_calls.ingest_message(&fragment) {
                    frames.extend(self.tool_call_chunk(&id));
                }
            }
            BackendEvent::FunctionCall { name, arguments } => {
                self.tool_calls.ingest_function_call(&name, &arguments);
                self.streamed_output = true;
                frames.push(self.chunk(
                    ChunkDelta {
                        function_call: Some(FunctionCall {
                            name: (!name.is_empty()).then_some(name),
                            arguments: Some(arguments),
                        }),
                        ..Default::default()
                    },
                    None,
                ));
            }
            BackendEvent::Usage(usage) => self.usage.merge(usage),
            BackendEvent::ContentFiltered => self.finish.record_content_filter(),
            BackendEvent::TurnComplete { finish_reason, .. } => {
                self.finish.record_terminal(finish_reason.as_deref());
            }
            BackendEvent::Error { .. } | BackendEvent::Other(_) => {}
        }
        Step::new(frames)
    }

    /// The burst cutoff timer elapsed
    pub fn on_cutoff(&mut self) -> Vec<SseFrame> {
        if self.phase != Phase::Streaming {
            return Vec::new();
        }
        debug!(
            completion_id = %self.id,
            blocks = self.scanner.block_count(),
            "tool burst settled, cutting stream"
        );
        self.close()
    }

    /// The turn completed
    pub fn on_end(&mut self, outcome: &TurnOutcome) -> Vec<SseFrame> {
        let mut frames = self.start();
        if self.phase != Phase::Streaming {
            return frames;
        }

        self.usage.merge(outcome.usage);
        if !self.finish.saw_terminal() && outcome.result.is_some() {
            self.finish.record_terminal(outcome.finish_reason.as_deref());
        }
        if let Some(message) = &outcome.final_message {
            self.absorb_message(message);
        }

        let step = self.advance(Vec::new());
        frames.extend(step.frames);
        if step.action == StreamAction::Cut {
            return frames;
        }

        // Release whatever is still held unless tool tails are suppressed
        if !(self.config.withholds_tail() && self.scanner.block_count() > 0) {
            let end = self.emitted.len();
            self.forward_to(end, &mut frames);
        }
        frames.extend(self.close());
        frames
    }

    /// The turn failed
    ///
    /// A worker exit after output was streamed finishes the stream (the
    /// missing terminal signal resolves to `length`); anything else ends it
    /// with an error chunk.
    pub fn on_error(&mut self, err: &TransportError) -> Vec<SseFrame> {
        if self.phase == Phase::Closed {
            return Vec::new();
        }
        if err.code == ErrorCode::WorkerExited && self.streamed_output {
            return self.close();
        }

        debug!(completion_id = %self.id, error = %err, "stream failed");
        self.phase = Phase::Closed;
        vec![SseFrame::Error(ClientError::from(err)), SseFrame::Done]
    }

    /// Keepalive comment while streaming
    pub fn keepalive(&self) -> Option<SseFrame> {
        (self.phase != Phase::Closed).then(SseFrame::keepalive)
    }

    fn absorb_message(&mut self, message: &str) -> bool {
        match message.strip_prefix(self.emitted.as_str()) {
            Some(rest) if !rest.is_empty() => {
                self.emitted.push_str(rest);
                true
            }
            Some(_) => false,
            None => {
                debug!(completion_id = %self.id, "final message diverges from streamed text");
                false
            }
        }
    }

    fn advance(&mut self, mut frames: Vec<SseFrame>) -> Step {
        let halt_first = self.config.stop_after_tools == StopAfterTools::First;
        let new_blocks = self
            .scanner
            .scan(&self.emitted, halt_first, self.config.max_tool_blocks);
        let capped = self
            .config
            .max_tool_blocks
            .is_some_and(|max| self.scanner.block_count() >= max);
        let cut = new_blocks > 0 && (halt_first || capped);

        let end = self
            .scanner
            .safe_end(self.emitted.len(), cut || self.config.withholds_tail())
            .max(self.forwarded);
        self.forward_to(end, &mut frames);

        if new_blocks == 0 {
            return Step::new(frames);
        }
        debug!(
            completion_id = %self.id,
            blocks = self.scanner.block_count(),
            "tool block complete"
        );

        if cut {
            frames.extend(self.close());
            return Step {
                frames,
                action: StreamAction::Cut,
            };
        }
        match self.config.stop_after_tools {
            StopAfterTools::Burst { grace } => Step {
                frames,
                action: StreamAction::ArmCutoff(grace),
            },
            _ => Step::new(frames),
        }
    }

    fn forward_to(&mut self, end: usize, frames: &mut Vec<SseFrame>) {
        if end <= self.forwarded {
            return;
        }
        let segment = &self.emitted[self.forwarded..end];
        let text = sanitize::apply(self.sanitizer.as_ref(), segment, &self.context);
        self.forwarded = end;
        if text.is_empty() {
            return;
        }
        self.streamed_output = true;
        frames.push(self.chunk(
            ChunkDelta {
                content: Some(text),
                ..Default::default()
            },
            None,
        ));
    }

    fn tool_call_chunk(&mut self, id: &str) -> Option<SseFrame> {
        let call = self.tool_calls.get(id)?.to_tool_call();
        self.streamed_output = true;
        Some(self.chunk(
            ChunkDelta {
                tool_calls: Some(vec![call]),
                ..Default::default()
            },
            None,
        ))
    }

    fn close(&mut self) -> Vec<SseFrame> {
        if self.phase == Phase::Closed {
            return Vec::new();
        }
        self.phase = Phase::Closed;

        let reason = self.finish.resolve(
            self.tool_calls.has_calls() || self.scanner.block_count() > 0,
            self.tool_calls.has_function_call(),
        );
        debug!(completion_id = %self.id, finish_reason = %reason, "stream finished");

        let mut frames = vec![self.chunk(ChunkDelta::default(), Some(reason))];
        if self.include_usage {
            frames.push(SseFrame::Data(ChatCompletionChunk::usage_only(
                self.id.clone(),
                self.created,
                self.model.clone(),
                self.usage.into(),
            )));
        }
        frames.push(SseFrame::Done);
        frames
    }

    fn chunk(&self, delta: ChunkDelta, finish_reason: Option<FinishReason>) -> SseFrame {
        SseFrame::Data(ChatCompletionChunk::with_delta(
            self.id.clone(),
            self.created,
            self.model.clone(),
            delta,
            finish_reason,
        ))
    }
}

impl std::fmt::Debug for StreamTranslator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamTranslator")
            .field("id", &self.id)
            .field("phase", &self.phase)
            .field("emitted", &self.emitted.len())
            .field("forwarded", &self.forwarded)
            .field("blocks", &self.scanner.block_count())
            .finish_non_exhaustive()
    }
}
