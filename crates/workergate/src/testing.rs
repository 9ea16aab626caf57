//! Testing utilities for integration tests
//!
//! Provides an in-memory scripted worker so the RPC transport, translator
//! and gateway can be exercised without spawning a real worker process.

use async_trait::async_trait;
use bytes::Bytes;
use futures::{Stream, StreamExt};
use serde_json::{Value, json};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader, DuplexStream};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use workergate_protocol::methods;
use workergate_transport::{
    ErrorCode, HealthReason, HealthSignal, TransportError, WorkerChannel, WorkerHandle,
    WorkerPhase, WorkerStatus,
};

/// Notification method the scripted worker uses for events
pub const EVENT_METHOD: &str = "codex/event";

/// How the worker answers `initialize`
#[derive(Debug, Clone, Default, PartialEq)]
pub enum HandshakeMode {
    /// Reply with a user agent payload
    #[default]
    Respond,
    /// Reply with a JSON-RPC error
    Fail,
    /// Never reply
    Hang,
}

/// One step of a scripted turn
#[derive(Debug, Clone, PartialEq)]
pub enum ScriptStep {
    /// Emit `msg` as an event on the turn's conversation
    Event(Value),
    /// Emit a raw line verbatim
    Raw(String),
    /// Pause before the next step
    Sleep(Duration),
    /// Exit the current generation
    Crash,
}

/// Steps played back after one turn is acknowledged
#[derive(Debug, Clone, PartialEq)]
pub struct TurnScript {
    steps: Vec<ScriptStep>,
    ack: bool,
}

impl Default for TurnScript {
    fn default() -> Self {
        Self::new()
    }
}

impl TurnScript {
    /// Empty script that acknowledges the turn
    pub fn new() -> Self {
        Self {
            steps: Vec::new(),
            ack: true,
        }
    }

    /// Emit an event body (`{"type": ...}`)
    pub fn event(mut self, msg: Value) -> Self {
        self.steps.push(ScriptStep::Event(msg));
        self
    }

    /// Emit a text delta
    pub fn delta(self, text: &str) -> Self {
        self.event(json!({ "type": "agent_message_delta", "delta": text }))
    }

    /// Emit the final message
    pub fn message(self, text: &str) -> Self {
        self.event(json!({ "type": "agent_message", "message": text }))
    }

    /// Emit the result marker
    pub fn complete(self, finish_reason: Option<&str>) -> Self {
        let msg = match finish_reason {
            Some(reason) => json!({ "type": "task_complete", "finish_reason": reason }),
            None => json!({ "type": "task_complete" }),
        };
        self.event(msg)
    }

    /// Emit a token count
    pub fn usage(self, prompt: u32, completion: u32) -> Self {
        self.event(json!({
            "type": "token_count",
            "usage": { "prompt_tokens": prompt, "completion_tokens": completion }
        }))
    }

    /// Emit a raw line
    pub fn raw(mut self, line: impl Into<String>) -> Self {
        self.steps.push(ScriptStep::Raw(line.into()));
        self
    }

    /// Pause
    pub fn sleep(mut self, duration: Duration) -> Self {
        self.steps.push(ScriptStep::Sleep(duration));
        self
    }

    /// Exit the worker generation at this point
    pub fn crash(mut self) -> Self {
        self.steps.push(ScriptStep::Crash);
        self
    }

    /// Leave the turn request unanswered
    pub fn without_ack(mut self) -> Self {
        self.ack = false;
        self
    }

    /// Deltas, final message and result for `text`
    pub fn reply(text: &str) -> Self {
        Self::new().delta(text).message(text).complete(Some("stop"))
    }
}

struct Generation {
    id: u64,
    channel: Arc<WorkerChannel>,
    outbound: mpsc::UnboundedSender<String>,
    pump: JoinHandle<()>,
}

struct State {
    generation: Option<Generation>,
    last_generation: u64,
    available: bool,
    handshake: HandshakeMode,
    scripts: VecDeque<TurnScript>,
    conversations: u64,
    subscriptions: u64,
    received: Vec<Value>,
    handshakes: Vec<(u64, Result<Value, String>)>,
    status: WorkerStatus,
}

struct Inner {
    state: Mutex<State>,
    status_tx: watch::Sender<WorkerStatus>,
}

/// In-memory worker implementing [`WorkerHandle`]
///
/// Each generation is a duplex pipe plus a pump task that answers the
/// transport's requests. Turns play back queued [`TurnScript`]s in order;
/// with none queued the worker echoes the prompt.
#[derive(Clone)]
pub struct ScriptedWorker {
    inner: Arc<Inner>,
}

impl Default for ScriptedWorker {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptedWorker {
    /// Create a worker that answers the handshake
    pub fn new() -> Self {
        let status = WorkerStatus::not_started(Duration::ZERO);
        let (status_tx, _) = watch::channel(status.clone());
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State {
                    generation: None,
                    last_generation: 0,
                    available: true,
                    handshake: HandshakeMode::Respond,
                    scripts: VecDeque::new(),
                    conversations: 0,
                    subscriptions: 0,
                    received: Vec::new(),
                    handshakes: Vec::new(),
                    status,
                }),
                status_tx,
            }),
        }
    }

    /// Set how `initialize` is answered
    pub fn with_handshake(self, mode: HandshakeMode) -> Self {
        self.set_handshake(mode);
        self
    }

    /// Change how later `initialize` calls are answered
    pub fn set_handshake(&self, mode: HandshakeMode) {
        self.inner.lock().handshake = mode;
    }

    /// Make `acquire_channel` time out while `false`
    pub fn set_available(&self, available: bool) {
        self.inner.lock().available = available;
    }

    /// Queue a script for the next turn
    pub fn push_script(&self, script: TurnScript) {
        self.inner.lock().scripts.push_back(script);
    }

    /// Exit the current generation; the next acquire starts a new one
    pub fn crash(&self) {
        self.inner.crash();
    }

    /// Write a raw JSON value to the transport
    pub fn emit(&self, value: Value) {
        self.inner.send_line(value.to_string());
    }

    /// Emit an event body on `conversation_id`
    pub fn emit_event(&self, conversation_id: &str, msg: Value) {
        self.emit(event_line(conversation_id, msg));
    }

    /// Current generation id, 0 before the first acquire
    pub fn generation(&self) -> u64 {
        self.inner.lock().last_generation
    }

    /// Requests received from the transport, in order
    pub fn requests(&self) -> Vec<Value> {
        self.inner
            .lock()
            .received
            .iter()
            .filter(|v| v.get("method").is_some())
            .cloned()
            .collect()
    }

    /// Requests received for `method`
    pub fn requests_for(&self, method: &str) -> Vec<Value> {
        self.requests()
            .into_iter()
            .filter(|v| v["method"] == method)
            .collect()
    }

    /// Responses the transport sent to worker-initiated requests
    pub fn responses(&self) -> Vec<Value> {
        self.inner
            .lock()
            .received
            .iter()
            .filter(|v| v.get("method").is_none())
            .cloned()
            .collect()
    }

    /// Handshake outcomes reported by the transport, per generation
    pub fn handshakes(&self) -> Vec<(u64, Result<Value, String>)> {
        self.inner.lock().handshakes.clone()
    }

    /// Subscribe to status changes
    pub fn subscribe(&self) -> watch::Receiver<WorkerStatus> {
        self.inner.status_tx.subscribe()
    }
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn publish(&self, state: &State) {
        self.status_tx.send_replace(state.status.clone());
    }

    fn send_line(&self, line: String) {
        if let Some(generation) = &self.lock().generation {
            let _ = generation.outbound.send(line);
        }
    }

    fn send_line_to(&self, generation: u64, line: String) {
        if let Some(current) = self.lock().generation.as_ref().filter(|g| g.id == generation) {
            let _ = current.outbound.send(line);
        }
    }

    fn crash(&self) {
        let mut state = self.lock();
        if let Some(generation) = state.generation.take() {
            generation.pump.abort();
            state.status.phase = WorkerPhase::Exited;
            state.status.pid = None;
            state.status.readiness = HealthSignal::new(false, HealthReason::WorkerExit);
            state.status.liveness = HealthSignal::new(false, HealthReason::WorkerExit);
            state.status.restarts_total += 1;
            self.publish(&state);
        }
    }

    fn launch(self: &Arc<Self>, state: &mut State) -> Arc<WorkerChannel> {
        state.last_generation += 1;
        let id = state.last_generation;
        let (transport_end, worker_end) = tokio::io::duplex(64 * 1024);
        let (outbound, lines) = mpsc::unbounded_channel();
        let channel = Arc::new(WorkerChannel::new(id, transport_end, lines));
        let pump = tokio::spawn(pump(Arc::downgrade(self), id, worker_end));
        state.generation = Some(Generation {
            id,
            channel: Arc::clone(&channel),
            outbound,
            pump,
        });
        state.status.phase = WorkerPhase::Running;
        state.status.generation = id;
        state.status.pid = Some(id as u32);
        state.status.liveness = HealthSignal::new(true, HealthReason::WorkerStarting);
        state.status.readiness = HealthSignal::new(false, HealthReason::WorkerStarting);
        self.publish(state);
        channel
    }

    fn handle_request(self: &Arc<Self>, generation: u64, request: Value) {
        let id = request.get("id").cloned().unwrap_or(Value::Null);
        let method = request["method"].as_str().unwrap_or_default().to_string();
        let params = request.get("params").cloned().unwrap_or(Value::Null);

        let reply = match method.as_str() {
            methods::INITIALIZE => match self.lock().handshake.clone() {
                HandshakeMode::Respond => Some(Ok(json!({ "userAgent": "scripted-worker/1.0" }))),
                HandshakeMode::Fail => Some(Err("initialize refused")),
                HandshakeMode::Hang => None,
            },
            methods::NEW_CONVERSATION => {
                let mut state = self.lock();
                state.conversations += 1;
                Some(Ok(json!({ "conversationId": format!("conv-{}", state.conversations) })))
            }
            methods::ADD_CONVERSATION_LISTENER => {
                let mut state = self.lock();
                state.subscriptions += 1;
                Some(Ok(json!({ "subscriptionId": format!("sub-{}", state.subscriptions) })))
            }
            methods::REMOVE_CONVERSATION_LISTENER => Some(Ok(json!({}))),
            methods::SEND_USER_TURN | methods::SEND_USER_MESSAGE => {
                self.start_turn(generation, id.clone(), &params);
                None
            }
            _ => Some(Err("unknown method")),
        };

        if let Some(reply) = reply {
            self.send_line_to(generation, response_line(id, reply));
        }
    }

    fn start_turn(self: &Arc<Self>, generation: u64, id: Value, params: &Value) {
        let conversation_id = params["conversationId"].as_str().unwrap_or_default().to_string();
        let prompt = params
            .pointer("/items/0/data/text")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let script = self
            .lock()
            .scripts
            .pop_front()
            .unwrap_or_else(|| TurnScript::reply(&prompt));

        if script.ack {
            self.send_line_to(generation, response_line(id, Ok(json!({}))));
        }
        let inner = Arc::clone(self);
        tokio::spawn(async move {
            for step in script.steps {
                match step {
                    ScriptStep::Event(msg) => {
                        inner.send_line_to(generation, event_line(&conversation_id, msg).to_string())
                    }
                    ScriptStep::Raw(line) => inner.send_line_to(generation, line),
                    ScriptStep::Sleep(duration) => tokio::time::sleep(duration).await,
                    ScriptStep::Crash => {
                        inner.crash();
                        return;
                    }
                }
            }
        });
    }
}

async fn pump(weak: std::sync::Weak<Inner>, generation: u64, worker_end: DuplexStream) {
    let mut lines = BufReader::new(worker_end).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        let Some(inner) = weak.upgrade() else {
            return;
        };
        let Ok(value) = serde_json::from_str::<Value>(&line) else {
            continue;
        };
        inner.lock().received.push(value.clone());
        if value.get("method").is_some() && value.get("id").is_some() {
            inner.handle_request(generation, value);
        }
    }
}

fn response_line(id: Value, outcome: Result<Value, &str>) -> String {
    match outcome {
        Ok(result) => json!({ "jsonrpc": "2.0", "id": id, "result": result }),
        Err(message) => json!({
            "jsonrpc": "2.0",
            "id": id,
            "error": { "code": -32000, "message": message }
        }),
    }
    .to_string()
}

fn event_line(conversation_id: &str, msg: Value) -> Value {
    json!({
        "jsonrpc": "2.0",
        "method": EVENT_METHOD,
        "params": { "conversationId": conversation_id, "msg": msg }
    })
}

#[async_trait]
impl WorkerHandle for ScriptedWorker {
    async fn acquire_channel(&self, timeout: Duration) -> workergate_transport::Result<Arc<WorkerChannel>> {
        {
            let mut state = self.inner.lock();
            if state.available {
                if let Some(generation) = &state.generation {
                    return Ok(Arc::clone(&generation.channel));
                }
                return Ok(self.inner.launch(&mut state));
            }
        }
        tokio::time::sleep(timeout).await;
        Err(TransportError::new(
            ErrorCode::WorkerNotReady,
            format!("no worker channel after {}ms", timeout.as_millis()),
        ))
    }

    fn record_handshake_pending(&self, generation: u64) {
        let mut state = self.inner.lock();
        if state.status.generation == generation {
            state.status.readiness = HealthSignal::new(false, HealthReason::HandshakePending);
            self.inner.publish(&state);
        }
    }

    fn record_handshake_success(&self, generation: u64, payload: Value) {
        let mut state = self.inner.lock();
        state.handshakes.push((generation, Ok(payload.clone())));
        if state.status.generation == generation {
            state.status.phase = WorkerPhase::Ready;
            state.status.readiness =
                HealthSignal::new(true, HealthReason::HandshakeComplete).with_details(payload.clone());
            state.status.handshake = Some(payload);
            self.inner.publish(&state);
        }
    }

    fn record_handshake_failure(&self, generation: u64, reason: &str) {
        let mut state = self.inner.lock();
        state.handshakes.push((generation, Err(reason.to_string())));
        if state.status.generation == generation {
            state.status.readiness = HealthSignal::new(false, HealthReason::HandshakeFailed)
                .with_details(json!({ "reason": reason }));
            self.inner.publish(&state);
        }
    }

    fn status(&self) -> WorkerStatus {
        self.inner.lock().status.clone()
    }

    fn subscribe(&self) -> watch::Receiver<WorkerStatus> {
        ScriptedWorker::subscribe(self)
    }
}

impl std::fmt::Debug for ScriptedWorker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.lock();
        f.debug_struct("ScriptedWorker")
            .field("generation", &state.last_generation)
            .field("queued_scripts", &state.scripts.len())
            .finish_non_exhaustive()
    }
}

/// Collect an SSE byte stream into its `data:` payloads
///
/// Keepalive comments are skipped; `[DONE]` is kept verbatim.
pub async fn collect_sse<S>(stream: S) -> Vec<String>
where
    S: Stream<Item = Bytes>,
{
    let frames: Vec<Bytes> = stream.collect().await;
    frames
        .iter()
        .flat_map(|frame| {
            String::from_utf8_lossy(frame)
                .lines()
                .filter_map(|line| line.strip_prefix("data: ").map(str::to_string))
                .collect::<Vec<_>>()
        })
        .collect()
}

/// Parse collected SSE payloads, dropping `[DONE]`
pub fn sse_json(payloads: &[String]) -> Vec<Value> {
    payloads
        .iter()
        .filter(|p| p.as_str() != "[DONE]")
        .filter_map(|p| serde_json::from_str(p).ok())
        .collect()
}

/// Concatenate the streamed `delta.content` of chunk payloads
pub fn streamed_content(chunks: &[Value]) -> String {
    chunks
        .iter()
        .filter_map(|c| c.pointer("/choices/0/delta/content").and_then(Value::as_str))
        .collect()
}
