//! JSON-RPC transport over the worker's stdio
//!
//! One reader task per worker generation decodes inbound lines and routes
//! them: responses resolve pending calls, notifications land in the owning
//! turn's mailbox, and worker-initiated requests are refused. When a
//! generation's output closes, everything it owned fails with
//! `worker_exited` and the next turn handshakes with the new generation.

use super::state::{Generation, PendingCall, SlotStep, TurnKey, TurnSlot};
use super::turn::{ChatTurn, TurnEvent, TurnHandle};
use crate::config::{TransportConfig, TurnMethod};
use crate::error::Result;
use serde_json::{Map, Value, json};
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;
use tokio::sync::{Semaphore, mpsc, oneshot};
use tracing::{debug, info, trace, warn};
use uuid::Uuid;
use workergate_protocol::rpc::METHOD_NOT_FOUND;
use workergate_protocol::{
    BackendNotification, IncomingMessage, RpcErrorObject, RpcNotification, RpcRequest,
    RpcResponse, methods,
};
use workergate_transport::{ErrorCode, TransportError, WorkerHandle};

/// Request ids stay below 2^31
const ID_MASK: u32 = 0x7FFF_FFFF;

struct State {
    current: Option<Generation>,
    /// Highest generation already torn down; its channel is never reused
    retired: u64,
}

#[derive(Default)]
struct HandshakeSlot {
    last_failure: Option<TransportError>,
}

pub(crate) struct Shared {
    worker: Arc<dyn WorkerHandle>,
    config: TransportConfig,
    permits: Arc<Semaphore>,
    next_id: AtomicU32,
    next_turn: AtomicU64,
    destroyed: AtomicBool,
    state: Mutex<State>,
    handshake: tokio::sync::Mutex<HandshakeSlot>,
    handshake_attempts: AtomicU64,
}

/// Multiplexes concurrent turns over one worker
#[derive(Clone)]
pub struct RpcTransport {
    shared: Arc<Shared>,
}

impl RpcTransport {
    /// Create a transport over `worker`
    pub fn new(worker: Arc<dyn WorkerHandle>, config: TransportConfig) -> Self {
        let permits = Arc::new(Semaphore::new(config.max_concurrent_turns));
        Self {
            shared: Arc::new(Shared {
                worker,
                config,
                permits,
                next_id: AtomicU32::new(1),
                next_turn: AtomicU64::new(1),
                destroyed: AtomicBool::new(false),
                state: Mutex::new(State {
                    current: None,
                    retired: 0,
                }),
                handshake: tokio::sync::Mutex::new(HandshakeSlot::default()),
                handshake_attempts: AtomicU64::new(0),
            }),
        }
    }

    /// Transport settings
    pub fn config(&self) -> &TransportConfig {
        &self.shared.config
    }

    /// Number of active turns
    pub fn active_turns(&self) -> usize {
        self.shared.config.max_concurrent_turns - self.shared.permits.available_permits()
    }

    /// Number of RPCs awaiting a response on the current generation
    pub fn pending_calls(&self) -> usize {
        self.shared
            .state()
            .current
            .as_ref()
            .map_or(0, |g| g.pending.len())
    }

    /// Handshake payload of the current generation, once initialized
    pub fn handshake(&self) -> Option<Value> {
        self.shared
            .state()
            .current
            .as_ref()
            .and_then(|g| g.handshake.clone())
    }

    /// Make sure the current generation has completed `initialize`
    ///
    /// Concurrent callers share one in-flight attempt and all see its result.
    pub async fn ensure_ready(&self) -> Result<u64> {
        self.shared.ensure_ready().await
    }

    /// Start a turn
    ///
    /// Fails fast with `worker_busy` at the concurrency cap. Otherwise waits
    /// for the handshake, opens or adopts a conversation, sends the user's
    /// message, and returns the handle whose mailbox receives the turn's
    /// events.
    pub async fn create_chat_request(&self, turn: ChatTurn) -> Result<TurnHandle> {
        let shared = &self.shared;
        shared.check_open()?;
        if !shared.config.worker_enabled {
            return Err(TransportError::new(
                ErrorCode::WorkerDisabled,
                "worker is disabled by configuration",
            ));
        }

        let permit = Arc::clone(&shared.permits)
            .try_acquire_owned()
            .map_err(|_| {
                TransportError::new(
                    ErrorCode::WorkerBusy,
                    format!(
                        "{} turns already active",
                        shared.config.max_concurrent_turns
                    ),
                )
            })?;

        let generation = shared.ensure_ready().await?;

        let key = shared.next_turn.fetch_add(1, Ordering::Relaxed);
        let request_id = turn
            .request_id
            .clone()
            .unwrap_or_else(|| format!("req_{}", Uuid::new_v4().simple()));
        let client_conversation_id = Uuid::new_v4().to_string();
        let (tx, rx) = mpsc::unbounded_channel();
        let slot = TurnSlot::new(
            request_id.clone(),
            client_conversation_id.clone(),
            turn.conversation_id.clone(),
            tx,
            permit,
        );
        shared.with_generation(generation, |g| g.register(key, slot))?;

        // Dropping the handle on any error below cancels the turn
        let mut handle = TurnHandle::new(
            Arc::clone(shared),
            generation,
            key,
            request_id,
            client_conversation_id,
            rx,
            shared.config.turn_timeout,
        );

        let conversation_id = match &turn.conversation_id {
            Some(id) => id.clone(),
            None => shared.open_conversation(generation, key, &turn).await?,
        };
        handle.conversation_id = Some(conversation_id.clone());

        debug!(
            request_id = %handle.request_id(),
            conversation_id = %conversation_id,
            generation,
            "turn started"
        );
        shared.send_turn(generation, key, conversation_id, turn);
        Ok(handle)
    }

    /// Tear everything down; every pending call and turn fails with
    /// `transport_destroyed` and later turns are refused
    pub fn destroy(&self) {
        self.shared.destroy();
    }
}

impl std::fmt::Debug for RpcTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcTransport")
            .field("active_turns", &self.active_turns())
            .field("config", &self.shared.config)
            .finish_non_exhaustive()
    }
}

impl Shared {
    fn state(&self) -> MutexGuard<'_, State> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn check_open(&self) -> Result<()> {
        if self.destroyed.load(Ordering::Acquire) {
            Err(destroyed())
        } else {
            Ok(())
        }
    }

    /// Run `f` against `generation` if it is still current
    fn with_generation<T>(
        &self,
        generation: u64,
        f: impl FnOnce(&mut Generation) -> Result<T>,
    ) -> Result<T> {
        let mut state = self.state();
        match state.current.as_mut() {
            Some(g) if g.id == generation => f(g),
            _ => Err(TransportError::worker_exited(format!(
                "worker generation {generation} is gone"
            ))),
        }
    }

    /// The attached generation, if it is handshaken and still the worker's live one
    fn ready_generation(&self) -> Option<u64> {
        let worker = self.worker.status();
        if !worker.phase.has_process() {
            return None;
        }
        self.state()
            .current
            .as_ref()
            .filter(|g| g.handshake.is_some() && g.id == worker.generation)
            .map(|g| g.id)
    }

    async fn ensure_ready(self: &Arc<Self>) -> Result<u64> {
        if let Some(generation) = self.ready_generation() {
            return Ok(generation);
        }

        let seen = self.handshake_attempts.load(Ordering::Acquire);
        let mut slot = self.handshake.lock().await;
        if let Some(generation) = self.ready_generation() {
            return Ok(generation);
        }
        // An attempt finished while we waited: share its failure
        if self.handshake_attempts.load(Ordering::Acquire) != seen
            && let Some(err) = &slot.last_failure
        {
            return Err(err.clone());
        }
        self.check_open()?;

        let result = self.handshake_once().await;
        slot.last_failure = result.as_ref().err().cloned();
        self.handshake_attempts.fetch_add(1, Ordering::Release);
        result
    }

    async fn handshake_once(self: &Arc<Self>) -> Result<u64> {
        let channel = self
            .worker
            .acquire_channel(self.config.ready_timeout)
            .await?;
        let generation = self.install(channel)?;
        self.worker.record_handshake_pending(generation);

        let params = json!({
            "clientInfo": {
                "name": self.config.client_name,
                "version": self.config.client_version,
            }
        });
        let outcome = self
            .call(
                generation,
                methods::INITIALIZE,
                params,
                None,
                self.config.handshake_timeout,
                ErrorCode::HandshakeTimeout,
            )
            .await;

        match outcome {
            Ok(payload) => {
                self.with_generation(generation, |g| {
                    g.handshake = Some(payload.clone());
                    Ok(())
                })?;
                self.worker.record_handshake_success(generation, payload);
                info!(generation, "worker handshake complete");
                Ok(generation)
            }
            Err(err) => {
                let err = match err.code {
                    ErrorCode::HandshakeTimeout | ErrorCode::TransportDestroyed => err,
                    _ => {
                        let mut failed = TransportError::new(
                            ErrorCode::HandshakeFailed,
                            format!("initialize failed: {}", err.message),
                        );
                        failed.details = err.details;
                        failed
                    }
                };
                self.worker.record_handshake_failure(generation, &err.message);
                warn!(generation, error = %err, "worker handshake failed");
                Err(err)
            }
        }
    }

    /// Adopt `channel` as the current generation, starting its reader
    fn install(self: &Arc<Self>, channel: Arc<workergate_transport::WorkerChannel>) -> Result<u64> {
        let generation = channel.generation();
        let mut state = self.state();
        if state.current.as_ref().is_some_and(|g| g.id == generation) {
            return Ok(generation);
        }
        if generation <= state.retired {
            return Err(TransportError::worker_exited(format!(
                "worker generation {generation} already exited"
            )));
        }

        let previous = state.current.take();
        let mut current = Generation::new(generation, Arc::clone(&channel));
        match channel.take_lines() {
            Some(lines) => {
                current.reader = Some(tokio::spawn(read_loop(
                    Arc::downgrade(self),
                    generation,
                    lines,
                )));
            }
            None => warn!(generation, "worker output already claimed by another reader"),
        }
        state.current = Some(current);
        if let Some(previous) = &previous {
            state.retired = state.retired.max(previous.id);
        }
        drop(state);

        debug!(generation, "attached to worker generation");
        if let Some(previous) = previous {
            fail_generation(previous, TransportError::worker_exited("worker restarted"));
        }
        Ok(generation)
    }

    /// Send one request and wait for its response
    async fn call(
        self: &Arc<Self>,
        generation: u64,
        method: &str,
        params: Value,
        owner: Option<TurnKey>,
        timeout: Duration,
        timeout_code: ErrorCode,
    ) -> Result<Value> {
        self.check_open()?;
        let (tx, rx) = oneshot::channel();
        let (id, channel) = self.with_generation(generation, |g| {
            let id = self.allocate_id(g);
            g.pending.insert(
                id,
                PendingCall {
                    method: method.to_string(),
                    owner,
                    reply: tx,
                },
            );
            Ok((id, Arc::clone(&g.channel)))
        })?;

        let sent = match RpcRequest::new(id, method, params).to_line() {
            Ok(line) => {
                trace!(id, method, generation, "sending request");
                channel.send_line(&line).await
            }
            Err(err) => Err(err.into()),
        };
        if let Err(err) = sent {
            self.forget_call(generation, id);
            return Err(err);
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(TransportError::worker_exited(format!(
                "{method} abandoned by worker generation {generation}"
            ))),
            Err(_) => {
                self.forget_call(generation, id);
                debug!(id, method, generation, "request timed out");
                Err(TransportError::new(
                    timeout_code,
                    format!("{method} timed out after {}ms", timeout.as_millis()),
                ))
            }
        }
    }

    fn allocate_id(&self, generation: &Generation) -> u32 {
        loop {
            let id = self.next_id.fetch_add(1, Ordering::Relaxed) & ID_MASK;
            if id != 0 && !generation.pending.contains_key(&id) {
                return id;
            }
        }
    }

    fn forget_call(&self, generation: u64, id: u32) {
        let _ = self.with_generation(generation, |g| {
            g.pending.remove(&id);
            Ok(())
        });
    }

    async fn open_conversation(
        self: &Arc<Self>,
        generation: u64,
        key: TurnKey,
        turn: &ChatTurn,
    ) -> Result<String> {
        let mut params = Map::new();
        if let Some(model) = &turn.model {
            params.insert("model".to_string(), Value::String(model.clone()));
        }
        let created = self
            .call(
                generation,
                methods::NEW_CONVERSATION,
                Value::Object(params),
                Some(key),
                self.config.request_timeout,
                ErrorCode::WorkerRequestTimeout,
            )
            .await?;
        let conversation_id = string_field(&created, &["conversationId", "conversation_id"])
            .ok_or_else(|| {
                TransportError::new(
                    ErrorCode::Other,
                    "newConversation response carried no conversation id",
                )
                .with_details(created.clone())
            })?;
        self.with_generation(generation, |g| g.bind_conversation(key, &conversation_id))?;

        let listener = self
            .call(
                generation,
                methods::ADD_CONVERSATION_LISTENER,
                json!({ "conversationId": conversation_id }),
                Some(key),
                self.config.request_timeout,
                ErrorCode::WorkerRequestTimeout,
            )
            .await?;
        let subscription = string_field(&listener, &["subscriptionId", "subscription_id"]);
        self.with_generation(generation, |g| {
            if let Some(slot) = g.turns.get_mut(&key) {
                slot.subscription_id = subscription;
            }
            Ok(())
        })?;

        Ok(conversation_id)
    }

    /// Send the user's message; the acknowledgement arrives in the background
    fn send_turn(self: &Arc<Self>, generation: u64, key: TurnKey, conversation_id: String, turn: ChatTurn) {
        let method = self.config.turn_method;
        let mut params = Map::new();
        params.insert("conversationId".to_string(), Value::String(conversation_id));
        params.insert(
            "items".to_string(),
            json!([{ "type": "text", "data": { "text": turn.prompt } }]),
        );
        if method == TurnMethod::SendUserTurn
            && let Some(model) = turn.model
        {
            params.insert("model".to_string(), Value::String(model));
        }
        params.extend(turn.params);

        let shared = Arc::clone(self);
        let timeout = self.config.request_timeout;
        tokio::spawn(async move {
            let sent = shared
                .call(
                    generation,
                    method.method(),
                    Value::Object(params),
                    Some(key),
                    timeout,
                    ErrorCode::WorkerRequestTimeout,
                )
                .await;
            if let Err(err) = sent
                && err.code != ErrorCode::RequestAborted
            {
                shared.abort_turn(generation, key, err);
            }
        });
    }

    /// End a turn with `err`, rejecting the calls it still has in flight
    pub(crate) fn abort_turn(self: &Arc<Self>, generation: u64, key: TurnKey, err: TransportError) {
        let removed = {
            let mut state = self.state();
            match state.current.as_mut() {
                Some(g) if g.id == generation => g
                    .remove_turn(key)
                    .map(|slot| (slot, g.take_owned_calls(key))),
                _ => None,
            }
        };
        let Some((mut slot, calls)) = removed else {
            return;
        };

        debug!(
            request_id = %slot.request_id,
            code = %err.code,
            pending = calls.len(),
            "turn aborted"
        );
        for call in calls {
            call.reject(err.clone());
        }
        slot.emit(TurnEvent::Failed(err));
        self.detach_listener(generation, slot.subscription_id.take());
    }

    /// Resolve a finished turn
    ///
    /// Calls the turn still owns (an unacknowledged `sendUserTurn`) are
    /// released so they stop counting as pending.
    fn complete_turn(self: &Arc<Self>, generation: u64, mut slot: TurnSlot, calls: Vec<PendingCall>) {
        for call in calls {
            call.reject(TransportError::aborted("turn already complete"));
        }
        let outcome = slot.outcome();
        debug!(
            request_id = %outcome.request_id,
            conversation_id = ?outcome.conversation_id,
            finish_reason = ?outcome.finish_reason,
            "turn complete"
        );
        slot.emit(TurnEvent::End(outcome));
        self.detach_listener(generation, slot.subscription_id.take());
    }

    /// Best-effort `removeConversationListener`
    fn detach_listener(self: &Arc<Self>, generation: u64, subscription: Option<String>) {
        let Some(subscription) = subscription else {
            return;
        };
        let shared = Arc::clone(self);
        spawn_detached(async move {
            let removed = shared
                .call(
                    generation,
                    methods::REMOVE_CONVERSATION_LISTENER,
                    json!({ "subscriptionId": subscription }),
                    None,
                    shared.config.request_timeout,
                    ErrorCode::WorkerRequestTimeout,
                )
                .await;
            if let Err(err) = removed {
                debug!(subscription = %subscription, error = %err, "failed to remove conversation listener");
            }
        });
    }

    fn dispatch_line(self: &Arc<Self>, generation: u64, line: &str) {
        let line = line.trim();
        if line.is_empty() {
            return;
        }
        match IncomingMessage::parse_line(line) {
            Ok(IncomingMessage::Response { id, outcome }) => {
                self.resolve_call(generation, id, outcome)
            }
            Ok(IncomingMessage::Notification(notification)) => {
                self.route(generation, &notification)
            }
            Ok(IncomingMessage::Request { id, method, .. }) => {
                self.refuse_request(generation, id, &method)
            }
            Err(err) => debug!(generation, error = %err, "ignoring non-protocol worker output"),
        }
    }

    fn resolve_call(
        &self,
        generation: u64,
        id: u32,
        outcome: std::result::Result<Value, RpcErrorObject>,
    ) {
        let call = self
            .with_generation(generation, |g| Ok(g.pending.remove(&id)))
            .ok()
            .flatten();
        let Some(call) = call else {
            debug!(id, generation, "response for unknown request id");
            return;
        };

        let result = outcome.map_err(|error| {
            trace!(id, method = %call.method, code = error.code, "worker returned an error");
            TransportError::worker_error(error.message.clone()).with_details(json!({
                "code": error.code,
                "data": error.data,
            }))
        });
        let _ = call.reply.send(result);
    }

    fn refuse_request(&self, generation: u64, id: Value, method: &str) {
        let Ok(channel) = self.with_generation(generation, |g| Ok(Arc::clone(&g.channel))) else {
            return;
        };
        debug!(generation, method, "refusing worker-initiated request");
        let response = RpcResponse::error(
            id,
            RpcErrorObject::new(METHOD_NOT_FOUND, format!("method not supported: {method}")),
        );
        match response.to_line() {
            Ok(line) => spawn_detached(async move {
                if let Err(err) = channel.send_line(&line).await {
                    debug!(error = %err, "failed to answer worker request");
                }
            }),
            Err(err) => warn!(error = %err, "failed to encode refusal"),
        }
    }

    fn route(self: &Arc<Self>, generation: u64, notification: &RpcNotification) {
        let decoded = BackendNotification::from_notification(notification);
        let kind = decoded.event.kind().to_string();

        let mut state = self.state();
        let Some(g) = state.current.as_mut().filter(|g| g.id == generation) else {
            return;
        };
        let Some(key) = g.resolve(&decoded.keys) else {
            warn!(
                method = %notification.method,
                kind = %kind,
                conversation_id = ?decoded.keys.conversation_id,
                request_id = ?decoded.keys.request_id,
                "dropping notification with no matching turn"
            );
            return;
        };
        let Some(slot) = g.turns.get_mut(&key) else {
            return;
        };

        trace!(request_id = %slot.request_id, kind = %kind, "routing event");
        match slot.apply(decoded.event) {
            SlotStep::Continue => {}
            SlotStep::StartGrace(epoch) => {
                drop(state);
                self.start_grace(generation, key, epoch);
            }
            SlotStep::Complete => {
                let removed = g
                    .remove_turn(key)
                    .map(|slot| (slot, g.take_owned_calls(key)));
                drop(state);
                if let Some((slot, calls)) = removed {
                    self.complete_turn(generation, slot, calls);
                }
            }
            SlotStep::Fail(err) => {
                drop(state);
                self.abort_turn(generation, key, err);
            }
        }
    }

    fn start_grace(self: &Arc<Self>, generation: u64, key: TurnKey, epoch: u64) {
        let shared = Arc::downgrade(self);
        let grace = self.config.completion_grace;
        tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            if let Some(shared) = shared.upgrade() {
                shared.grace_elapsed(generation, key, epoch);
            }
        });
    }

    fn grace_elapsed(self: &Arc<Self>, generation: u64, key: TurnKey, epoch: u64) {
        let slot = {
            let mut state = self.state();
            match state.current.as_mut() {
                Some(g) if g.id == generation => {
                    let completes = g.turns.get(&key).is_some_and(|s| s.grace_completes(epoch));
                    if completes {
                        g.remove_turn(key)
                            .map(|slot| (slot, g.take_owned_calls(key)))
                    } else {
                        None
                    }
                }
                _ => None,
            }
        };
        if let Some((slot, calls)) = slot {
            debug!(request_id = %slot.request_id, "completing turn without final message");
            self.complete_turn(generation, slot, calls);
        }
    }

    fn teardown(&self, generation: u64, err: TransportError) {
        let current = {
            let mut state = self.state();
            match state.current.as_ref() {
                Some(g) if g.id == generation => {
                    state.retired = state.retired.max(generation);
                    state.current.take()
                }
                _ => None,
            }
        };
        if let Some(current) = current {
            fail_generation(current, err);
        }
    }

    fn destroy(&self) {
        if self.destroyed.swap(true, Ordering::AcqRel) {
            return;
        }
        let current = {
            let mut state = self.state();
            let current = state.current.take();
            if let Some(g) = &current {
                state.retired = state.retired.max(g.id);
            }
            current
        };
        if let Some(current) = current {
            fail_generation(current, destroyed());
        }
        info!("transport destroyed");
    }
}

/// Fail everything a generation owned
fn fail_generation(mut generation: Generation, err: TransportError) {
    if let Some(reader) = generation.reader.take() {
        reader.abort();
    }
    let (calls, turns) = generation.drain();
    if !calls.is_empty() || !turns.is_empty() {
        warn!(
            generation = generation.id,
            pending = calls.len(),
            turns = turns.len(),
            error = %err,
            "failing in-flight work"
        );
    }
    for call in calls {
        call.reject(err.clone());
    }
    for slot in turns {
        slot.emit(TurnEvent::Failed(err.clone()));
    }
}

async fn read_loop(shared: Weak<Shared>, generation: u64, mut lines: mpsc::UnboundedReceiver<String>) {
    while let Some(line) = lines.recv().await {
        let Some(shared) = shared.upgrade() else {
            return;
        };
        shared.dispatch_line(generation, &line);
    }

    if let Some(shared) = shared.upgrade() {
        debug!(generation, "worker output closed");
        shared.teardown(
            generation,
            TransportError::worker_exited(format!("worker generation {generation} exited")),
        );
    }
}

fn destroyed() -> TransportError {
    TransportError::new(ErrorCode::TransportDestroyed, "transport destroyed")
}

fn spawn_detached(task: impl Future<Output = ()> + Send + 'static) {
    match tokio::runtime::Handle::try_current() {
        Ok(runtime) => {
            runtime.spawn(task);
        }
        Err(_) => debug!("no runtime available for background cleanup"),
    }
}

fn string_field(value: &Value, names: &[&str]) -> Option<String> {
    names.iter().find_map(|name| match value.get(*name)? {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::ScriptedWorker;
    use workergate_transport::WorkerChannel;

    fn transport() -> RpcTransport {
        RpcTransport::new(Arc::new(ScriptedWorker::new()), TransportConfig::new())
    }

    fn generation() -> Generation {
        let (writer, _reader) = tokio::io::duplex(64);
        let (_tx, lines) = mpsc::unbounded_channel();
        Generation::new(1, Arc::new(WorkerChannel::new(1, writer, lines)))
    }

    fn pending_call() -> PendingCall {
        let (reply, _rx) = oneshot::channel();
        PendingCall {
            method: methods::SEND_USER_TURN.to_string(),
            owner: None,
            reply,
        }
    }

    #[test]
    fn test_request_ids_wrap_below_2_pow_31() {
        let transport = transport();
        let shared = &transport.shared;
        let g = generation();

        shared.next_id.store(ID_MASK - 1, Ordering::Relaxed);
        assert_eq!(shared.allocate_id(&g), ID_MASK - 1);
        assert_eq!(shared.allocate_id(&g), ID_MASK);
        // 2^31 masks to 0, which is never handed out
        assert_eq!(shared.allocate_id(&g), 1);
        assert_eq!(shared.allocate_id(&g), 2);
    }

    #[test]
    fn test_request_ids_wrap_from_u32_max() {
        let transport = transport();
        let shared = &transport.shared;
        let g = generation();

        shared.next_id.store(u32::MAX, Ordering::Relaxed);
        assert_eq!(shared.allocate_id(&g), ID_MASK);
        assert_eq!(shared.allocate_id(&g), 1);
        for _ in 0..1_000 {
            let id = shared.allocate_id(&g);
            assert!(id > 0 && id < 1 << 31);
        }
    }

    #[test]
    fn test_request_ids_skip_pending() {
        let transport = transport();
        let shared = &transport.shared;
        let mut g = generation();
        g.pending.insert(1, pending_call());
        g.pending.insert(2, pending_call());

        shared.next_id.store(ID_MASK, Ordering::Relaxed);
        assert_eq!(shared.allocate_id(&g), ID_MASK);
        assert_eq!(shared.allocate_id(&g), 3);
    }
}
