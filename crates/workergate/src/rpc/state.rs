//! Per-generation routing state
//!
//! Everything here is owned by one worker generation and discarded with it:
//! pending calls, active turns, and the three lookup tables that route
//! notifications back to turns.

use super::join::{CompletionJoin, JoinStep};
use super::turn::{TurnEvent, TurnOutcome};
use crate::error::Result;
use serde_json::{Value, json};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::trace;
use workergate_protocol::{BackendEvent, CorrelationKeys, TokenUsage};
use workergate_transport::{ErrorCode, TransportError, WorkerChannel};

/// Local turn identifier
pub(crate) type TurnKey = u64;

/// An in-flight RPC awaiting its response
pub(crate) struct PendingCall {
    pub method: String,
    pub owner: Option<TurnKey>,
    pub reply: oneshot::Sender<Result<Value>>,
}

impl PendingCall {
    pub fn reject(self, err: TransportError) {
        let _ = self.reply.send(Err(err));
    }
}

/// What routing an event into a turn requires next
#[derive(Debug, PartialEq)]
pub(crate) enum SlotStep {
    Continue,
    StartGrace(u64),
    Complete,
    Fail(TransportError),
}

/// Server-side state of one active turn
pub(crate) struct TurnSlot {
    pub request_id: String,
    pub client_conversation_id: String,
    pub conversation_id: Option<String>,
    pub subscription_id: Option<String>,
    events: mpsc::UnboundedSender<TurnEvent>,
    text: String,
    final_message: Option<String>,
    result: Option<Value>,
    usage: TokenUsage,
    finish_reason: Option<String>,
    join: CompletionJoin,
    grace_epoch: u64,
    _permit: OwnedSemaphorePermit,
}

impl TurnSlot {
    pub fn new(
        request_id: String,
        client_conversation_id: String,
        conversation_id: Option<String>,
        events: mpsc::UnboundedSender<TurnEvent>,
        permit: OwnedSemaphorePermit,
    ) -> Self {
        Self {
            request_id,
            client_conversation_id,
            conversation_id,
            subscription_id: None,
            events,
            text: String::new(),
            final_message: None,
            result: None,
            usage: TokenUsage::default(),
            finish_reason: None,
            join: CompletionJoin::new(),
            grace_epoch: 0,
            _permit: permit,
        }
    }

    pub fn emit(&self, event: TurnEvent) {
        // The handle may already be gone
        let _ = self.events.send(event);
    }

    /// Fold an event into the turn and forward it to the mailbox
    pub fn apply(&mut self, event: BackendEvent) -> SlotStep {
        let mut step = JoinStep::Waiting;
        match &event {
            BackendEvent::TextDelta(delta) => self.text.push_str(delta),
            BackendEvent::Message(message) => {
                self.final_message = Some(message.clone());
                step = self.join.message();
            }
            BackendEvent::Usage(usage) => self.usage.merge(*usage),
            BackendEvent::TurnComplete {
                finish_reason,
                result,
            } => {
                self.result = Some(result.clone());
                if finish_reason.is_some() {
                    self.finish_reason = finish_reason.clone();
                }
                step = self.join.result();
            }
            BackendEvent::Error { message, code } => {
                let message = if message.is_empty() {
                    "worker reported an error".to_string()
                } else {
                    message.clone()
                };
                return SlotStep::Fail(
                    TransportError::worker_error(message).with_details(json!({ "code": code })),
                );
            }
            BackendEvent::Other(kind) => {
                trace!(request_id = %self.request_id, kind = %kind, "ignoring backend event");
                return SlotStep::Continue;
            }
            BackendEvent::ToolCallDelta(_)
            | BackendEvent::ToolCallMessage(_)
            | BackendEvent::FunctionCall { .. }
            | BackendEvent::ContentFiltered => {}
        }

        self.emit(TurnEvent::Backend(event));
        match step {
            JoinStep::Waiting => SlotStep::Continue,
            JoinStep::StartGrace => {
                self.grace_epoch += 1;
                SlotStep::StartGrace(self.grace_epoch)
            }
            JoinStep::Complete => SlotStep::Complete,
        }
    }

    /// Whether the grace timer tagged `epoch` completes the turn
    pub fn grace_completes(&self, epoch: u64) -> bool {
        self.grace_epoch == epoch && self.join.grace_elapsed() == JoinStep::Complete
    }

    pub fn outcome(&self) -> TurnOutcome {
        TurnOutcome {
            request_id: self.request_id.clone(),
            conversation_id: self.conversation_id.clone(),
            text: self.text.clone(),
            final_message: self.final_message.clone(),
            result: self.result.clone(),
            usage: self.usage,
            finish_reason: self.finish_reason.clone(),
        }
    }
}

/// State owned by one worker generation
pub(crate) struct Generation {
    pub id: u64,
    pub channel: Arc<WorkerChannel>,
    pub handshake: Option<Value>,
    pub pending: HashMap<u32, PendingCall>,
    pub turns: HashMap<TurnKey, TurnSlot>,
    by_request: HashMap<String, TurnKey>,
    by_client_conversation: HashMap<String, TurnKey>,
    by_conversation: HashMap<String, TurnKey>,
    pub reader: Option<JoinHandle<()>>,
}

impl Generation {
    pub fn new(id: u64, channel: Arc<WorkerChannel>) -> Self {
        Self {
            id,
            channel,
            handshake: None,
            pending: HashMap::new(),
            turns: HashMap::new(),
            by_request: HashMap::new(),
            by_client_conversation: HashMap::new(),
            by_conversation: HashMap::new(),
            reader: None,
        }
    }

    /// Add a turn under its request id, client conversation id, and
    /// conversation id when already known
    pub fn register(&mut self, key: TurnKey, slot: TurnSlot) -> Result<()> {
        if self.by_request.contains_key(&slot.request_id) {
            return Err(TransportError::new(
                ErrorCode::Other,
                format!("request id {} is already active", slot.request_id),
            ));
        }
        if let Some(conversation) = &slot.conversation_id
            && self.by_conversation.contains_key(conversation)
        {
            return Err(conversation_busy(conversation));
        }

        self.by_request.insert(slot.request_id.clone(), key);
        self.by_client_conversation
            .insert(slot.client_conversation_id.clone(), key);
        if let Some(conversation) = &slot.conversation_id {
            self.by_conversation.insert(conversation.clone(), key);
        }
        self.turns.insert(key, slot);
        Ok(())
    }

    /// Bind a worker-assigned conversation id to a turn
    pub fn bind_conversation(&mut self, key: TurnKey, conversation_id: &str) -> Result<()> {
        if self
            .by_conversation
            .get(conversation_id)
            .is_some_and(|&other| other != key)
        {
            return Err(conversation_busy(conversation_id));
        }
        let slot = self
            .turns
            .get_mut(&key)
            .ok_or_else(|| TransportError::aborted("turn is no longer active"))?;
        slot.conversation_id = Some(conversation_id.to_string());
        self.by_conversation.insert(conversation_id.to_string(), key);
        Ok(())
    }

    /// Find the turn a notification belongs to
    ///
    /// Conversation id first (worker-assigned, then client-side), then request
    /// id. When nothing matches and the notification names no conversation,
    /// a single active turn takes it.
    pub fn resolve(&self, keys: &CorrelationKeys) -> Option<TurnKey> {
        if let Some(conversation) = &keys.conversation_id
            && let Some(&key) = self
                .by_conversation
                .get(conversation)
                .or_else(|| self.by_client_conversation.get(conversation))
        {
            return Some(key);
        }
        if let Some(request) = &keys.request_id
            && let Some(&key) = self.by_request.get(request)
        {
            return Some(key);
        }
        if keys.conversation_id.is_none() && self.turns.len() == 1 {
            return self.turns.keys().next().copied();
        }
        None
    }

    /// Remove a turn from every table
    pub fn remove_turn(&mut self, key: TurnKey) -> Option<TurnSlot> {
        let slot = self.turns.remove(&key)?;
        remove_if(&mut self.by_request, &slot.request_id, key);
        remove_if(
            &mut self.by_client_conversation,
            &slot.client_conversation_id,
            key,
        );
        if let Some(conversation) = &slot.conversation_id {
            remove_if(&mut self.by_conversation, conversation, key);
        }
        Some(slot)
    }

    /// Remove pending calls issued on behalf of a turn
    pub fn take_owned_calls(&mut self, key: TurnKey) -> Vec<PendingCall> {
        let ids: Vec<u32> = self
            .pending
            .iter()
            .filter(|(_, call)| call.owner == Some(key))
            .map(|(&id, _)| id)
            .collect();
        ids.into_iter()
            .filter_map(|id| self.pending.remove(&id))
            .collect()
    }

    /// Take every pending call and turn
    pub fn drain(&mut self) -> (Vec<PendingCall>, Vec<TurnSlot>) {
        self.by_request.clear();
        self.by_client_conversation.clear();
        self.by_conversation.clear();
        (
            self.pending.drain().map(|(_, call)| call).collect(),
            self.turns.drain().map(|(_, slot)| slot).collect(),
        )
    }
}

fn remove_if(map: &mut HashMap<String, TurnKey>, name: &str, key: TurnKey) {
    if map.get(name) == Some(&key) {
        map.remove(name);
    }
}

fn conversation_busy(conversation: &str) -> TransportError {
    TransportError::new(
        ErrorCode::WorkerBusy,
        format!("conversation {conversation} already has an active turn"),
    )
}
