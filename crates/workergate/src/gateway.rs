//! Gateway facade
//!
//! Wires one [`Supervisor`] to one [`RpcTransport`] and exposes the two
//! chat completion entry points with client-facing errors.

use crate::completion::{self, CompletionOptions};
use crate::config::GatewayConfig;
use crate::error::ClientError;
use crate::rpc::{ChatTurn, RpcTransport};
use crate::translator::{self, SseStream, StreamOptions};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::{Arc, Mutex};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use workergate_protocol::ChatCompletion;
use workergate_transport::{
    ErrorCode, ShutdownOptions, Supervisor, WorkerHandle, WorkerPhase, WorkerStatus,
};

/// Health probe payload
#[derive(Debug, Clone, Serialize)]
pub struct GatewayHealth {
    /// Worker enabled by configuration
    pub enabled: bool,
    /// Ready for turns
    pub ready: bool,
    /// Worker process live
    pub live: bool,
    /// Turns holding a concurrency permit
    pub active_turns: usize,
    /// Outstanding RPC calls on the current generation
    pub pending_calls: usize,
    /// Supervisor snapshot
    pub worker: WorkerStatus,
    /// When the snapshot was taken
    pub checked_at: DateTime<Utc>,
}

/// OpenAI-compatible front over the supervised worker
pub struct Gateway {
    supervisor: Option<Supervisor>,
    worker: Arc<dyn WorkerHandle>,
    transport: RpcTransport,
    config: GatewayConfig,
    warmup: Mutex<Option<JoinHandle<()>>>,
}

impl Gateway {
    /// Build a gateway that supervises the configured worker command
    ///
    /// Nothing is launched until [`Gateway::start`].
    pub fn new(config: GatewayConfig) -> Result<Self, ClientError> {
        let supervisor = Supervisor::new(config.supervisor.clone())?;
        let worker: Arc<dyn WorkerHandle> = Arc::new(supervisor.clone());
        let transport = RpcTransport::new(Arc::clone(&worker), config.transport.clone());
        Ok(Self {
            supervisor: Some(supervisor),
            worker,
            transport,
            config,
            warmup: Mutex::new(None),
        })
    }

    /// Build a gateway over an externally managed worker
    pub fn with_worker(worker: Arc<dyn WorkerHandle>, config: GatewayConfig) -> Self {
        let transport = RpcTransport::new(Arc::clone(&worker), config.transport.clone());
        Self {
            supervisor: None,
            worker,
            transport,
            config,
            warmup: Mutex::new(None),
        }
    }

    /// Gateway configuration
    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    /// Underlying RPC transport
    pub fn transport(&self) -> &RpcTransport {
        &self.transport
    }

    /// Launch the supervised worker
    ///
    /// Also starts a background task that runs the `initialize` handshake
    /// for every new worker generation, so readiness returns after each
    /// restart without waiting for a client turn. No-op when the worker is
    /// disabled. Must be called from within a tokio runtime.
    pub fn start(&self) -> Result<(), ClientError> {
        if !self.config.transport.worker_enabled {
            info!("worker disabled; gateway will refuse turns");
            return Ok(());
        }
        if let Some(supervisor) = &self.supervisor {
            supervisor.start()?;
        }
        let mut warmup = self.warmup.lock().unwrap_or_else(|p| p.into_inner());
        if warmup.as_ref().is_none_or(JoinHandle::is_finished) {
            *warmup = Some(tokio::spawn(warm_up(
                self.transport.clone(),
                self.worker.subscribe(),
            )));
        }
        Ok(())
    }

    /// Fail in-flight turns and stop the worker
    pub async fn shutdown(&self) -> Result<(), ClientError> {
        if let Some(task) = self.warmup.lock().unwrap_or_else(|p| p.into_inner()).take() {
            task.abort();
        }
        self.transport.destroy();
        if let Some(supervisor) = &self.supervisor {
            supervisor
                .shutdown(ShutdownOptions::with_reason("gateway shutdown"))
                .await?;
        }
        debug!("gateway shut down");
        Ok(())
    }

    /// Snapshot for readiness and liveness probes
    pub fn health(&self) -> GatewayHealth {
        let worker = self.worker.status();
        GatewayHealth {
            enabled: self.config.transport.worker_enabled,
            ready: worker.is_ready(),
            live: worker.is_live(),
            active_turns: self.transport.active_turns(),
            pending_calls: self.transport.pending_calls(),
            worker,
            checked_at: Utc::now(),
        }
    }

    /// Options for a non-stream completion using the gateway's policies
    pub fn completion_options(&self, model: impl Into<String>) -> CompletionOptions {
        CompletionOptions::new(model).with_config(self.config.stream.clone())
    }

    /// Options for a streamed completion using the gateway's policies
    pub fn stream_options(&self, model: impl Into<String>) -> StreamOptions {
        StreamOptions::new(model).with_config(self.config.stream.clone())
    }

    /// Run a turn to completion and return a `chat.completion`
    pub async fn chat_completion(
        &self,
        turn: ChatTurn,
        options: CompletionOptions,
    ) -> Result<ChatCompletion, ClientError> {
        let handle = self.transport.create_chat_request(turn).await?;
        Ok(completion::chat_completion(handle, &options).await?)
    }

    /// Start a turn and stream it as SSE frames
    ///
    /// Failures before the turn starts are returned here; later failures
    /// arrive in-band as an error frame followed by `[DONE]`.
    pub async fn stream_chat_completion(
        &self,
        turn: ChatTurn,
        options: StreamOptions,
    ) -> Result<SseStream, ClientError> {
        let handle = self.transport.create_chat_request(turn).await?;
        Ok(translator::stream_chat_completion(handle, options))
    }
}

/// Handshake each generation once its process is running
async fn warm_up(transport: RpcTransport, mut status: watch::Receiver<WorkerStatus>) {
    let mut attempted = 0;
    loop {
        let generation = {
            let current = status.borrow_and_update();
            (current.phase == WorkerPhase::Running && current.generation > attempted)
                .then_some(current.generation)
        };
        if let Some(generation) = generation {
            attempted = generation;
            match transport.ensure_ready().await {
                Ok(ready) => debug!(generation = ready, "worker warmed up"),
                Err(err) if err.code == ErrorCode::TransportDestroyed => return,
                Err(err) => warn!(generation, code = %err.code, error = %err, "worker warm-up failed"),
            }
            continue;
        }
        if status.changed().await.is_err() {
            return;
        }
    }
}

impl Drop for Gateway {
    fn drop(&mut self) {
        if let Some(task) = self.warmup.get_mut().unwrap_or_else(|p| p.into_inner()).take() {
            task.abort();
        }
    }
}

impl std::fmt::Debug for Gateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Gateway")
            .field("supervised", &self.supervisor.is_some())
            .field("transport", &self.transport)
            .finish_non_exhaustive()
    }
}
