//! Worker handle trait and the per-generation stdio channel
//!
//! The supervisor owns the process; the RPC layer only sees a
//! [`WorkerChannel`] for the current generation plus narrow hooks for
//! reporting handshake outcome.

use crate::error::Result;
use crate::subprocess::health::WorkerStatus;
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::{Mutex, mpsc, watch};

/// Duplex line channel to one worker generation
///
/// Writes are serialized so concurrent turns never interleave partial lines.
/// Inbound lines are consumed by exactly one reader, which takes the receiver
/// once via [`WorkerChannel::take_lines`].
pub struct WorkerChannel {
    generation: u64,
    writer: Mutex<Box<dyn AsyncWrite + Send + Unpin>>,
    lines: std::sync::Mutex<Option<mpsc::UnboundedReceiver<String>>>,
}

impl WorkerChannel {
    /// Create a channel over an arbitrary writer and a line feed
    pub fn new(
        generation: u64,
        writer: impl AsyncWrite + Send + Unpin + 'static,
        lines: mpsc::UnboundedReceiver<String>,
    ) -> Self {
        Self {
            generation,
            writer: Mutex::new(Box::new(writer)),
            lines: std::sync::Mutex::new(Some(lines)),
        }
    }

    /// Worker generation this channel belongs to
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Write one line, appending `\n` if missing, then flush
    pub async fn send_line(&self, line: &str) -> Result<()> {
        let mut writer = self.writer.lock().await;
        writer.write_all(line.as_bytes()).await?;
        if !line.ends_with('\n') {
            writer.write_all(b"\n").await?;
        }
        writer.flush().await?;
        Ok(())
    }

    /// Take the inbound line receiver; `None` once already taken
    pub fn take_lines(&self) -> Option<mpsc::UnboundedReceiver<String>> {
        self.lines
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()
    }
}

impl std::fmt::Debug for WorkerChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerChannel")
            .field("generation", &self.generation)
            .finish_non_exhaustive()
    }
}

/// Narrow view of the supervised worker used by the RPC layer
#[async_trait]
pub trait WorkerHandle: Send + Sync {
    /// Wait until a live generation has a channel, up to `timeout`
    ///
    /// Fails with `worker_not_ready` on timeout and `worker_unavailable` when
    /// the worker is stopped or has exhausted its restart budget.
    async fn acquire_channel(&self, timeout: Duration) -> Result<Arc<WorkerChannel>>;

    /// The `initialize` exchange for `generation` has started
    fn record_handshake_pending(&self, generation: u64);

    /// The `initialize` exchange for `generation` succeeded
    fn record_handshake_success(&self, generation: u64, payload: Value);

    /// The `initialize` exchange for `generation` failed
    fn record_handshake_failure(&self, generation: u64, reason: &str);

    /// Non-blocking health snapshot
    fn status(&self) -> WorkerStatus;

    /// Receiver that observes every published snapshot
    fn subscribe(&self) -> watch::Receiver<WorkerStatus>;
}

#[async_trait]
impl<T: WorkerHandle + ?Sized> WorkerHandle for Arc<T> {
    async fn acquire_channel(&self, timeout: Duration) -> Result<Arc<WorkerChannel>> {
        (**self).acquire_channel(timeout).await
    }

    fn record_handshake_pending(&self, generation: u64) {
        (**self).record_handshake_pending(generation)
    }

    fn record_handshake_success(&self, generation: u64, payload: Value) {
        (**self).record_handshake_success(generation, payload)
    }

    fn record_handshake_failure(&self, generation: u64, reason: &str) {
        (**self).record_handshake_failure(generation, reason)
    }

    fn status(&self) -> WorkerStatus {
        (**self).status()
    }

    fn subscribe(&self) -> watch::Receiver<WorkerStatus> {
        (**self).subscribe()
    }
}
