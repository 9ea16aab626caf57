//! Worker supervisor
//!
//! Owns the lifecycle of the single backend worker process: launch, crash
//! detection, restart with backoff, graceful shutdown, and the health snapshot
//! every other component reads.
//!
//! State lives behind one mutex and is published through a
//! [`tokio::sync::watch`] channel after every transition, so [`Supervisor::status`]
//! never blocks and waiters are woken without polling.

use crate::error::{ErrorCode, Result, TransportError};
use crate::subprocess::backoff::RestartBackoff;
use crate::subprocess::health::{ExitInfo, HealthReason, HealthSignal, WorkerPhase, WorkerStatus};
use crate::subprocess::process::{ProcessConfig, ReadyProbe, SpawnedWorker, spawn_worker};
use crate::traits::{WorkerChannel, WorkerHandle};
use async_trait::async_trait;
use regex::Regex;
use serde_json::{Value, json};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;
use tokio::process::Child;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Supervisor configuration
#[derive(Clone, Debug)]
pub struct SupervisorConfig {
    /// How to spawn the worker
    pub process: ProcessConfig,

    /// Restarts allowed before giving up permanently
    pub max_restarts: u32,

    /// First restart delay
    pub initial_backoff: Duration,

    /// Restart delay cap
    pub max_backoff: Duration,

    /// Time allowed for a graceful exit before a forceful kill
    pub shutdown_grace: Duration,

    /// Regex matched against worker output lines to signal readiness
    pub ready_pattern: Option<String>,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            process: ProcessConfig::default(),
            max_restarts: 5,
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(30),
            shutdown_grace: Duration::from_secs(5),
            ready_pattern: None,
        }
    }
}

impl SupervisorConfig {
    /// Create a configuration for the given process
    pub fn new(process: ProcessConfig) -> Self {
        Self {
            process,
            ..Default::default()
        }
    }

    /// Set the restart budget
    pub fn with_max_restarts(mut self, max_restarts: u32) -> Self {
        self.max_restarts = max_restarts;
        self
    }

    /// Set the backoff bounds
    pub fn with_backoff(mut self, initial: Duration, max: Duration) -> Self {
        self.initial_backoff = initial;
        self.max_backoff = max;
        self
    }

    /// Set the shutdown grace period
    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }

    /// Set the readiness pattern
    pub fn with_ready_pattern(mut self, pattern: impl Into<String>) -> Self {
        self.ready_pattern = Some(pattern.into());
        self
    }
}

/// Signal used to ask the worker to exit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ShutdownSignal {
    /// SIGTERM
    #[default]
    Terminate,
    /// SIGINT
    Interrupt,
    /// SIGKILL, no grace period
    Kill,
}

/// Options for [`Supervisor::shutdown`]
#[derive(Debug, Clone, Default)]
pub struct ShutdownOptions {
    /// Signal to send first
    pub signal: ShutdownSignal,
    /// Free-form reason, logged and recorded in the readiness details
    pub reason: Option<String>,
}

impl ShutdownOptions {
    /// Shutdown with a reason
    pub fn with_reason(reason: impl Into<String>) -> Self {
        Self {
            reason: Some(reason.into()),
            ..Default::default()
        }
    }
}

struct ShutdownRequest {
    signal: ShutdownSignal,
    grace: Duration,
}

struct Inner {
    status: WorkerStatus,
    backoff: RestartBackoff,
    channel: Option<Arc<WorkerChannel>>,
    shutdown_tx: Option<oneshot::Sender<ShutdownRequest>>,
    monitor: Option<JoinHandle<()>>,
}

struct Shared {
    config: SupervisorConfig,
    ready_pattern: Option<Regex>,
    inner: Mutex<Inner>,
    status_tx: watch::Sender<WorkerStatus>,
}

/// Supervises the single backend worker process
///
/// Cheap to clone; all clones share one process.
#[derive(Clone)]
pub struct Supervisor {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for Supervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Supervisor")
            .field("command", &self.shared.config.process.command)
            .field("status", &*self.shared.status_tx.borrow())
            .finish()
    }
}

impl Supervisor {
    /// Create a supervisor; nothing is launched until [`Supervisor::start`]
    pub fn new(config: SupervisorConfig) -> Result<Self> {
        let ready_pattern = config
            .ready_pattern
            .as_deref()
            .map(Regex::new)
            .transpose()
            .map_err(|e| {
                TransportError::new(ErrorCode::Other, format!("invalid ready pattern: {e}"))
            })?;

        let backoff = RestartBackoff::new(config.initial_backoff, config.max_backoff);
        let status = WorkerStatus::not_started(backoff.peek());
        let (status_tx, _) = watch::channel(status.clone());

        Ok(Self {
            shared: Arc::new(Shared {
                config,
                ready_pattern,
                inner: Mutex::new(Inner {
                    status,
                    backoff,
                    channel: None,
                    shutdown_tx: None,
                    monitor: None,
                }),
                status_tx,
            }),
        })
    }

    /// Launch the worker
    ///
    /// Idempotent while a process is running or a restart is scheduled.
    /// Must be called from within a tokio runtime.
    pub fn start(&self) -> Result<()> {
        let mut inner = self.shared.lock();
        match inner.status.phase {
            WorkerPhase::Launching
            | WorkerPhase::Running
            | WorkerPhase::Ready
            | WorkerPhase::Exited
            | WorkerPhase::Restarting => Ok(()),
            WorkerPhase::Draining => Err(TransportError::unavailable(
                "worker shutdown in progress",
            )),
            WorkerPhase::Failed
                if inner.status.liveness.reason == HealthReason::RestartLimitExceeded =>
            {
                Err(TransportError::unavailable("worker restart limit exceeded")
                    .with_retryable(false))
            }
            WorkerPhase::NotStarted | WorkerPhase::Stopped | WorkerPhase::Failed => {
                match self.shared.launch(&mut inner) {
                    Ok(()) => Ok(()),
                    Err(err) => {
                        error!(error = %err, "worker failed to launch");
                        inner.status.phase = WorkerPhase::Failed;
                        inner.status.liveness = HealthSignal::new(false, HealthReason::SpawnFailed)
                            .with_details(json!({ "error": err.message }));
                        self.shared.publish(&inner);
                        Err(err)
                    }
                }
            }
        }
    }

    /// Wait until the worker is ready, up to `timeout`
    ///
    /// Has no effect on the process; fails with `worker_not_ready` when the
    /// timeout elapses and `worker_unavailable` if the worker gives up.
    pub async fn wait_for_ready(&self, timeout: Duration) -> Result<WorkerStatus> {
        let mut rx = self.shared.status_tx.subscribe();
        let waited = tokio::time::timeout(
            timeout,
            rx.wait_for(|s| {
                s.readiness.ok || matches!(s.phase, WorkerPhase::Failed | WorkerPhase::Stopped)
            }),
        )
        .await;

        match waited {
            Ok(Ok(status)) => {
                let status = status.clone();
                if status.readiness.ok {
                    Ok(status)
                } else {
                    Err(unavailable_for(&status))
                }
            }
            Ok(Err(_)) => Err(TransportError::unavailable("supervisor dropped")),
            Err(_) => Err(TransportError::new(
                ErrorCode::WorkerNotReady,
                format!("worker not ready after {}ms", timeout.as_millis()),
            )),
        }
    }

    /// Stop the worker
    ///
    /// Idempotent. Sends the requested signal, waits the configured grace
    /// period, then kills. Concurrent callers all return once the process is
    /// gone.
    pub async fn shutdown(&self, options: ShutdownOptions) -> Result<()> {
        let taken = {
            let mut inner = self.shared.lock();
            match inner.status.phase {
                WorkerPhase::NotStarted | WorkerPhase::Stopped | WorkerPhase::Failed => {
                    return Ok(());
                }
                WorkerPhase::Draining => None,
                _ => {
                    inner.status.phase = WorkerPhase::Draining;
                    let mut readiness = HealthSignal::new(false, HealthReason::ShutdownRequested);
                    if let Some(reason) = &options.reason {
                        readiness = readiness.with_details(json!({ "reason": reason }));
                    }
                    inner.status.readiness = readiness;
                    inner.channel = None;
                    self.shared.publish(&inner);
                    Some((inner.shutdown_tx.take(), inner.monitor.take()))
                }
            }
        };

        let Some((shutdown_tx, monitor)) = taken else {
            let mut rx = self.shared.status_tx.subscribe();
            let _ = rx.wait_for(|s| s.phase != WorkerPhase::Draining).await;
            return Ok(());
        };

        info!(
            reason = options.reason.as_deref().unwrap_or("unspecified"),
            signal = ?options.signal,
            "worker shutdown requested"
        );

        match (shutdown_tx, monitor) {
            (Some(tx), Some(monitor)) => {
                let request = ShutdownRequest {
                    signal: options.signal,
                    grace: self.shared.config.shutdown_grace,
                };
                if tx.send(request).is_err() {
                    debug!("worker monitor already finished");
                }
                let _ = monitor.await;
            }
            // No live process: a restart was pending, cancel it.
            (_, Some(monitor)) => {
                monitor.abort();
                let _ = monitor.await;
            }
            _ => {}
        }

        let mut inner = self.shared.lock();
        inner.status.phase = WorkerPhase::Stopped;
        inner.status.pid = None;
        inner.status.liveness = HealthSignal::new(false, HealthReason::ShutdownComplete);
        inner.status.readiness = HealthSignal::new(false, HealthReason::ShutdownComplete);
        inner.channel = None;
        inner.shutdown_tx = None;
        self.shared.publish(&inner);
        info!(generation = inner.status.generation, "worker shutdown complete");
        Ok(())
    }

    /// Non-blocking health snapshot
    pub fn status(&self) -> WorkerStatus {
        self.shared.status_tx.borrow().clone()
    }

    /// Subscribe to health snapshots
    pub fn subscribe(&self) -> watch::Receiver<WorkerStatus> {
        self.shared.status_tx.subscribe()
    }

    /// Supervisor configuration
    pub fn config(&self) -> &SupervisorConfig {
        &self.shared.config
    }
}

#[async_trait]
impl WorkerHandle for Supervisor {
    async fn acquire_channel(&self, timeout: Duration) -> Result<Arc<WorkerChannel>> {
        let deadline = tokio::time::Instant::now() + timeout;
        let mut rx = self.shared.status_tx.subscribe();
        loop {
            {
                let inner = self.shared.lock();
                if let Some(channel) = &inner.channel
                    && inner.status.phase.has_process()
                {
                    return Ok(Arc::clone(channel));
                }
                if inner.status.phase.is_terminal() {
                    return Err(unavailable_for(&inner.status));
                }
            }

            match tokio::time::timeout_at(deadline, rx.changed()).await {
                Ok(Ok(())) => continue,
                Ok(Err(_)) => return Err(TransportError::unavailable("supervisor dropped")),
                Err(_) => {
                    return Err(TransportError::new(
                        ErrorCode::WorkerNotReady,
                        format!("no worker channel after {}ms", timeout.as_millis()),
                    ));
                }
            }
        }
    }

    fn record_handshake_pending(&self, generation: u64) {
        let mut inner = self.shared.lock();
        if inner.status.generation != generation || !inner.status.phase.has_process() {
            return;
        }
        inner.status.phase = WorkerPhase::Running;
        inner.status.readiness = HealthSignal::new(false, HealthReason::HandshakePending);
        self.shared.publish(&inner);
    }

    fn record_handshake_success(&self, generation: u64, payload: Value) {
        self.shared
            .mark_ready(generation, HealthReason::HandshakeComplete, Some(payload));
    }

    fn record_handshake_failure(&self, generation: u64, reason: &str) {
        let mut inner = self.shared.lock();
        if inner.status.generation != generation || !inner.status.phase.has_process() {
            return;
        }
        warn!(generation, reason, "worker handshake failed");
        inner.status.phase = WorkerPhase::Running;
        inner.status.readiness = HealthSignal::new(false, HealthReason::HandshakeFailed)
            .with_details(json!({ "reason": reason }));
        self.shared.publish(&inner);
    }

    fn status(&self) -> WorkerStatus {
        Supervisor::status(self)
    }

    fn subscribe(&self) -> watch::Receiver<WorkerStatus> {
        Supervisor::subscribe(self)
    }
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn publish(&self, inner: &Inner) {
        let mut status = inner.status.clone();
        status.next_backoff = inner.backoff.peek();
        self.status_tx.send_replace(status);
    }

    /// Spawn a new generation. Caller holds the lock.
    fn launch(self: &Arc<Self>, inner: &mut Inner) -> Result<()> {
        inner.status.generation += 1;
        let generation = inner.status.generation;
        inner.status.phase = WorkerPhase::Launching;
        self.publish(inner);

        let probe = self.ready_pattern.clone().map(|pattern| {
            let weak = Arc::downgrade(self);
            ReadyProbe::new(pattern, move || {
                if let Some(shared) = weak.upgrade() {
                    shared.mark_ready(generation, HealthReason::ReadySignal, None);
                }
            })
        });

        let SpawnedWorker {
            child,
            pid,
            channel,
        } = spawn_worker(&self.config.process, generation, probe)?;

        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        inner.status.pid = pid;
        inner.status.phase = WorkerPhase::Running;
        inner.status.liveness = HealthSignal::new(true, HealthReason::WorkerStarting);
        inner.status.readiness = HealthSignal::new(false, HealthReason::WorkerStarting);
        inner.status.handshake = None;
        inner.channel = Some(channel);
        inner.shutdown_tx = Some(shutdown_tx);
        inner.monitor = Some(tokio::spawn(monitor(
            Arc::downgrade(self),
            child,
            generation,
            shutdown_rx,
        )));
        self.publish(inner);

        info!(generation, pid, "worker launched");
        Ok(())
    }

    fn mark_ready(&self, generation: u64, reason: HealthReason, payload: Option<Value>) {
        let mut inner = self.lock();
        if inner.status.generation != generation || !inner.status.phase.has_process() {
            return;
        }
        if inner.status.readiness.ok && reason == HealthReason::ReadySignal {
            return;
        }

        let mut readiness = HealthSignal::new(true, reason);
        if let Some(payload) = &payload {
            readiness = readiness.with_details(payload.clone());
            inner.status.handshake = Some(payload.clone());
        }
        inner.status.phase = WorkerPhase::Ready;
        inner.status.readiness = readiness;
        inner.status.consecutive_failures = 0;
        inner.backoff.reset();
        self.publish(&inner);

        info!(generation, reason = ?reason, "worker ready");
    }

    /// Record an exit of `generation`; returns the relaunch delay, if any.
    fn handle_exit(&self, generation: u64, exit: ExitInfo, reason: HealthReason) -> Option<Duration> {
        let mut inner = self.lock();
        if inner.status.generation != generation {
            return None;
        }

        inner.channel = None;
        inner.shutdown_tx = None;
        inner.status.pid = None;
        inner.status.last_exit = Some(exit.clone());
        if inner.status.phase == WorkerPhase::Draining {
            return None;
        }

        inner.status.phase = WorkerPhase::Exited;
        inner.status.restarts_total = inner.status.restarts_total.saturating_add(1);
        inner.status.consecutive_failures = inner.status.consecutive_failures.saturating_add(1);
        inner.status.readiness = HealthSignal::new(false, HealthReason::WorkerExit);
        inner.status.liveness = HealthSignal::new(false, reason);
        self.publish(&inner);

        if inner.status.restarts_total > self.config.max_restarts {
            inner.status.phase = WorkerPhase::Failed;
            inner.status.liveness = HealthSignal::new(false, HealthReason::RestartLimitExceeded);
            self.publish(&inner);
            error!(
                generation,
                exit = %exit,
                restarts_total = inner.status.restarts_total,
                "worker restart limit exceeded; giving up"
            );
            return None;
        }

        let delay = inner.backoff.schedule();
        inner.status.phase = WorkerPhase::Restarting;
        self.publish(&inner);
        warn!(
            generation,
            exit = %exit,
            restarts_total = inner.status.restarts_total,
            delay_ms = delay.as_millis() as u64,
            "worker exited; scheduling restart"
        );
        Some(delay)
    }
}

fn unavailable_for(status: &WorkerStatus) -> TransportError {
    let err = TransportError::unavailable(format!(
        "worker unavailable ({:?}, {:?})",
        status.phase, status.liveness.reason
    ));
    if status.phase == WorkerPhase::Failed {
        err.with_retryable(false)
    } else {
        err
    }
}

async fn monitor(
    weak: Weak<Shared>,
    mut child: Child,
    generation: u64,
    shutdown_rx: oneshot::Receiver<ShutdownRequest>,
) {
    tokio::select! {
        status = child.wait() => {
            let exit = match status {
                Ok(status) => ExitInfo::from_status(&status),
                Err(e) => {
                    warn!(generation, error = %e, "failed to collect worker exit status");
                    ExitInfo::unknown()
                }
            };
            let delay = match weak.upgrade() {
                Some(shared) => shared.handle_exit(generation, exit, HealthReason::WorkerExit),
                None => None,
            };
            if let Some(delay) = delay {
                restart_loop(weak, generation, delay).await;
            }
        }
        request = shutdown_rx => {
            // Sender dropped means the supervisor itself is gone.
            let request = request.unwrap_or(ShutdownRequest {
                signal: ShutdownSignal::Kill,
                grace: Duration::ZERO,
            });
            let exit = terminate(&mut child, request).await;
            debug!(generation, exit = %exit, "worker terminated");
            if let Some(shared) = weak.upgrade() {
                shared.lock().status.last_exit = Some(exit);
            }
        }
    }
}

async fn restart_loop(weak: Weak<Shared>, mut generation: u64, mut delay: Duration) {
    loop {
        tokio::time::sleep(delay).await;
        let Some(shared) = weak.upgrade() else {
            return;
        };

        let failed_generation = {
            let mut inner = shared.lock();
            if inner.status.phase != WorkerPhase::Restarting || inner.status.generation != generation
            {
                return;
            }
            match shared.launch(&mut inner) {
                Ok(()) => return,
                Err(err) => {
                    warn!(error = %err, "worker relaunch failed");
                    inner.status.generation
                }
            }
        };

        match shared.handle_exit(failed_generation, ExitInfo::unknown(), HealthReason::SpawnFailed) {
            Some(next) => {
                generation = failed_generation;
                delay = next;
            }
            None => return,
        }
    }
}

async fn terminate(child: &mut Child, request: ShutdownRequest) -> ExitInfo {
    if request.signal == ShutdownSignal::Kill || !send_signal(child, request.signal) {
        let _ = child.start_kill();
    }

    match tokio::time::timeout(request.grace, child.wait()).await {
        Ok(Ok(status)) => ExitInfo::from_status(&status),
        Ok(Err(e)) => {
            warn!(error = %e, "failed to wait for worker exit");
            ExitInfo::unknown()
        }
        Err(_) => {
            warn!(
                grace_ms = request.grace.as_millis() as u64,
                "worker ignored shutdown signal; killing"
            );
            if let Err(e) = child.kill().await {
                warn!(error = %e, "failed to kill worker");
            }
            match child.try_wait() {
                Ok(Some(status)) => ExitInfo::from_status(&status),
                _ => ExitInfo::unknown(),
            }
        }
    }
}

#[cfg(unix)]
fn send_signal(child: &Child, signal: ShutdownSignal) -> bool {
    use nix::sys::signal::{Signal, kill};
    use nix::unistd::Pid;

    let Some(raw) = child.id().and_then(|pid| i32::try_from(pid).ok()) else {
        return false;
    };
    let signal = match signal {
        ShutdownSignal::Terminate => Signal::SIGTERM,
        ShutdownSignal::Interrupt => Signal::SIGINT,
        ShutdownSignal::Kill => Signal::SIGKILL,
    };
    kill(Pid::from_raw(raw), signal).is_ok()
}

#[cfg(not(unix))]
fn send_signal(_child: &Child, _signal: ShutdownSignal) -> bool {
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_builder() {
        let config = SupervisorConfig::new(ProcessConfig::new("worker"))
            .with_max_restarts(2)
            .with_backoff(Duration::from_millis(10), Duration::from_millis(40))
            .with_shutdown_grace(Duration::from_millis(100))
            .with_ready_pattern("ready");

        assert_eq!(config.max_restarts, 2);
        assert_eq!(config.initial_backoff, Duration::from_millis(10));
        assert_eq!(config.max_backoff, Duration::from_millis(40));
        assert_eq!(config.ready_pattern.as_deref(), Some("ready"));
    }

    #[test]
    fn test_invalid_ready_pattern() {
        let config = SupervisorConfig::default().with_ready_pattern("(");
        assert!(Supervisor::new(config).is_err());
    }

    #[tokio::test]
    async fn test_initial_status() {
        let supervisor = Supervisor::new(SupervisorConfig::default()).unwrap();
        let status = supervisor.status();
        assert_eq!(status.phase, WorkerPhase::NotStarted);
        assert_eq!(status.generation, 0);
        assert_eq!(status.next_backoff, Duration::from_millis(500));
    }

    #[tokio::test]
    async fn test_shutdown_before_start_is_noop() {
        let supervisor = Supervisor::new(SupervisorConfig::default()).unwrap();
        supervisor.shutdown(ShutdownOptions::default()).await.unwrap();
        assert_eq!(supervisor.status().phase, WorkerPhase::NotStarted);
    }

    #[tokio::test]
    async fn test_acquire_channel_before_start_fails_fast() {
        let supervisor = Supervisor::new(SupervisorConfig::default()).unwrap();
        let err = supervisor
            .acquire_channel(Duration::from_secs(5))
            .await
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::WorkerUnavailable);
    }

    #[tokio::test]
    async fn test_start_missing_binary_fails() {
        let config = SupervisorConfig::new(ProcessConfig::new("/definitely/not/a/worker"));
        let supervisor = Supervisor::new(config).unwrap();
        assert!(supervisor.start().is_err());
        let status = supervisor.status();
        assert_eq!(status.phase, WorkerPhase::Failed);
        assert_eq!(status.liveness.reason, HealthReason::SpawnFailed);
    }
}
