//! Health snapshot types
//!
//! Readiness and liveness are independent axes. Liveness means a process
//! exists and has not been torn down; readiness means the application-level
//! handshake (or readiness signal) succeeded for the current generation.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;

/// Lifecycle phase of the supervised worker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerPhase {
    /// `start()` has not been called
    NotStarted,
    /// Spawn in progress
    Launching,
    /// Process alive, not yet ready
    Running,
    /// Process alive and ready
    Ready,
    /// Process exited; restart decision pending
    Exited,
    /// Waiting out the backoff before relaunching
    Restarting,
    /// Shutdown requested, waiting for the process to exit
    Draining,
    /// Shut down on request
    Stopped,
    /// Restart budget exhausted or spawn impossible; no further relaunches
    Failed,
}

impl WorkerPhase {
    /// A process exists and owns a channel
    pub fn has_process(&self) -> bool {
        matches!(self, Self::Running | Self::Ready)
    }

    /// No channel will ever appear without an explicit `start()`
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::NotStarted | Self::Stopped | Self::Failed | Self::Draining)
    }
}

/// Reason attached to a health signal
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthReason {
    /// Nothing launched yet
    NotStarted,
    /// Process just spawned
    WorkerStarting,
    /// Process exited
    WorkerExit,
    /// Spawning the process failed
    SpawnFailed,
    /// Handshake in flight
    HandshakePending,
    /// Handshake succeeded
    HandshakeComplete,
    /// Handshake failed
    HandshakeFailed,
    /// Readiness pattern seen on worker output
    ReadySignal,
    /// Restart budget exhausted
    RestartLimitExceeded,
    /// Shutdown requested
    ShutdownRequested,
    /// Shutdown finished
    ShutdownComplete,
}

/// One health axis
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthSignal {
    /// Whether the axis is healthy
    pub ok: bool,
    /// Why it is in this state
    pub reason: HealthReason,
    /// When it entered this state
    pub since: DateTime<Utc>,
    /// Optional detail (handshake payload, failure reason)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

impl HealthSignal {
    /// A signal stamped now
    pub fn new(ok: bool, reason: HealthReason) -> Self {
        Self {
            ok,
            reason,
            since: Utc::now(),
            details: None,
        }
    }

    /// Attach detail
    pub fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }
}

/// How the last process ended
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExitInfo {
    /// Exit code, when the process exited normally
    pub code: Option<i32>,
    /// Terminating signal, when killed by one
    pub signal: Option<i32>,
    /// When the exit was observed
    pub at: DateTime<Utc>,
}

impl ExitInfo {
    /// Build from an exit status
    pub fn from_status(status: &std::process::ExitStatus) -> Self {
        #[cfg(unix)]
        let signal = {
            use std::os::unix::process::ExitStatusExt;
            status.signal()
        };
        #[cfg(not(unix))]
        let signal = None;

        Self {
            code: status.code(),
            signal,
            at: Utc::now(),
        }
    }

    /// An exit whose status could not be collected
    pub fn unknown() -> Self {
        Self {
            code: None,
            signal: None,
            at: Utc::now(),
        }
    }
}

impl std::fmt::Display for ExitInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match (self.code, self.signal) {
            (Some(code), _) => write!(f, "code {code}"),
            (None, Some(signal)) => write!(f, "signal {signal}"),
            (None, None) => f.write_str("unknown status"),
        }
    }
}

/// Immutable health snapshot of the supervised worker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerStatus {
    /// Lifecycle phase
    pub phase: WorkerPhase,
    /// Current process id
    pub pid: Option<u32>,
    /// Launch counter; increments on every spawn
    pub generation: u64,
    /// Readiness axis
    pub readiness: HealthSignal,
    /// Liveness axis
    pub liveness: HealthSignal,
    /// Restarts since the supervisor was created
    pub restarts_total: u32,
    /// Failures since the last successful readiness signal
    pub consecutive_failures: u32,
    /// Delay before the next relaunch
    #[serde(with = "duration_ms")]
    pub next_backoff: Duration,
    /// How the previous process ended
    pub last_exit: Option<ExitInfo>,
    /// Capability payload from the last successful handshake
    pub handshake: Option<Value>,
}

impl WorkerStatus {
    /// Snapshot for a supervisor that has not launched anything
    pub fn not_started(next_backoff: Duration) -> Self {
        Self {
            phase: WorkerPhase::NotStarted,
            pid: None,
            generation: 0,
            readiness: HealthSignal::new(false, HealthReason::NotStarted),
            liveness: HealthSignal::new(false, HealthReason::NotStarted),
            restarts_total: 0,
            consecutive_failures: 0,
            next_backoff,
            last_exit: None,
            handshake: None,
        }
    }

    /// Worker is ready for turns
    pub fn is_ready(&self) -> bool {
        self.readiness.ok
    }

    /// Worker process is live
    pub fn is_live(&self) -> bool {
        self.liveness.ok
    }
}

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(u64::try_from(value.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
