//! Subprocess supervision for the backend worker
//!
//! Spawns the worker with piped stdio, pumps its output into a per-generation
//! [`WorkerChannel`](crate::WorkerChannel), restarts it with backoff after
//! crashes and publishes a health snapshot.

pub mod backoff;
pub mod health;
pub mod process;
pub mod supervisor;

pub use backoff::RestartBackoff;
pub use health::{ExitInfo, HealthReason, HealthSignal, WorkerPhase, WorkerStatus};
pub use process::{ProcessConfig, ReadyProbe, SpawnedWorker, WORKER_LOG_TARGET, spawn_worker};
pub use supervisor::{ShutdownOptions, ShutdownSignal, Supervisor, SupervisorConfig};
