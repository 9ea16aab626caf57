//! Process spawning and output plumbing for the worker subprocess

use crate::error::{Result, TransportError};
use crate::traits::WorkerChannel;
use regex::Regex;
use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader, BufWriter};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

/// Log target for re-emitted worker stderr
pub const WORKER_LOG_TARGET: &str = "workergate::worker";

/// Configuration for spawning the worker process
#[derive(Clone, Debug)]
pub struct ProcessConfig {
    /// Path to the worker executable
    pub command: String,

    /// Arguments to pass to the worker
    pub args: Vec<String>,

    /// Environment variables to set
    pub env: HashMap<String, String>,

    /// Working directory
    pub cwd: Option<PathBuf>,

    /// Start from an empty environment instead of inheriting the parent's
    pub isolate_env: bool,
}

impl Default for ProcessConfig {
    fn default() -> Self {
        Self {
            command: "codex".to_string(),
            args: vec!["app-server".to_string()],
            env: HashMap::new(),
            cwd: None,
            isolate_env: false,
        }
    }
}

impl ProcessConfig {
    /// Create a new process configuration with no arguments
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            args: Vec::new(),
            ..Default::default()
        }
    }

    /// Add an argument
    pub fn with_arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Replace all arguments
    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    /// Set an environment variable
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Set the working directory
    pub fn with_cwd(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    /// Clear the inherited environment; only variables set via
    /// [`ProcessConfig::with_env`] reach the worker.
    pub fn with_isolated_env(mut self, isolate: bool) -> Self {
        self.isolate_env = isolate;
        self
    }
}

/// Callback fired when a worker output line matches the readiness pattern
#[derive(Clone)]
pub struct ReadyProbe {
    pattern: Regex,
    on_match: Arc<dyn Fn() + Send + Sync>,
}

impl ReadyProbe {
    /// Create a probe
    pub fn new(pattern: Regex, on_match: impl Fn() + Send + Sync + 'static) -> Self {
        Self {
            pattern,
            on_match: Arc::new(on_match),
        }
    }

    fn check(&self, line: &str) {
        if self.pattern.is_match(line) {
            (self.on_match)();
        }
    }
}

/// A freshly spawned worker
pub struct SpawnedWorker {
    /// Child process; owned by the supervisor's monitor task
    pub child: Child,
    /// OS process id
    pub pid: Option<u32>,
    /// Channel for this generation
    pub channel: Arc<WorkerChannel>,
}

/// Spawn the worker and attach line pumps to its output streams
///
/// Stdout lines are forwarded into the returned channel; stderr lines are
/// logged under [`WORKER_LOG_TARGET`]. Both are checked against `probe`.
pub fn spawn_worker(
    config: &ProcessConfig,
    generation: u64,
    probe: Option<ReadyProbe>,
) -> Result<SpawnedWorker> {
    let mut cmd = Command::new(&config.command);
    cmd.args(&config.args);

    if config.isolate_env {
        cmd.env_clear();
    }
    cmd.envs(&config.env);

    if let Some(cwd) = &config.cwd {
        cmd.current_dir(cwd);
    }

    cmd.stdin(Stdio::piped());
    cmd.stdout(Stdio::piped());
    cmd.stderr(Stdio::piped());
    cmd.kill_on_drop(true);

    let mut child = cmd.spawn().map_err(|e| {
        TransportError::unavailable(format!("failed to spawn worker '{}': {e}", config.command))
    })?;

    let stdin = child
        .stdin
        .take()
        .ok_or_else(|| TransportError::unavailable("failed to get worker stdin"))?;
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| TransportError::unavailable("failed to get worker stdout"))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| TransportError::unavailable("failed to get worker stderr"))?;

    let pid = child.id();
    let (tx, rx) = mpsc::unbounded_channel();

    tokio::spawn(pump_stdout(stdout, tx, probe.clone(), generation));
    tokio::spawn(pump_stderr(stderr, probe, generation));

    debug!(generation, pid, command = %config.command, "worker spawned");

    Ok(SpawnedWorker {
        child,
        pid,
        channel: Arc::new(WorkerChannel::new(generation, BufWriter::new(stdin), rx)),
    })
}

async fn pump_stdout(
    stream: impl AsyncRead + Unpin,
    tx: mpsc::UnboundedSender<String>,
    probe: Option<ReadyProbe>,
    generation: u64,
) {
    let mut lines = BufReader::new(stream).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                if let Some(probe) = &probe {
                    probe.check(&line);
                }
                trace!(generation, line = %line, "worker stdout");
                // Receiver gone means nobody reads this generation any more;
                // keep draining so the worker never blocks on a full pipe.
                let _ = tx.send(line);
            }
            Ok(None) => break,
            Err(e) => {
                warn!(generation, error = %e, "worker stdout read failed");
                break;
            }
        }
    }
    debug!(generation, "worker stdout closed");
}

async fn pump_stderr(stream: impl AsyncRead + Unpin, probe: Option<ReadyProbe>, generation: u64) {
    let mut lines = BufReader::new(stream).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        if let Some(probe) = &probe {
            probe.check(&line);
        }
        debug!(target: WORKER_LOG_TARGET, generation, "{line}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_process_config_default() {
        let config = ProcessConfig::default();
        assert_eq!(config.command, "codex");
        assert!(config.args.contains(&"app-server".to_string()));
        assert!(!config.isolate_env);
    }

    #[test]
    fn test_process_config_builder() {
        let config = ProcessConfig::new("my-worker")
            .with_arg("--verbose")
            .with_env("API_KEY", "sk-123")
            .with_cwd("/tmp")
            .with_isolated_env(true);

        assert_eq!(config.command, "my-worker");
        assert_eq!(config.args, vec!["--verbose".to_string()]);
        assert_eq!(config.env.get("API_KEY"), Some(&"sk-123".to_string()));
        assert_eq!(config.cwd, Some(PathBuf::from("/tmp")));
        assert!(config.isolate_env);
    }

    #[test]
    fn test_ready_probe_matches() {
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hits);
        let probe = ReadyProbe::new(Regex::new("listening").unwrap(), move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        probe.check("booting");
        probe.check("server listening on stdio");
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_spawn_forwards_stdout_lines() {
        let config = ProcessConfig::new("/bin/sh")
            .with_args(["-c", "echo one; echo two >&2; echo three"]);
        let mut worker = spawn_worker(&config, 1, None).unwrap();
        let mut lines = worker.channel.take_lines().unwrap();

        assert_eq!(lines.recv().await.as_deref(), Some("one"));
        assert_eq!(lines.recv().await.as_deref(), Some("three"));
        assert!(lines.recv().await.is_none());
        assert!(worker.child.wait().await.unwrap().success());
    }

    #[tokio::test]
    async fn test_spawn_missing_binary() {
        let config = ProcessConfig::new("/definitely/not/a/worker");
        let err = spawn_worker(&config, 1, None).err().unwrap();
        assert_eq!(err.code, crate::error::ErrorCode::WorkerUnavailable);
    }
}
