//! Integration tests for the worker supervisor
//!
//! These spawn small `/bin/sh` scripts as stand-in workers.

#![cfg(unix)]

use serde_json::json;
use std::time::Duration;
use workergate_transport::{
    ErrorCode, HealthReason, ProcessConfig, ShutdownOptions, Supervisor, SupervisorConfig,
    WorkerHandle, WorkerPhase, WorkerStatus,
};

fn sh(script: &str) -> ProcessConfig {
    ProcessConfig::new("/bin/sh").with_args(["-c", script])
}

async fn wait_until(
    supervisor: &Supervisor,
    timeout: Duration,
    predicate: impl FnMut(&WorkerStatus) -> bool,
) -> WorkerStatus {
    let mut rx = supervisor.subscribe();
    let status = tokio::time::timeout(timeout, rx.wait_for(predicate))
        .await
        .expect("timed out waiting for supervisor state")
        .expect("supervisor dropped");
    status.clone()
}

#[tokio::test]
async fn test_ready_signal_and_shutdown() {
    let config = SupervisorConfig::new(sh("echo worker ready; exec sleep 30"))
        .with_ready_pattern("worker ready");
    let supervisor = Supervisor::new(config).unwrap();
    supervisor.start().unwrap();

    let status = supervisor
        .wait_for_ready(Duration::from_secs(5))
        .await
        .unwrap();
    assert_eq!(status.phase, WorkerPhase::Ready);
    assert_eq!(status.readiness.reason, HealthReason::ReadySignal);
    assert!(status.is_live());
    assert!(status.pid.is_some());
    assert_eq!(status.generation, 1);

    supervisor
        .shutdown(ShutdownOptions::with_reason("test complete"))
        .await
        .unwrap();
    let status = supervisor.status();
    assert_eq!(status.phase, WorkerPhase::Stopped);
    assert!(!status.is_live());
    assert!(!status.is_ready());
    assert_eq!(status.liveness.reason, HealthReason::ShutdownComplete);
    assert_eq!(status.restarts_total, 0);

    // Second shutdown is a no-op
    supervisor.shutdown(ShutdownOptions::default()).await.unwrap();
}

#[tokio::test]
async fn test_start_is_idempotent() {
    let supervisor = Supervisor::new(SupervisorConfig::new(sh("exec sleep 30"))).unwrap();
    supervisor.start().unwrap();
    supervisor.start().unwrap();
    assert_eq!(supervisor.status().generation, 1);
    supervisor.shutdown(ShutdownOptions::default()).await.unwrap();
}

#[tokio::test]
async fn test_wait_for_ready_times_out_without_side_effects() {
    let supervisor = Supervisor::new(SupervisorConfig::new(sh("exec sleep 30"))).unwrap();
    supervisor.start().unwrap();

    let err = supervisor
        .wait_for_ready(Duration::from_millis(100))
        .await
        .unwrap_err();
    assert_eq!(err.code, ErrorCode::WorkerNotReady);
    assert!(err.retryable);

    let status = supervisor.status();
    assert_eq!(status.phase, WorkerPhase::Running);
    assert!(status.is_live());
    supervisor.shutdown(ShutdownOptions::default()).await.unwrap();
}

#[tokio::test]
async fn test_crash_restart_then_give_up() {
    let config = SupervisorConfig::new(sh("echo up; sleep 0.2; exit 3"))
        .with_ready_pattern("^up$")
        .with_max_restarts(2)
        .with_backoff(Duration::from_millis(20), Duration::from_millis(80));
    let supervisor = Supervisor::new(config).unwrap();
    supervisor.start().unwrap();

    // First crash followed by a successful relaunch
    let status = wait_until(&supervisor, Duration::from_secs(10), |s| {
        s.restarts_total >= 1 && s.is_ready()
    })
    .await;
    assert!(status.generation >= 2);
    assert_eq!(status.consecutive_failures, 0);
    assert_eq!(status.last_exit.as_ref().and_then(|e| e.code), Some(3));

    // Budget exhausted after the third exit
    let status = wait_until(&supervisor, Duration::from_secs(10), |s| {
        s.phase == WorkerPhase::Failed
    })
    .await;
    assert_eq!(status.restarts_total, 3);
    assert!(!status.is_live());
    assert_eq!(status.liveness.reason, HealthReason::RestartLimitExceeded);

    // No further relaunch attempts
    let generation = status.generation;
    tokio::time::sleep(Duration::from_millis(300)).await;
    let status = supervisor.status();
    assert_eq!(status.phase, WorkerPhase::Failed);
    assert_eq!(status.generation, generation);

    let err = supervisor
        .acquire_channel(Duration::from_millis(50))
        .await
        .unwrap_err();
    assert_eq!(err.code, ErrorCode::WorkerUnavailable);
    assert!(!err.retryable);
}

#[tokio::test]
async fn test_backoff_grows_within_a_failure_streak() {
    let config = SupervisorConfig::new(sh("exit 1"))
        .with_max_restarts(10)
        .with_backoff(Duration::from_millis(10), Duration::from_millis(40));
    let supervisor = Supervisor::new(config).unwrap();
    supervisor.start().unwrap();

    let status = wait_until(&supervisor, Duration::from_secs(10), |s| {
        s.restarts_total >= 3
    })
    .await;
    assert!(status.consecutive_failures >= 3);
    assert!(!status.is_ready());
    assert_eq!(status.next_backoff, Duration::from_millis(40));

    supervisor.shutdown(ShutdownOptions::default()).await.unwrap();
    assert_eq!(supervisor.status().phase, WorkerPhase::Stopped);
}

#[tokio::test]
async fn test_shutdown_escalates_to_kill() {
    let config = SupervisorConfig::new(sh(
        "trap '' TERM; echo ready; while true; do sleep 0.05; done",
    ))
    .with_ready_pattern("ready")
    .with_shutdown_grace(Duration::from_millis(200));
    let supervisor = Supervisor::new(config).unwrap();
    supervisor.start().unwrap();
    supervisor
        .wait_for_ready(Duration::from_secs(5))
        .await
        .unwrap();

    tokio::time::timeout(
        Duration::from_secs(5),
        supervisor.shutdown(ShutdownOptions::default()),
    )
    .await
    .expect("shutdown should not hang")
    .unwrap();

    let status = supervisor.status();
    assert_eq!(status.phase, WorkerPhase::Stopped);
    assert_eq!(status.last_exit.and_then(|e| e.signal), Some(9));
}

#[tokio::test]
async fn test_handshake_hooks_fold_into_readiness() {
    let supervisor = Supervisor::new(SupervisorConfig::new(sh("exec cat"))).unwrap();
    supervisor.start().unwrap();
    let channel = supervisor
        .acquire_channel(Duration::from_secs(5))
        .await
        .unwrap();
    let generation = channel.generation();

    supervisor.record_handshake_pending(generation);
    assert_eq!(
        supervisor.status().readiness.reason,
        HealthReason::HandshakePending
    );

    // Reports for another generation are ignored
    supervisor.record_handshake_success(generation + 7, json!({}));
    assert!(!supervisor.status().is_ready());

    supervisor.record_handshake_failure(generation, "bad version");
    let status = supervisor.status();
    assert_eq!(status.readiness.reason, HealthReason::HandshakeFailed);
    assert_eq!(status.readiness.details, Some(json!({"reason": "bad version"})));

    supervisor.record_handshake_success(generation, json!({"userAgent": "worker/1.0"}));
    let status = supervisor.status();
    assert!(status.is_ready());
    assert_eq!(status.phase, WorkerPhase::Ready);
    assert_eq!(status.readiness.reason, HealthReason::HandshakeComplete);
    assert_eq!(status.handshake, Some(json!({"userAgent": "worker/1.0"})));

    supervisor.shutdown(ShutdownOptions::default()).await.unwrap();
}

#[tokio::test]
async fn test_channel_round_trip() {
    let supervisor = Supervisor::new(SupervisorConfig::new(sh("exec cat"))).unwrap();
    supervisor.start().unwrap();
    let channel = supervisor
        .acquire_channel(Duration::from_secs(5))
        .await
        .unwrap();
    let mut lines = channel.take_lines().unwrap();

    channel.send_line(r#"{"jsonrpc":"2.0","id":1}"#).await.unwrap();
    let echoed = tokio::time::timeout(Duration::from_secs(5), lines.recv())
        .await
        .unwrap();
    assert_eq!(echoed.as_deref(), Some(r#"{"jsonrpc":"2.0","id":1}"#));

    supervisor.shutdown(ShutdownOptions::default()).await.unwrap();
}
