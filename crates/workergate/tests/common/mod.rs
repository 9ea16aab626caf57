//! Shared fixtures for workergate integration tests

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;
use workergate::testing::ScriptedWorker;
use workergate::{RpcTransport, TransportConfig};

/// Transport settings with short timeouts
pub fn fast_config() -> TransportConfig {
    TransportConfig::new()
        .with_ready_timeout(Duration::from_millis(200))
        .with_handshake_timeout(Duration::from_millis(200))
        .with_request_timeout(Duration::from_millis(500))
        .with_turn_timeout(Duration::from_secs(5))
        .with_completion_grace(Duration::from_millis(50))
}

/// A scripted worker and a transport wired to it
pub fn setup(config: TransportConfig) -> (ScriptedWorker, RpcTransport) {
    let worker = ScriptedWorker::new();
    let transport = RpcTransport::new(Arc::new(worker.clone()), config);
    (worker, transport)
}

/// Poll `condition` until it holds or `timeout` passes
pub async fn eventually(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    condition()
}
