use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::net::TcpStream;

use crate::identity::NetworkIdentity;

/// Outcome of a diagnostic connect. Failures are data, never errors.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProbeResult {
    pub agent_id: String,
    pub identity: NetworkIdentity,
    pub reachable: bool,
    pub latency_ms: Option<u64>,
    pub error: Option<String>,
    pub probed_at: DateTime<Utc>,
}

/// Attempts a TCP connect to `identity`, giving up after `timeout`.
pub async fn probe(agent_id: &str, identity: NetworkIdentity, timeout: Duration) -> ProbeResult {
    let started = Instant::now();
    let outcome = tokio::time::timeout(timeout, TcpStream::connect(identity.socket_addr())).await;
    let elapsed = started.elapsed();

    let (reachable, error) = match outcome {
        Ok(Ok(_stream)) => (true, None),
        Ok(Err(e)) => (false, Some(e.to_string())),
        Err(_) => (false, Some(format!("timed out after {}ms", timeout.as_millis()))),
    };
    log::debug!("probe {agent_id} at {identity}: reachable={reachable}");

    ProbeResult {
        agent_id: agent_id.to_string(),
        identity,
        reachable,
        latency_ms: reachable.then(|| elapsed.as_millis() as u64),
        error,
        probed_at: Utc::now(),
    }
}
