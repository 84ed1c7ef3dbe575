use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::Serialize;

/// Lifetime counters, updated lock-free from scheduler tasks.
#[derive(Default)]
pub struct RotationStats {
    rotations: AtomicU64,
    failed_rotations: AtomicU64,
    regenerations: AtomicU64,
    endpoint_refreshes: AtomicU64,
    last_regeneration: Mutex<Option<DateTime<Utc>>>,
}

impl RotationStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn rotation_completed(&self) {
        self.rotations.fetch_add(1, Ordering::Relaxed);
    }

    pub fn rotation_failed(&self) {
        self.failed_rotations.fetch_add(1, Ordering::Relaxed);
    }

    pub fn pool_regenerated(&self) {
        self.regenerations.fetch_add(1, Ordering::Relaxed);
        if let Ok(mut last) = self.last_regeneration.lock() {
            *last = Some(Utc::now());
        }
    }

    pub fn endpoints_refreshed(&self) {
        self.endpoint_refreshes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn counters(&self) -> Counters {
        Counters {
            rotations_completed: self.rotations.load(Ordering::Relaxed),
            rotations_failed: self.failed_rotations.load(Ordering::Relaxed),
            regenerations: self.regenerations.load(Ordering::Relaxed),
            endpoint_refreshes: self.endpoint_refreshes.load(Ordering::Relaxed),
            last_regeneration: self.last_regeneration.lock().ok().and_then(|last| *last),
        }
    }

    pub fn log_summary(&self) {
        let c = self.counters();
        log::info!(
            "[stats] rotations={} failed={} regenerations={} endpoint_refreshes={}",
            c.rotations_completed,
            c.rotations_failed,
            c.regenerations,
            c.endpoint_refreshes
        );
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Counters {
    pub rotations_completed: u64,
    pub rotations_failed: u64,
    pub regenerations: u64,
    pub endpoint_refreshes: u64,
    pub last_regeneration: Option<DateTime<Utc>>,
}

/// Pool occupancy plus lifetime counters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Statistics {
    pub total_agents: usize,
    pub free_identities: usize,
    pub assigned_identities: usize,
    pub total_identities: usize,
    pub proxy_endpoints: usize,
    #[serde(flatten)]
    pub counters: Counters,
}

/// Per-agent rotation summary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AgentReport {
    pub rotation_interval_secs: u64,
    pub last_rotation: DateTime<Utc>,
    pub total_rotations: usize,
    pub proxy_enabled: bool,
    pub tunnel_enabled: bool,
    pub stealth_mode: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RotationReport {
    pub generated_at: DateTime<Utc>,
    pub agents: BTreeMap<String, AgentReport>,
}
