use std::collections::VecDeque;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;

use crate::config::{AgentSettings, ConfigUpdate, MAX_ROTATION_INTERVAL_SECS};
use crate::error::RotationError;
use crate::identity::NetworkIdentity;
use crate::pool::IdentityPool;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RotationReason {
    Scheduled,
    Forced,
    Regeneration,
}

/// A previously held identity and when/why it was given up.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HistoryEntry {
    pub identity: NetworkIdentity,
    pub timestamp: DateTime<Utc>,
    pub reason: RotationReason,
}

/// FIFO of past identities, oldest dropped first once full.
#[derive(Debug, Clone)]
pub struct RotationHistory {
    entries: VecDeque<HistoryEntry>,
    capacity: usize,
}

impl RotationHistory {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: VecDeque::new(),
            capacity,
        }
    }

    pub fn push(&mut self, entry: HistoryEntry) {
        self.entries.push_back(entry);
        while self.entries.len() > self.capacity {
            self.entries.pop_front();
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn iter(&self) -> impl Iterator<Item = &HistoryEntry> {
        self.entries.iter()
    }

    pub fn last(&self) -> Option<&HistoryEntry> {
        self.entries.back()
    }
}

/// Result of one successful rotation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RotateOutcome {
    pub agent_id: String,
    pub previous: NetworkIdentity,
    pub current: NetworkIdentity,
    pub rotated_at: DateTime<Utc>,
    pub reason: RotationReason,
}

/// Copy of a record's public state, safe to hand to callers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AgentStatus {
    pub agent_id: String,
    pub identity: NetworkIdentity,
    pub assigned_at: DateTime<Utc>,
    pub next_rotation_at: DateTime<Utc>,
    pub rotation_interval_secs: u64,
    pub proxy_enabled: bool,
    pub assigned_proxies: Vec<String>,
    pub tunnel_enabled: bool,
    pub assigned_tunnel_endpoints: Vec<String>,
    pub stealth_mode: bool,
    pub history: Vec<HistoryEntry>,
}

impl AgentStatus {
    /// The proxy currently at the head of the rotation.
    pub fn active_proxy(&self) -> Option<&str> {
        self.assigned_proxies.first().map(String::as_str)
    }

    pub fn active_tunnel_endpoint(&self) -> Option<&str> {
        self.assigned_tunnel_endpoints.first().map(String::as_str)
    }
}

/// Rotation state for one agent.
#[derive(Debug, Clone)]
pub struct AgentRotationRecord {
    agent_id: String,
    /// Distinguishes successive registrations under the same id.
    serial: u64,
    identity: NetworkIdentity,
    assigned_at: DateTime<Utc>,
    rotation_interval_secs: u64,
    proxy_enabled: bool,
    assigned_proxies: Vec<String>,
    tunnel_enabled: bool,
    assigned_tunnel_endpoints: Vec<String>,
    stealth_mode: bool,
    history: RotationHistory,
}

impl AgentRotationRecord {
    pub fn new(
        agent_id: impl Into<String>,
        serial: u64,
        identity: NetworkIdentity,
        settings: &AgentSettings,
        max_history_size: usize,
    ) -> Self {
        Self {
            agent_id: agent_id.into(),
            serial,
            identity,
            assigned_at: Utc::now(),
            rotation_interval_secs: settings.rotation_interval_secs,
            proxy_enabled: settings.proxy_enabled,
            assigned_proxies: Vec::new(),
            tunnel_enabled: settings.tunnel_enabled,
            assigned_tunnel_endpoints: Vec::new(),
            stealth_mode: settings.stealth_mode,
            history: RotationHistory::new(max_history_size),
        }
    }

    /// Swaps in a fresh identity from `pool`.
    ///
    /// The new identity is acquired before the old one is released, so a
    /// failed acquire leaves both the record and the pool untouched.
    pub fn rotate(
        &mut self,
        pool: &mut IdentityPool,
        reason: RotationReason,
    ) -> Result<RotateOutcome, RotationError> {
        let old = self.identity;
        let generation = pool.generation();
        let new = pool.acquire_replacing(old)?;
        // A rebuild already dropped the old bookkeeping.
        if pool.generation() == generation {
            pool.release(old);
        }

        let now = Utc::now();
        self.identity = new;
        self.assigned_at = now;
        self.history.push(HistoryEntry {
            identity: old,
            timestamp: now,
            reason,
        });

        if self.proxy_enabled && !self.assigned_proxies.is_empty() {
            self.assigned_proxies.rotate_left(1);
        }
        if self.tunnel_enabled && !self.assigned_tunnel_endpoints.is_empty() {
            self.assigned_tunnel_endpoints.rotate_left(1);
        }

        Ok(RotateOutcome {
            agent_id: self.agent_id.clone(),
            previous: old,
            current: new,
            rotated_at: now,
            reason,
        })
    }

    /// Takes `identity` without touching the pool, used after a wholesale
    /// rebuild when the old identity is no longer tracked.
    pub fn reassign(&mut self, identity: NetworkIdentity, reason: RotationReason) -> NetworkIdentity {
        let old = self.identity;
        let now = Utc::now();
        self.identity = identity;
        self.assigned_at = now;
        self.history.push(HistoryEntry {
            identity: old,
            timestamp: now,
            reason,
        });
        old
    }

    fn interval(&self) -> Duration {
        Duration::seconds(self.rotation_interval_secs.min(MAX_ROTATION_INTERVAL_SECS) as i64)
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        now - self.assigned_at >= self.interval()
    }

    pub fn next_rotation_at(&self) -> DateTime<Utc> {
        self.assigned_at + self.interval()
    }

    pub fn apply_update(&mut self, update: &ConfigUpdate) {
        if let Some(secs) = update.rotation_interval_secs {
            self.rotation_interval_secs = secs;
        }
        if let Some(enabled) = update.proxy_enabled {
            self.proxy_enabled = enabled;
        }
        if let Some(enabled) = update.tunnel_enabled {
            self.tunnel_enabled = enabled;
        }
        if let Some(enabled) = update.stealth_mode {
            self.stealth_mode = enabled;
        }
    }

    pub fn set_assigned_proxies(&mut self, proxies: Vec<String>) {
        self.assigned_proxies = proxies;
    }

    pub fn set_assigned_tunnel_endpoints(&mut self, endpoints: Vec<String>) {
        self.assigned_tunnel_endpoints = endpoints;
    }

    pub fn status(&self) -> AgentStatus {
        AgentStatus {
            agent_id: self.agent_id.clone(),
            identity: self.identity,
            assigned_at: self.assigned_at,
            next_rotation_at: self.next_rotation_at(),
            rotation_interval_secs: self.rotation_interval_secs,
            proxy_enabled: self.proxy_enabled,
            assigned_proxies: self.assigned_proxies.clone(),
            tunnel_enabled: self.tunnel_enabled,
            assigned_tunnel_endpoints: self.assigned_tunnel_endpoints.clone(),
            stealth_mode: self.stealth_mode,
            history: self.history.iter().cloned().collect(),
        }
    }

    pub fn settings(&self) -> AgentSettings {
        AgentSettings {
            rotation_interval_secs: self.rotation_interval_secs,
            proxy_enabled: self.proxy_enabled,
            tunnel_enabled: self.tunnel_enabled,
            stealth_mode: self.stealth_mode,
        }
    }

    pub fn agent_id(&self) -> &str {
        &self.agent_id
    }

    pub fn serial(&self) -> u64 {
        self.serial
    }

    pub fn identity(&self) -> NetworkIdentity {
        self.identity
    }

    pub fn assigned_at(&self) -> DateTime<Utc> {
        self.assigned_at
    }

    pub fn rotation_interval_secs(&self) -> u64 {
        self.rotation_interval_secs
    }

    pub fn proxy_enabled(&self) -> bool {
        self.proxy_enabled
    }

    pub fn tunnel_enabled(&self) -> bool {
        self.tunnel_enabled
    }

    pub fn stealth_mode(&self) -> bool {
        self.stealth_mode
    }

    pub fn assigned_proxies(&self) -> &[String] {
        &self.assigned_proxies
    }

    pub fn assigned_tunnel_endpoints(&self) -> &[String] {
        &self.assigned_tunnel_endpoints
    }

    pub fn history(&self) -> &RotationHistory {
        &self.history
    }

    #[cfg(test)]
    pub(crate) fn backdate(&mut self, by: Duration) {
        self.assigned_at = self.assigned_at - by;
    }
}
