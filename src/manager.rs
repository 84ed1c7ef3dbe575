//! The rotation manager: owns the identity pool, the endpoint catalog and
//! every agent record behind one mutex, and exposes the administrative
//! surface used by front ends.
//!
//! All pool and record mutation happens inside that single critical section,
//! so cross-agent invariants (one holder per identity, `available` and
//! `assigned` disjoint) hold even across wholesale regeneration. Network I/O
//! (endpoint fetches, probes) always runs with the lock released.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::Utc;

use crate::config::{
    AgentSettings, ConfigUpdate, NetworkConfig, RotationConfig, Timings, MAX_ROTATION_INTERVAL_SECS,
};
use crate::endpoints::{self, EndpointCatalog, EndpointSource, HttpEndpointSource, RefreshResult};
use crate::error::RotationError;
use crate::pool::IdentityPool;
use crate::probe::{self, ProbeResult};
use crate::record::{AgentRotationRecord, AgentStatus, RotateOutcome, RotationReason};
use crate::scheduler::{self, Scheduler, ShutdownReport};
use crate::stats::{AgentReport, RotationReport, RotationStats, Statistics};

pub type RotateResult = Result<RotateOutcome, RotationError>;

/// Everything guarded by the manager's lock.
pub(crate) struct State {
    pub(crate) pool: IdentityPool,
    pub(crate) catalog: EndpointCatalog,
    pub(crate) records: BTreeMap<String, AgentRotationRecord>,
    pub(crate) network: NetworkConfig,
    next_serial: u64,
}

impl State {
    /// Rotates one agent. If the pool had to be rebuilt to serve it, every
    /// other agent is moved onto the new pool in the same pass.
    fn rotate(&mut self, agent_id: &str, reason: RotationReason) -> RotateResult {
        let generation = self.pool.generation();
        let record = self
            .records
            .get_mut(agent_id)
            .ok_or_else(|| RotationError::NotFound(agent_id.to_string()))?;
        let outcome = record.rotate(&mut self.pool, reason)?;
        log::info!(
            "rotated {agent_id}: {} -> {} ({:?})",
            outcome.previous,
            outcome.current,
            reason
        );
        if self.pool.generation() != generation {
            self.reassign_all(Some(agent_id));
        }
        Ok(outcome)
    }

    /// Hands every agent except `skip` a fresh identity after a rebuild.
    fn reassign_all(&mut self, skip: Option<&str>) {
        for (agent_id, record) in self.records.iter_mut() {
            if Some(agent_id.as_str()) == skip {
                continue;
            }
            match self.pool.take() {
                Some(identity) => {
                    let old = record.reassign(identity, RotationReason::Regeneration);
                    log::info!("reassigned {agent_id}: {old} -> {identity}");
                }
                None => log::error!("no identity left to reassign {agent_id}"),
            }
        }
    }

    fn config(&self) -> RotationConfig {
        RotationConfig {
            network: self.network.clone(),
            agents: self
                .records
                .iter()
                .map(|(id, record)| (id.clone(), record.settings()))
                .collect(),
        }
    }
}

/// Result of one scheduler poll for an agent.
#[derive(Debug)]
pub(crate) enum Tick {
    Idle,
    Rotated(RotateOutcome),
    /// The agent was deregistered or re-registered; the task should exit.
    Gone,
}

/// State shared between the façade and its background tasks.
pub(crate) struct Shared {
    state: Mutex<State>,
    stats: RotationStats,
    timings: Timings,
    sources: Vec<Arc<dyn EndpointSource>>,
    config_path: Option<PathBuf>,
}

impl Shared {
    pub(crate) fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn timings(&self) -> &Timings {
        &self.timings
    }

    fn rotate_locked(&self, state: &mut State, agent_id: &str, reason: RotationReason) -> RotateResult {
        let generation = state.pool.generation();
        let result = state.rotate(agent_id, reason);
        if state.pool.generation() != generation {
            self.stats.pool_regenerated();
        }
        match &result {
            Ok(_) => self.stats.rotation_completed(),
            Err(e) if e.is_retryable() => self.stats.rotation_failed(),
            Err(_) => {}
        }
        result
    }

    pub(crate) fn rotate_if_due(&self, agent_id: &str, serial: u64) -> Result<Tick, RotationError> {
        let mut state = self.lock();
        match state.records.get(agent_id) {
            Some(record) if record.serial() == serial => {
                if !record.is_due(Utc::now()) {
                    return Ok(Tick::Idle);
                }
            }
            _ => return Ok(Tick::Gone),
        }
        self.rotate_locked(&mut state, agent_id, RotationReason::Scheduled)
            .map(Tick::Rotated)
    }

    /// Regenerates the pool when free identities drop below the low-water
    /// mark, moving every agent onto the new pool. Returns whether it did.
    pub(crate) fn maintain_pool(&self) -> Result<bool, RotationError> {
        let mut state = self.lock();
        let free = state.pool.free_count();
        if free >= state.network.low_water_mark {
            return Ok(false);
        }
        log::info!(
            "{free} free identities below low-water mark {}, regenerating",
            state.network.low_water_mark
        );
        let holders = state.records.len();
        state.pool.regenerate(holders)?;
        state.reassign_all(None);
        self.stats.pool_regenerated();
        Ok(true)
    }

    /// Fetches with the lock released, then swaps the catalog in and hands
    /// each proxy-enabled agent a fresh sample.
    pub(crate) async fn refresh_endpoints(&self) -> RefreshResult {
        if self.sources.is_empty() {
            log::debug!("no endpoint sources configured");
            return RefreshResult {
                fetched: 0,
                failed_sources: Vec::new(),
                replaced: false,
            };
        }
        let fetched = endpoints::fetch_all(&self.sources, self.timings.fetch_timeout).await;

        let mut guard = self.lock();
        let state = &mut *guard;
        let result = state.catalog.apply(fetched);
        if result.replaced {
            let per_agent = state.network.proxies_per_agent;
            for record in state.records.values_mut().filter(|r| r.proxy_enabled()) {
                record.set_assigned_proxies(state.catalog.sample(per_agent));
            }
        }
        self.stats.endpoints_refreshed();
        result
    }

    fn persist(&self) {
        let Some(path) = self.config_path.as_ref() else {
            return;
        };
        let config = self.lock().config();
        if let Err(e) = config.save(path) {
            log::error!("failed to save config to {}: {}", path.display(), e);
        }
    }
}

/// Construction knobs beyond the config file itself.
#[derive(Default)]
pub struct ManagerOptions {
    pub timings: Timings,
    /// Proxy list sources; `None` builds HTTP sources from the config.
    pub sources: Option<Vec<Arc<dyn EndpointSource>>>,
    /// Where to write the config snapshot on change and on shutdown.
    pub config_path: Option<PathBuf>,
}

/// Owns the identity pool, the endpoint catalog and all agent records.
pub struct RotationManager {
    shared: Arc<Shared>,
    scheduler: Scheduler,
    started: AtomicBool,
}

impl RotationManager {
    pub fn new(config: RotationConfig) -> Result<Self, RotationError> {
        Self::with_options(config, ManagerOptions::default())
    }

    /// Builds the pool and catalog and registers every configured agent.
    /// No background work runs until [`start`](Self::start).
    pub fn with_options(mut config: RotationConfig, options: ManagerOptions) -> Result<Self, RotationError> {
        config.normalize();
        let network = config.network.clone();
        let (low, high) = network.port_range;

        let pool = IdentityPool::new(network.subnet(), low..=high, network.pool_size);
        let catalog = EndpointCatalog::new(network.tunnel_endpoints.clone());
        let sources = options.sources.unwrap_or_else(|| {
            network
                .proxy_sources
                .iter()
                .map(|uri| Arc::new(HttpEndpointSource::new(uri.as_str())) as Arc<dyn EndpointSource>)
                .collect()
        });

        let manager = Self {
            shared: Arc::new(Shared {
                state: Mutex::new(State {
                    pool,
                    catalog,
                    records: BTreeMap::new(),
                    network,
                    next_serial: 0,
                }),
                stats: RotationStats::new(),
                timings: options.timings,
                sources,
                config_path: options.config_path,
            }),
            scheduler: Scheduler::new(),
            started: AtomicBool::new(false),
        };

        for (agent_id, settings) in &config.agents {
            manager.insert_agent(agent_id, settings)?;
        }
        log::info!(
            "rotation manager initialized with {} agents",
            manager.shared.lock().records.len()
        );
        Ok(manager)
    }

    /// Builds the manager and starts its background tasks.
    pub fn initialize(config: RotationConfig, options: ManagerOptions) -> Result<Self, RotationError> {
        let manager = Self::with_options(config, options)?;
        manager.start();
        Ok(manager)
    }

    /// Spawns one rotation task per agent plus the maintenance and refresh
    /// tasks. Must be called from within a tokio runtime; repeat calls are
    /// ignored.
    pub fn start(&self) {
        if self.started.swap(true, Ordering::SeqCst) {
            return;
        }
        let agents: Vec<(String, u64)> = self
            .shared
            .lock()
            .records
            .values()
            .map(|record| (record.agent_id().to_string(), record.serial()))
            .collect();
        log::info!("starting background rotation for {} agents", agents.len());

        for (agent_id, serial) in agents {
            self.spawn_agent(agent_id, serial);
        }
        let shared = Arc::clone(&self.shared);
        self.scheduler
            .spawn("pool-maintenance", move |stop| scheduler::run_pool_maintenance(shared, stop));
        let shared = Arc::clone(&self.shared);
        self.scheduler
            .spawn("endpoint-refresh", move |stop| scheduler::run_endpoint_refresh(shared, stop));
    }

    pub fn is_running(&self) -> bool {
        self.started.load(Ordering::SeqCst) && !self.scheduler.is_stopped()
    }

    fn spawn_agent(&self, agent_id: String, serial: u64) {
        let shared = Arc::clone(&self.shared);
        let name = format!("rotation:{agent_id}");
        self.scheduler
            .spawn(name, move |stop| scheduler::run_agent(shared, agent_id, serial, stop));
    }

    /// Returns the new record's status and serial.
    fn insert_agent(
        &self,
        agent_id: &str,
        settings: &AgentSettings,
    ) -> Result<(AgentStatus, u64), RotationError> {
        validate_settings(settings)?;
        let mut guard = self.shared.lock();
        let state = &mut *guard;
        if state.records.contains_key(agent_id) {
            return Err(RotationError::DuplicateAgent(agent_id.to_string()));
        }

        let generation = state.pool.generation();
        let identity = state.pool.acquire()?;
        if state.pool.generation() != generation {
            self.shared.stats.pool_regenerated();
            state.reassign_all(None);
        }

        state.next_serial += 1;
        let serial = state.next_serial;
        let mut record = AgentRotationRecord::new(
            agent_id,
            serial,
            identity,
            settings,
            state.network.max_history_size,
        );
        if settings.proxy_enabled {
            record.set_assigned_proxies(state.catalog.sample(state.network.proxies_per_agent));
        }
        if settings.tunnel_enabled {
            record.set_assigned_tunnel_endpoints(
                state.catalog.sample_tunnels(state.network.tunnels_per_agent),
            );
        }
        log::info!("registered {agent_id} with {identity}");
        let status = record.status();
        state.records.insert(agent_id.to_string(), record);
        Ok((status, serial))
    }

    /// Adds an agent and assigns it an identity. Once started, the agent
    /// gets its own rotation task right away.
    pub fn register_agent(
        &self,
        agent_id: impl Into<String>,
        settings: AgentSettings,
    ) -> Result<AgentStatus, RotationError> {
        let agent_id = agent_id.into();
        let (status, serial) = self.insert_agent(&agent_id, &settings)?;
        if self.started.load(Ordering::SeqCst) {
            self.spawn_agent(agent_id, serial);
        }
        self.shared.persist();
        Ok(status)
    }

    /// Removes an agent and returns its identity to the pool. Unknown ids
    /// are ignored; returns whether anything was removed.
    pub fn deregister_agent(&self, agent_id: &str) -> bool {
        let removed = {
            let mut state = self.shared.lock();
            match state.records.remove(agent_id) {
                Some(record) => {
                    state.pool.release(record.identity());
                    log::info!("deregistered {agent_id}, released {}", record.identity());
                    true
                }
                None => false,
            }
        };
        if removed {
            self.shared.persist();
        }
        removed
    }

    pub fn status(&self, agent_id: &str) -> Result<AgentStatus, RotationError> {
        self.shared
            .lock()
            .records
            .get(agent_id)
            .map(AgentRotationRecord::status)
            .ok_or_else(|| RotationError::NotFound(agent_id.to_string()))
    }

    pub fn all_statuses(&self) -> BTreeMap<String, AgentStatus> {
        self.shared
            .lock()
            .records
            .iter()
            .map(|(id, record)| (id.clone(), record.status()))
            .collect()
    }

    pub fn agent_ids(&self) -> Vec<String> {
        self.shared.lock().records.keys().cloned().collect()
    }

    pub fn force_rotate(&self, agent_id: &str) -> RotateResult {
        let mut state = self.shared.lock();
        self.shared
            .rotate_locked(&mut state, agent_id, RotationReason::Forced)
    }

    /// Rotates every agent inside one critical section, so no caller ever
    /// sees a partly rotated fleet.
    pub fn force_rotate_all(&self) -> BTreeMap<String, RotateResult> {
        let mut state = self.shared.lock();
        let ids: Vec<String> = state.records.keys().cloned().collect();
        log::info!("forcing rotation of {} agents", ids.len());
        ids.into_iter()
            .map(|id| {
                let result = self
                    .shared
                    .rotate_locked(&mut state, &id, RotationReason::Forced);
                (id, result)
            })
            .collect()
    }

    /// Applies `update` to an existing agent. `Ok(false)` means the agent is
    /// unknown.
    pub fn update_config(&self, agent_id: &str, update: ConfigUpdate) -> Result<bool, RotationError> {
        update.validate()?;
        {
            let mut guard = self.shared.lock();
            let state = &mut *guard;
            let Some(record) = state.records.get_mut(agent_id) else {
                return Ok(false);
            };
            record.apply_update(&update);
            if record.proxy_enabled() && record.assigned_proxies().is_empty() {
                record.set_assigned_proxies(state.catalog.sample(state.network.proxies_per_agent));
            }
            if record.tunnel_enabled() && record.assigned_tunnel_endpoints().is_empty() {
                record.set_assigned_tunnel_endpoints(
                    state.catalog.sample_tunnels(state.network.tunnels_per_agent),
                );
            }
        }
        log::info!("updated configuration for {agent_id}: {update:?}");
        self.shared.persist();
        Ok(true)
    }

    pub fn statistics(&self) -> Statistics {
        let state = self.shared.lock();
        Statistics {
            total_agents: state.records.len(),
            free_identities: state.pool.free_count(),
            assigned_identities: state.pool.assigned_count(),
            total_identities: state.pool.total_count(),
            proxy_endpoints: state.catalog.proxy_endpoints().len(),
            counters: self.shared.stats.counters(),
        }
    }

    pub fn rotation_report(&self) -> RotationReport {
        let state = self.shared.lock();
        let agents = state
            .records
            .iter()
            .map(|(id, record)| {
                let report = AgentReport {
                    rotation_interval_secs: record.rotation_interval_secs(),
                    last_rotation: record.assigned_at(),
                    total_rotations: record.history().len(),
                    proxy_enabled: record.proxy_enabled(),
                    tunnel_enabled: record.tunnel_enabled(),
                    stealth_mode: record.stealth_mode(),
                };
                (id.clone(), report)
            })
            .collect();
        RotationReport {
            generated_at: Utc::now(),
            agents,
        }
    }

    /// TCP connect to the agent's current identity, outside the lock.
    pub async fn probe_connectivity(&self, agent_id: &str) -> Result<ProbeResult, RotationError> {
        let identity = self.status(agent_id)?.identity;
        Ok(probe::probe(agent_id, identity, self.shared.timings.probe_timeout).await)
    }

    pub async fn refresh_endpoints(&self) -> RefreshResult {
        self.shared.refresh_endpoints().await
    }

    /// Runs one pool-maintenance pass now.
    pub fn maintain_pool(&self) -> Result<bool, RotationError> {
        self.shared.maintain_pool()
    }

    pub fn config_snapshot(&self) -> RotationConfig {
        self.shared.lock().config()
    }

    /// Stops every background task, waiting a bounded time for them, then
    /// writes the config snapshot if a path was given.
    pub async fn shutdown(&self) -> ShutdownReport {
        log::info!("shutting down rotation manager");
        let report = self.scheduler.shutdown(self.shared.timings.shutdown_timeout).await;
        self.shared.stats.log_summary();
        self.shared.persist();
        report
    }
}

fn validate_settings(settings: &AgentSettings) -> Result<(), RotationError> {
    if settings.rotation_interval_secs == 0 {
        return Err(RotationError::InvalidConfig(
            "rotation interval must be greater than zero".to_string(),
        ));
    }
    if settings.rotation_interval_secs > MAX_ROTATION_INTERVAL_SECS {
        return Err(RotationError::InvalidConfig(format!(
            "rotation interval may not exceed {MAX_ROTATION_INTERVAL_SECS}s"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::endpoints::tests::{FailingSource, StaticSource};
    use std::collections::HashSet;
    use std::time::Duration;
    use tokio::net::TcpListener;

    fn config(subnet: &str, agents: &[(&str, u64)]) -> RotationConfig {
        let mut config = RotationConfig {
            network: NetworkConfig {
                subnet: subnet.to_string(),
                proxy_sources: Vec::new(),
                ..NetworkConfig::default()
            },
            agents: BTreeMap::new(),
        };
        for (id, interval) in agents {
            config
                .agents
                .insert(id.to_string(), AgentSettings::with_interval(*interval));
        }
        config
    }

    fn fast_timings() -> Timings {
        Timings {
            poll_interval: Duration::from_millis(20),
            failure_backoff: Duration::from_millis(20),
            maintenance_interval: Duration::from_secs(3600),
            endpoint_refresh_interval: Duration::from_secs(3600),
            fetch_timeout: Duration::from_millis(200),
            probe_timeout: Duration::from_millis(500),
            shutdown_timeout: Duration::from_secs(2),
        }
    }

    fn manager(config: RotationConfig) -> RotationManager {
        crate::logging::init_for_tests();
        let options = ManagerOptions {
            timings: fast_timings(),
            sources: Some(Vec::new()),
            config_path: None,
        };
        RotationManager::with_options(config, options).unwrap()
    }

    fn fleet() -> RotationManager {
        manager(config(
            "10.0.0.0/8",
            &[("alpha", 300), ("beta", 240), ("gamma", 180), ("delta", 120)],
        ))
    }

    fn assert_invariants(manager: &RotationManager) {
        let state = manager.shared.lock();
        let available = state.pool.available_set();
        let assigned = state.pool.assigned_set();
        assert!(available.is_disjoint(&assigned));
        assert_eq!(assigned.len(), state.records.len());
        let mut held = HashSet::new();
        for record in state.records.values() {
            assert!(assigned.contains(&record.identity()));
            assert!(held.insert(record.identity()), "identity held twice");
            assert!(record.history().len() <= state.network.max_history_size);
        }
    }

    #[test]
    fn force_rotate_all_gives_distinct_assigned_identities() {
        let manager = fleet();
        let before = manager.all_statuses();

        let results = manager.force_rotate_all();

        assert_eq!(results.len(), 4);
        let mut seen = HashSet::new();
        for (id, result) in &results {
            let outcome = result.as_ref().unwrap();
            assert_eq!(outcome.previous, before[id].identity);
            assert_ne!(outcome.current, outcome.previous);
            assert!(seen.insert(outcome.current));
        }
        assert_invariants(&manager);
        assert_eq!(manager.statistics().counters.rotations_completed, 4);
    }

    #[test]
    fn duplicate_registration_is_rejected() {
        let manager = fleet();
        let first = manager
            .register_agent("a", AgentSettings::with_interval(60))
            .unwrap();

        let err = manager
            .register_agent("a", AgentSettings::with_interval(30))
            .unwrap_err();

        assert_eq!(err, RotationError::DuplicateAgent("a".to_string()));
        let status = manager.status("a").unwrap();
        assert_eq!(status.identity, first.identity);
        assert_eq!(status.rotation_interval_secs, 60);
        assert_invariants(&manager);
    }

    #[test]
    fn empty_agent_table_falls_back_to_builtin_fleet() {
        let manager = manager(config("10.0.0.0/8", &[]));
        assert_eq!(manager.agent_ids(), vec!["alpha", "beta", "delta", "gamma"]);
        assert_eq!(manager.status("delta").unwrap().rotation_interval_secs, 120);
    }

    #[test]
    fn deregistration_returns_identity_to_pool() {
        let manager = fleet();
        let free = manager.statistics().free_identities;
        let identity = manager.status("gamma").unwrap().identity;

        assert!(manager.deregister_agent("gamma"));
        assert!(!manager.deregister_agent("gamma"));

        let stats = manager.statistics();
        assert_eq!(stats.free_identities, free + 1);
        assert_eq!(stats.total_agents, 3);
        assert!(manager.shared.lock().pool.is_available(&identity));
        assert_eq!(
            manager.status("gamma"),
            Err(RotationError::NotFound("gamma".to_string()))
        );
    }

    #[test]
    fn statistics_count_pool_occupancy() {
        let manager = fleet();
        let stats = manager.statistics();
        assert_eq!(stats.total_agents, 4);
        assert_eq!(stats.assigned_identities, 4);
        assert_eq!(stats.free_identities + 4, stats.total_identities);
    }

    #[test]
    fn status_reports_next_rotation() {
        let manager = fleet();
        let status = manager.status("beta").unwrap();
        assert_eq!(
            status.next_rotation_at,
            status.assigned_at + chrono::Duration::seconds(240)
        );
        assert!(status.history.is_empty());
        assert_eq!(manager.config_snapshot().agents["beta"], AgentSettings::with_interval(240));
    }

    #[test]
    fn force_rotate_unknown_agent_is_not_found() {
        let manager = fleet();
        assert_eq!(
            manager.force_rotate("omega"),
            Err(RotationError::NotFound("omega".to_string()))
        );
        assert_eq!(manager.statistics().counters.rotations_failed, 0);
    }

    #[test]
    fn rebuild_during_rotation_moves_whole_fleet() {
        let manager = manager(config("10.20.0.0/16", &[("a", 300), ("b", 300)]));
        let b_before = manager.status("b").unwrap().identity;
        let generation = {
            let mut state = manager.shared.lock();
            state.pool.drain_available();
            state.pool.generation()
        };

        let outcome = manager.force_rotate("a").unwrap();

        assert_eq!(manager.shared.lock().pool.generation(), generation + 1);
        let b = manager.status("b").unwrap();
        assert_ne!(b.identity, b_before);
        assert_eq!(b.history.last().unwrap().reason, RotationReason::Regeneration);
        assert_eq!(
            manager.status("a").unwrap().history.last().unwrap().reason,
            RotationReason::Forced
        );
        assert_ne!(outcome.current, b.identity);
        assert_invariants(&manager);
        assert_eq!(manager.statistics().counters.regenerations, 1);
    }

    #[test]
    fn registration_beyond_subnet_capacity_is_exhausted() {
        let manager = manager(config("10.1.1.0/30", &[("a", 60), ("b", 60)]));

        let err = manager
            .register_agent("c", AgentSettings::with_interval(60))
            .unwrap_err();

        assert!(matches!(err, RotationError::PoolExhausted { .. }));
        assert_eq!(manager.agent_ids(), vec!["a", "b"]);
        assert_invariants(&manager);
    }

    #[test]
    fn unusable_pool_settings_on_disk_still_start() {
        let dir = tempfile::tempdir().unwrap();
        let empty_pool = dir.path().join("empty_pool.json");
        std::fs::write(&empty_pool, r#"{"network":{"pool_size":0},"agents":{}}"#).unwrap();
        let tiny_subnet = dir.path().join("tiny_subnet.json");
        std::fs::write(&tiny_subnet, r#"{"network":{"subnet":"10.1.1.0/30"}}"#).unwrap();

        for path in [empty_pool, tiny_subnet] {
            let config = RotationConfig::load_or_default(&path);
            let manager = RotationManager::with_options(
                config,
                ManagerOptions {
                    sources: Some(Vec::new()),
                    ..ManagerOptions::default()
                },
            )
            .unwrap();
            assert_eq!(manager.statistics().total_agents, 4);
            assert_invariants(&manager);
        }
    }

    #[test]
    fn maintenance_regenerates_below_low_water_mark() {
        let mut cfg = config("10.5.5.0/26", &[("a", 300), ("b", 300), ("c", 300), ("d", 300)]);
        cfg.network.low_water_mark = 100;
        let manager = manager(cfg);
        let before = manager.all_statuses();

        assert!(manager.maintain_pool().unwrap());

        for (id, status) in manager.all_statuses() {
            let last = status.history.last().unwrap();
            assert_eq!(last.reason, RotationReason::Regeneration);
            assert_eq!(last.identity, before[&id].identity);
        }
        assert_invariants(&manager);
        assert_eq!(manager.statistics().counters.regenerations, 1);
    }

    #[test]
    fn maintenance_leaves_healthy_pool_alone() {
        let manager = fleet();
        assert!(!manager.maintain_pool().unwrap());
        assert!(manager.all_statuses().values().all(|s| s.history.is_empty()));
    }

    #[test]
    fn history_is_capped() {
        let mut cfg = config("10.0.0.0/8", &[("a", 300)]);
        cfg.network.max_history_size = 5;
        let manager = manager(cfg);
        let mut previous = Vec::new();
        for _ in 0..8 {
            previous.push(manager.force_rotate("a").unwrap().previous);
        }

        let history = manager.status("a").unwrap().history;
        let kept: Vec<_> = history.iter().map(|entry| entry.identity).collect();
        assert_eq!(kept, previous[3..].to_vec());
        assert_invariants(&manager);
    }

    #[test]
    fn update_config_changes_known_agents_only() {
        let manager = fleet();
        let update = ConfigUpdate {
            rotation_interval_secs: Some(45),
            tunnel_enabled: Some(true),
            ..ConfigUpdate::default()
        };

        assert!(manager.update_config("alpha", update.clone()).unwrap());
        assert!(!manager.update_config("omega", update).unwrap());

        let alpha = manager.status("alpha").unwrap();
        assert_eq!(alpha.rotation_interval_secs, 45);
        assert!(alpha.tunnel_enabled);
        assert_eq!(alpha.assigned_tunnel_endpoints.len(), 3);

        let zero = ConfigUpdate {
            rotation_interval_secs: Some(0),
            ..ConfigUpdate::default()
        };
        assert!(matches!(
            manager.update_config("alpha", zero),
            Err(RotationError::InvalidConfig(_))
        ));
    }

    #[test]
    fn config_changes_are_persisted() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rotation.json");
        let manager = RotationManager::with_options(
            config("10.0.0.0/8", &[("a", 300), ("b", 200)]),
            ManagerOptions {
                timings: fast_timings(),
                sources: Some(Vec::new()),
                config_path: Some(path.clone()),
            },
        )
        .unwrap();

        manager
            .update_config("a", ConfigUpdate::from_key_value("rotation_interval", "77").unwrap())
            .unwrap();
        manager.deregister_agent("b");

        let saved = RotationConfig::load(&path).unwrap();
        assert_eq!(saved.agents["a"].rotation_interval_secs, 77);
        assert!(!saved.agents.contains_key("b"));
        assert_eq!(saved.network.subnet, "10.0.0.0/8");
    }

    #[test]
    fn rotation_report_counts_history() {
        let manager = fleet();
        manager.force_rotate("alpha").unwrap();
        manager.force_rotate("alpha").unwrap();

        let report = manager.rotation_report();
        assert_eq!(report.agents.len(), 4);
        assert_eq!(report.agents["alpha"].total_rotations, 2);
        assert_eq!(report.agents["beta"].total_rotations, 0);
    }

    #[tokio::test]
    async fn refresh_distributes_proxies_to_enabled_agents() {
        let proxies: Vec<String> = (0..20).map(|i| format!("192.0.2.{i}:3128")).collect();
        let refs: Vec<&str> = proxies.iter().map(String::as_str).collect();
        let mut cfg = config("10.0.0.0/8", &[("a", 300), ("b", 300)]);
        cfg.agents.get_mut("b").unwrap().proxy_enabled = false;
        crate::logging::init_for_tests();
        let manager = RotationManager::with_options(
            cfg,
            ManagerOptions {
                timings: fast_timings(),
                sources: Some(vec![
                    StaticSource::new("list-1", &refs),
                    Arc::new(FailingSource("list-2".into())),
                ]),
                config_path: None,
            },
        )
        .unwrap();

        let result = manager.refresh_endpoints().await;

        assert!(result.replaced);
        assert_eq!(result.fetched, 20);
        assert_eq!(result.failed_sources, vec!["list-2".to_string()]);
        let a = manager.status("a").unwrap();
        assert_eq!(a.assigned_proxies.len(), 10);
        assert!(a.assigned_proxies.iter().all(|p| proxies.contains(p)));
        assert!(manager.status("b").unwrap().assigned_proxies.is_empty());
        let stats = manager.statistics();
        assert_eq!(stats.proxy_endpoints, 20);
        assert_eq!(stats.counters.endpoint_refreshes, 1);
    }

    #[tokio::test]
    async fn scheduler_rotates_only_agents_that_are_due() {
        let manager = manager(config("10.0.0.0/8", &[("fast", 1), ("slow", 3600)]));
        manager.start();
        assert!(manager.is_running());

        tokio::time::sleep(Duration::from_millis(1500)).await;

        assert!(manager.status("fast").unwrap().history.len() >= 1);
        assert_eq!(manager.status("slow").unwrap().history.len(), 0);
        assert_eq!(
            manager.status("fast").unwrap().history[0].reason,
            RotationReason::Scheduled
        );
        let report = manager.shutdown().await;
        assert!(report.stragglers.is_empty());
        assert!(!manager.is_running());
        assert_invariants(&manager);
    }

    #[tokio::test]
    async fn agents_registered_after_start_get_their_own_task() {
        let manager = manager(config("10.0.0.0/8", &[("slow", 3600)]));
        manager.start();
        manager
            .register_agent("late", AgentSettings::with_interval(1))
            .unwrap();

        tokio::time::sleep(Duration::from_millis(1500)).await;

        assert!(!manager.status("late").unwrap().history.is_empty());
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn reregistration_leaves_one_task_per_agent() {
        let manager = manager(config("10.0.0.0/8", &[("slow", 3600)]));
        manager.start();
        let base = manager.scheduler.task_count();

        manager
            .register_agent("x", AgentSettings::with_interval(3600))
            .unwrap();
        assert!(manager.deregister_agent("x"));
        manager
            .register_agent("x", AgentSettings::with_interval(3600))
            .unwrap();

        tokio::time::sleep(Duration::from_millis(200)).await;

        assert_eq!(manager.scheduler.task_count(), base + 1);
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn deregistered_agent_task_exits() {
        let manager = manager(config("10.0.0.0/8", &[("a", 3600), ("b", 3600)]));
        manager.start();
        let before = manager.scheduler.task_count();
        assert!(manager.deregister_agent("a"));

        tokio::time::sleep(Duration::from_millis(200)).await;

        assert_eq!(manager.scheduler.task_count(), before - 1);
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn shutdown_returns_promptly_with_default_poll_interval() {
        crate::logging::init_for_tests();
        let manager = RotationManager::initialize(
            config("10.0.0.0/8", &[("a", 300), ("b", 300)]),
            ManagerOptions {
                sources: Some(Vec::new()),
                ..ManagerOptions::default()
            },
        )
        .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        let started = std::time::Instant::now();
        let report = manager.shutdown().await;

        assert!(started.elapsed() < Duration::from_secs(2));
        assert_eq!(report.joined, 4);
        assert!(report.stragglers.is_empty());
    }

    #[tokio::test]
    async fn exhausted_rotation_backs_off_without_touching_identity() {
        crate::logging::init_for_tests();
        let manager = RotationManager::with_options(
            config("127.0.0.1/32", &[("solo", 1)]),
            ManagerOptions {
                timings: Timings {
                    failure_backoff: Duration::from_millis(400),
                    ..fast_timings()
                },
                sources: Some(Vec::new()),
                config_path: None,
            },
        )
        .unwrap();
        let before = manager.status("solo").unwrap();
        manager.start();

        tokio::time::sleep(Duration::from_millis(2000)).await;
        manager.shutdown().await;

        let counters = manager.statistics().counters;
        assert!(counters.rotations_failed >= 1);
        // Polling every 20ms would have tried about fifty times.
        assert!(counters.rotations_failed <= 6, "{}", counters.rotations_failed);
        assert_eq!(counters.rotations_completed, 0);
        let after = manager.status("solo").unwrap();
        assert_eq!(after.identity, before.identity);
        assert_eq!(after.assigned_at, before.assigned_at);
        assert!(after.history.is_empty());
    }

    #[tokio::test]
    async fn background_loops_run_maintenance_and_refresh() {
        crate::logging::init_for_tests();
        let mut cfg = config("10.5.5.0/26", &[("a", 3600), ("b", 3600)]);
        cfg.network.low_water_mark = 100;
        let manager = RotationManager::with_options(
            cfg,
            ManagerOptions {
                timings: Timings {
                    maintenance_interval: Duration::from_millis(100),
                    endpoint_refresh_interval: Duration::from_millis(100),
                    ..fast_timings()
                },
                sources: Some(vec![StaticSource::new(
                    "list",
                    &["192.0.2.1:3128", "192.0.2.2:3128"],
                )]),
                config_path: None,
            },
        )
        .unwrap();
        assert_eq!(manager.statistics().counters.regenerations, 0);
        manager.start();

        tokio::time::sleep(Duration::from_millis(450)).await;
        manager.shutdown().await;

        let stats = manager.statistics();
        assert!(stats.counters.regenerations >= 2, "{:?}", stats.counters);
        assert!(stats.counters.endpoint_refreshes >= 2, "{:?}", stats.counters);
        assert_eq!(stats.proxy_endpoints, 2);
        assert_eq!(manager.status("a").unwrap().assigned_proxies.len(), 2);
        assert_eq!(
            manager.status("b").unwrap().history.last().unwrap().reason,
            RotationReason::Regeneration
        );
        assert_invariants(&manager);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_rotations_keep_pool_consistent() {
        let manager = Arc::new(fleet());
        let mut handles = Vec::new();
        for worker in 0..8 {
            let manager = Arc::clone(&manager);
            handles.push(tokio::spawn(async move {
                let ids = ["alpha", "beta", "gamma", "delta"];
                for round in 0..25 {
                    let id = ids[(worker + round) % ids.len()];
                    manager.force_rotate(id).unwrap();
                    let _ = manager.all_statuses();
                    let _ = manager.statistics();
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert_invariants(&manager);
        assert_eq!(manager.statistics().counters.rotations_completed, 200);
    }

    #[tokio::test]
    async fn probe_reports_reachability_without_failing() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let mut cfg = config("127.0.0.1/32", &[("local", 300)]);
        cfg.network.port_range = (port, port);
        let manager = manager(cfg);

        let result = manager.probe_connectivity("local").await.unwrap();
        assert!(result.reachable);
        assert_eq!(result.identity.port, port);

        drop(listener);
        let result = manager.probe_connectivity("local").await.unwrap();
        assert!(!result.reachable);
        assert!(result.error.is_some());

        assert!(matches!(
            manager.probe_connectivity("ghost").await,
            Err(RotationError::NotFound(_))
        ));
    }
}
