//! Background tasks: one rotation loop per agent, one pool-maintenance loop
//! and one endpoint-refresh loop. All of them stop on a shared `watch`
//! signal, checked at every poll boundary.

use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::manager::{Shared, Tick};

struct ScheduledTask {
    name: String,
    handle: JoinHandle<()>,
}

/// What happened to the background tasks on shutdown.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ShutdownReport {
    pub joined: usize,
    /// Tasks that missed the join deadline and were aborted.
    pub stragglers: Vec<String>,
}

/// Owns the stop signal and the handles of every spawned task.
pub struct Scheduler {
    stop: watch::Sender<bool>,
    tasks: Mutex<Vec<ScheduledTask>>,
}

impl Scheduler {
    pub fn new() -> Self {
        let (stop, _) = watch::channel(false);
        Self {
            stop,
            tasks: Mutex::new(Vec::new()),
        }
    }

    pub fn is_stopped(&self) -> bool {
        *self.stop.borrow()
    }

    pub fn task_count(&self) -> usize {
        self.tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|task| !task.handle.is_finished())
            .count()
    }

    /// Spawns `body` with its own stop receiver. Must run inside a tokio runtime.
    pub(crate) fn spawn<F, Fut>(&self, name: impl Into<String>, body: F)
    where
        F: FnOnce(watch::Receiver<bool>) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        if self.is_stopped() {
            return;
        }
        let name = name.into();
        let handle = tokio::spawn(body(self.stop.subscribe()));
        let mut tasks = self.tasks.lock().unwrap_or_else(PoisonError::into_inner);
        tasks.retain(|task| !task.handle.is_finished());
        tasks.push(ScheduledTask { name, handle });
    }

    /// Signals every task to stop and waits up to `timeout` for them to exit.
    /// Tasks still running at the deadline are aborted and reported.
    pub async fn shutdown(&self, timeout: Duration) -> ShutdownReport {
        self.stop.send_replace(true);
        let tasks = {
            let mut guard = self.tasks.lock().unwrap_or_else(PoisonError::into_inner);
            std::mem::take(&mut *guard)
        };

        let deadline = tokio::time::Instant::now() + timeout;
        let mut report = ShutdownReport::default();
        for mut task in tasks {
            match tokio::time::timeout_at(deadline, &mut task.handle).await {
                Ok(Ok(())) => report.joined += 1,
                Ok(Err(e)) => {
                    log::error!("task {} ended abnormally: {}", task.name, e);
                    report.joined += 1;
                }
                Err(_) => {
                    task.handle.abort();
                    report.stragglers.push(task.name);
                }
            }
        }
        if !report.stragglers.is_empty() {
            log::warn!(
                "shutdown proceeded without {} task(s): {}",
                report.stragglers.len(),
                report.stragglers.join(", ")
            );
        }
        report
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

/// Sleeps for `delay` unless the stop signal fires first.
/// Returns `false` once the task should exit.
async fn wait_or_stop(delay: Duration, stop: &mut watch::Receiver<bool>) -> bool {
    if *stop.borrow() {
        return false;
    }
    tokio::select! {
        _ = tokio::time::sleep(delay) => !*stop.borrow(),
        changed = stop.changed() => changed.is_ok() && !*stop.borrow(),
    }
}

/// Idle → Due → Rotating → Idle, until stopped or the agent goes away.
pub(crate) async fn run_agent(
    shared: Arc<Shared>,
    agent_id: String,
    serial: u64,
    mut stop: watch::Receiver<bool>,
) {
    let timings = shared.timings().clone();
    let mut delay = timings.poll_interval;
    log::debug!("rotation task for {agent_id} started");

    while wait_or_stop(delay, &mut stop).await {
        match shared.rotate_if_due(&agent_id, serial) {
            Ok(Tick::Idle) => delay = timings.poll_interval,
            Ok(Tick::Rotated(outcome)) => {
                log::debug!("{agent_id} now at {}", outcome.current);
                delay = timings.poll_interval;
            }
            Ok(Tick::Gone) => {
                log::debug!("agent {agent_id} deregistered, rotation task exiting");
                return;
            }
            Err(e) => {
                // Timer is not reset; the next check comes after the backoff.
                log::warn!("rotation for {agent_id} failed, retrying in {:?}: {e}", timings.failure_backoff);
                delay = timings.failure_backoff;
            }
        }
    }
    log::debug!("rotation task for {agent_id} stopped");
}

pub(crate) async fn run_pool_maintenance(shared: Arc<Shared>, mut stop: watch::Receiver<bool>) {
    let interval = shared.timings().maintenance_interval;
    while wait_or_stop(interval, &mut stop).await {
        match shared.maintain_pool() {
            Ok(true) => log::info!("identity pool regenerated below low-water mark"),
            Ok(false) => {}
            Err(e) => log::error!("pool maintenance failed: {e}"),
        }
    }
    log::debug!("pool maintenance task stopped");
}

/// Refreshes once right away, then on every interval.
pub(crate) async fn run_endpoint_refresh(shared: Arc<Shared>, mut stop: watch::Receiver<bool>) {
    let interval = shared.timings().endpoint_refresh_interval;
    let mut delay = Duration::ZERO;
    while wait_or_stop(delay, &mut stop).await {
        let result = shared.refresh_endpoints().await;
        if !result.failed_sources.is_empty() {
            log::warn!("{} endpoint source(s) failed", result.failed_sources.len());
        }
        delay = interval;
    }
    log::debug!("endpoint refresh task stopped");
}
