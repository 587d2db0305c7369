//! Health probing for registered endpoints
//!
//! Each endpoint gets its own task that probes on a jittered interval. A
//! shared semaphore bounds how many probes are in flight across the pool.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use rand::Rng;
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout, Instant};
use tracing::{debug, error, info, instrument, warn};

use super::lifecycle::LifecycleReporter;
use super::registry::Registry;
use super::stats::PoolStats;
use super::transport::Probe;
use crate::error::PoolError;
use crate::models::{EndpointConfig, EndpointId, EndpointState, ProbeErrorKind, ProbeResult};

/// Probe scheduling configuration
#[derive(Debug, Clone)]
pub struct ProbeConfig {
    /// Interval between probes of one endpoint
    pub interval: Duration,
    /// Upper bound of the random delay added to every interval
    pub jitter: Duration,
    /// Timeout for each probe
    pub timeout: Duration,
    /// Probes allowed in flight at once
    pub workers: usize,
    /// Where probes tunnel to
    pub target_url: String,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            jitter: Duration::from_secs(5),
            timeout: Duration::from_secs(10),
            workers: 20,
            target_url: "http://www.google.com".to_string(),
        }
    }
}

struct ProbeTask {
    serial: u64,
    cancel: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

/// State shared by every probe task
struct ProberShared {
    registry: Arc<Registry>,
    probe: Arc<dyn Probe>,
    config: ProbeConfig,
    permits: Arc<Semaphore>,
    reporter: LifecycleReporter,
    stats: Arc<PoolStats>,
    tasks: DashMap<EndpointId, ProbeTask>,
    shutdown_rx: watch::Receiver<bool>,
}

impl ProberShared {
    fn jitter(&self) -> Duration {
        let max_ms = self.config.jitter.as_millis() as u64;
        Duration::from_millis(rand::thread_rng().gen_range(0..=max_ms))
    }

    fn next_delay(&self) -> Duration {
        self.config.interval + self.jitter()
    }

    async fn probe_once(&self, id: &EndpointId, config: &EndpointConfig) -> ProbeResult {
        let started = Instant::now();
        let outcome = timeout(self.config.timeout, self.probe.probe(config)).await;
        let latency = started.elapsed();

        match outcome {
            Ok(Ok(())) => {
                debug!(
                    endpoint_id = %id,
                    latency_ms = latency.as_millis() as u64,
                    "Probe succeeded"
                );
                ProbeResult::success(id.clone(), latency, Utc::now())
            }
            Ok(Err(kind)) => {
                debug!(endpoint_id = %id, error = %kind, "Probe failed");
                ProbeResult::failure(id.clone(), kind, Utc::now())
            }
            Err(_) => {
                debug!(
                    endpoint_id = %id,
                    timeout_ms = self.config.timeout.as_millis() as u64,
                    "Probe timed out"
                );
                ProbeResult::failure(id.clone(), ProbeErrorKind::Timeout, Utc::now())
            }
        }
    }

    /// Record a result; only results the registry applied are counted
    fn apply(&self, id: &EndpointId, result: ProbeResult) {
        let success = result.success;

        match self.registry.record_probe(id, result) {
            Ok(outcome) => {
                if outcome.previous_state != EndpointState::Evicted {
                    self.stats.record_probe(success);
                }
                self.reporter.probe_applied(&outcome);
            }
            Err(PoolError::NotFound { .. }) => {
                debug!(endpoint_id = %id, "Dropping probe result for removed endpoint");
            }
            Err(e) => {
                error!(endpoint_id = %id, error = %e, "Failed to record probe result");
            }
        }
    }

    /// Drop the map entry of a finished task unless it was replaced
    fn forget(&self, id: &EndpointId, serial: u64) {
        self.tasks.remove_if(id, |_, task| task.serial == serial);
    }
}

/// Schedules and owns the per-endpoint probe tasks
pub struct HealthProber {
    shared: Arc<ProberShared>,
    next_serial: AtomicU64,
    shutdown_tx: watch::Sender<bool>,
}

impl HealthProber {
    pub fn new(
        registry: Arc<Registry>,
        probe: Arc<dyn Probe>,
        config: ProbeConfig,
        reporter: LifecycleReporter,
        stats: Arc<PoolStats>,
    ) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let permits = Arc::new(Semaphore::new(config.workers.max(1)));

        Self {
            shared: Arc::new(ProberShared {
                registry,
                probe,
                config,
                permits,
                reporter,
                stats,
                tasks: DashMap::new(),
                shutdown_rx,
            }),
            next_serial: AtomicU64::new(0),
            shutdown_tx,
        }
    }

    pub fn config(&self) -> &ProbeConfig {
        &self.shared.config
    }

    /// Start probing an endpoint, replacing any task left for the same id
    pub fn spawn(&self, id: EndpointId) {
        if *self.shutdown_tx.borrow() {
            warn!(endpoint_id = %id, "Prober is shutting down, not starting probe task");
            return;
        }

        let serial = self.next_serial.fetch_add(1, Ordering::Relaxed);
        let (cancel_tx, cancel_rx) = watch::channel(false);

        // Hold the entry until the task is stored so that a task exiting
        // early cannot miss its own entry
        let entry = self.shared.tasks.entry(id.clone());
        let handle = tokio::spawn(probe_loop(self.shared.clone(), id.clone(), serial, cancel_rx));
        let task = ProbeTask {
            serial,
            cancel: cancel_tx,
            handle,
        };

        match entry {
            Entry::Occupied(mut slot) => {
                let previous = slot.insert(task);
                let _ = previous.cancel.send(true);
            }
            Entry::Vacant(slot) => {
                slot.insert(task);
            }
        }
        debug!(endpoint_id = %id, "Probe task started");
    }

    /// Stop probing an endpoint; an in-flight probe is abandoned
    pub fn cancel(&self, id: &EndpointId) -> bool {
        match self.shared.tasks.remove(id) {
            Some((_, task)) => {
                let _ = task.cancel.send(true);
                debug!(endpoint_id = %id, "Probe task cancelled");
                true
            }
            None => false,
        }
    }

    /// Number of live probe tasks
    pub fn active_tasks(&self) -> usize {
        self.shared
            .tasks
            .iter()
            .filter(|t| !t.handle.is_finished())
            .count()
    }

    /// Stop scheduling, let in-flight probes finish within `drain`, abort the rest
    ///
    /// Returns how many tasks had to be aborted.
    #[instrument(skip(self))]
    pub async fn shutdown(&self, drain: Duration) -> usize {
        let _ = self.shutdown_tx.send(true);

        // Cancel senders stay alive until the tasks are done; a dropped
        // sender wakes its task like a cancellation
        let ids: Vec<EndpointId> = self.shared.tasks.iter().map(|t| t.key().clone()).collect();
        let mut tasks: Vec<ProbeTask> = ids
            .iter()
            .filter_map(|id| self.shared.tasks.remove(id).map(|(_, task)| task))
            .collect();

        info!(
            tasks = tasks.len(),
            drain_ms = drain.as_millis() as u64,
            "Draining probe tasks"
        );

        let handles = tasks.iter_mut().map(|task| &mut task.handle);
        if timeout(drain, futures::future::join_all(handles)).await.is_ok() {
            info!("All probe tasks finished");
            return 0;
        }

        let mut aborted = 0;
        for task in tasks.iter().filter(|t| !t.handle.is_finished()) {
            task.handle.abort();
            aborted += 1;
        }
        warn!(aborted, "Aborted probe tasks that outlived the drain timeout");
        aborted
    }
}

/// Probe one endpoint until cancelled, shut down or deregistered
async fn probe_loop(
    shared: Arc<ProberShared>,
    id: EndpointId,
    serial: u64,
    mut cancel: watch::Receiver<bool>,
) {
    run_probes(&shared, &id, &mut cancel).await;
    shared.forget(&id, serial);
}

async fn run_probes(shared: &ProberShared, id: &EndpointId, cancel: &mut watch::Receiver<bool>) {
    let mut shutdown = shared.shutdown_rx.clone();
    let mut delay = shared.jitter();
    let mut owned_generation = None;

    loop {
        tokio::select! {
            _ = sleep(delay) => {}
            Ok(()) = cancel.changed() => break,
            _ = shutdown.changed() => break,
        }
        if *shutdown.borrow() {
            break;
        }

        let (config, generation) = match shared.registry.probe_target(id) {
            Ok(Some(target)) => target,
            Ok(None) => {
                delay = shared.next_delay();
                continue;
            }
            Err(_) => {
                debug!(endpoint_id = %id, "Endpoint no longer registered, stopping probe task");
                break;
            }
        };

        // A re-registration under the same id gets its own task
        if *owned_generation.get_or_insert(generation) != generation {
            debug!(endpoint_id = %id, "Endpoint was re-registered, stopping stale probe task");
            break;
        }

        let permit = tokio::select! {
            permit = shared.permits.clone().acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => break,
            },
            Ok(()) = cancel.changed() => break,
            _ = shutdown.changed() => break,
        };

        let result = tokio::select! {
            result = shared.probe_once(id, &config) => result,
            Ok(()) = cancel.changed() => {
                debug!(endpoint_id = %id, "Abandoning in-flight probe");
                break;
            }
        };
        drop(permit);

        shared.apply(id, result.with_generation(generation));
        delay = shared.next_delay();
    }
}
