//! Pool manager
//!
//! Owns the registry, the prober, the selector and the background services.
//! One instance per pool; `start` loads the record store and begins probing,
//! `shutdown` stops everything and flushes the final state.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use super::health::{HealthProber, ProbeConfig};
use super::lifecycle::LifecycleReporter;
use super::policy::{PolicyConfig, ScoringPolicy};
use super::registry::{Registry, StateCounts};
use super::rotation::{create_selector, EndpointSelector, RotationStrategy, SelectionContext};
use super::stats::{PoolStats, StatsSnapshot};
use super::transport::Probe;
use crate::error::{PoolError, Result};
use crate::models::{Endpoint, EndpointConfig, EndpointId, PoolSnapshot};
use crate::notify::{MetricsSink, Notifier};
use crate::services::{
    AnalyticsConfig, AnalyticsService, DispatcherService, EventDispatcher, EvictionSweepConfig,
    EvictionSweepService, ServiceHandle, StateWriter, StateWriterService,
};
use crate::store::{RecordStore, RetryPolicy};

/// Pool manager configuration
#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub probe: ProbeConfig,
    pub policy: PolicyConfig,
    pub strategy: RotationStrategy,
    /// Bound on waiting for in-flight probes and queued writes at shutdown
    pub drain_timeout: Duration,
    pub sweep_interval: Duration,
    pub analytics_interval: Duration,
    pub event_queue_capacity: usize,
    /// Pending record store writes; further writes are dropped while full
    pub state_queue_capacity: usize,
    pub store_retry: RetryPolicy,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            probe: ProbeConfig::default(),
            policy: PolicyConfig::default(),
            strategy: RotationStrategy::default(),
            drain_timeout: Duration::from_secs(15),
            sweep_interval: Duration::from_secs(60),
            analytics_interval: Duration::from_secs(60),
            event_queue_capacity: 1024,
            state_queue_capacity: 1024,
            store_retry: RetryPolicy::default(),
        }
    }
}

/// External collaborators the pool talks to
#[derive(Clone)]
pub struct Collaborators {
    pub store: Arc<dyn RecordStore>,
    pub notifier: Arc<dyn Notifier>,
    pub metrics: Arc<dyn MetricsSink>,
    pub probe: Arc<dyn Probe>,
}

/// Spawned services, taken exactly once by `shutdown`
struct BackgroundTasks {
    periodic: ServiceHandle,
    periodic_tasks: Vec<JoinHandle<()>>,
    writer: ServiceHandle,
    writer_task: JoinHandle<()>,
    dispatcher: ServiceHandle,
    dispatcher_task: JoinHandle<()>,
}

/// Single owner of a running pool
pub struct PoolManager {
    registry: Arc<Registry>,
    selector: Box<dyn EndpointSelector>,
    prober: Arc<HealthProber>,
    reporter: LifecycleReporter,
    stats: Arc<PoolStats>,
    config: PoolConfig,
    background: Mutex<Option<BackgroundTasks>>,
}

impl PoolManager {
    /// Load the record store, register every endpoint and start probing
    ///
    /// A store that stays unreachable after retries does not fail startup;
    /// the pool starts empty and logs that it is degraded.
    pub async fn start(config: PoolConfig, collaborators: Collaborators) -> Result<Self> {
        config.policy.validate()?;

        let registry = Arc::new(Registry::new(ScoringPolicy::new(config.policy.clone())));
        let stats = Arc::new(PoolStats::new());

        let (events, events_rx) = EventDispatcher::new(config.event_queue_capacity);
        let (dispatcher, dispatcher_rx) = ServiceHandle::new();
        let dispatcher_service = DispatcherService::new(
            events_rx,
            collaborators.notifier.clone(),
            collaborators.metrics.clone(),
        );
        let dispatcher_task = tokio::spawn(dispatcher_service.run(dispatcher_rx));

        let (writer_tx, writer_rx) = StateWriter::new(config.state_queue_capacity);
        let (writer, writer_shutdown_rx) = ServiceHandle::new();
        let writer_service =
            StateWriterService::new(writer_rx, collaborators.store.clone(), config.store_retry);
        let writer_task = tokio::spawn(writer_service.run(writer_shutdown_rx));

        let reporter = LifecycleReporter::new(events.clone(), writer_tx);
        let prober = Arc::new(HealthProber::new(
            registry.clone(),
            collaborators.probe.clone(),
            config.probe.clone(),
            reporter.clone(),
            stats.clone(),
        ));

        let (periodic, sweep_rx) = ServiceHandle::new();
        let analytics_rx = periodic.subscribe();

        let sweep_service = EvictionSweepService::new(
            registry.clone(),
            prober.clone(),
            reporter.clone(),
            EvictionSweepConfig {
                check_interval: config.sweep_interval,
            },
        );
        let analytics_service = AnalyticsService::new(
            registry.clone(),
            stats.clone(),
            events,
            AnalyticsConfig {
                report_interval: config.analytics_interval,
            },
        );

        let manager = PoolManager {
            registry,
            selector: create_selector(config.strategy),
            prober,
            reporter,
            stats,
            config,
            background: Mutex::new(None),
        };

        manager.load_endpoints(collaborators.store.as_ref()).await;

        let periodic_tasks = vec![
            tokio::spawn(async move { sweep_service.run(sweep_rx).await }),
            tokio::spawn(async move { analytics_service.run(analytics_rx).await }),
        ];

        *manager.background.lock() = Some(BackgroundTasks {
            periodic,
            periodic_tasks,
            writer,
            writer_task,
            dispatcher,
            dispatcher_task,
        });

        info!(
            endpoints = manager.registry.len(),
            strategy = manager.selector.strategy_name(),
            "Pool manager started"
        );

        Ok(manager)
    }

    async fn load_endpoints(&self, store: &dyn RecordStore) {
        let configs = match self
            .config
            .store_retry
            .run("load_endpoints", move || store.load_endpoints())
            .await
        {
            Ok(configs) => configs,
            Err(e) => {
                warn!(error = %e, "Could not load endpoints, starting with an empty pool");
                return;
            }
        };

        let total = configs.len();
        let mut loaded = 0usize;
        for config in configs {
            match self.register(config) {
                Ok(_) => loaded += 1,
                Err(PoolError::DuplicateEndpoint { id }) => {
                    warn!(endpoint_id = %id, "Skipping duplicate endpoint record");
                }
                Err(e) => warn!(error = %e, "Skipping endpoint record"),
            }
        }

        info!(loaded, skipped = total - loaded, "Loaded endpoints from record store");
    }

    /// Add an endpoint and start probing it
    pub fn register(&self, config: EndpointConfig) -> Result<EndpointId> {
        let id = self.registry.register(config)?;
        self.reporter.registered(&id);
        self.prober.spawn(id.clone());
        Ok(id)
    }

    /// Remove an endpoint; its probe task is cancelled first
    pub fn deregister(&self, id: &EndpointId) -> Result<Endpoint> {
        self.prober.cancel(id);

        match self.registry.deregister(id) {
            Ok(endpoint) => {
                self.reporter.removed(&endpoint, "deregistered");
                Ok(endpoint)
            }
            Err(e) => {
                debug!(endpoint_id = %id, error = %e, "Deregister failed");
                Err(e)
            }
        }
    }

    /// Manually bring an Evicted endpoint back as Candidate
    pub fn reinstate(&self, id: &EndpointId) -> Result<Endpoint> {
        let endpoint = self.registry.reinstate(id, Utc::now())?;
        self.reporter.reinstated(&endpoint, false);
        Ok(endpoint)
    }

    /// Pick a Healthy endpoint; never waits on probing
    pub fn select(&self, ctx: &SelectionContext) -> Result<EndpointId> {
        let snapshot = self.registry.snapshot();
        let result = self.selector.select(&snapshot, ctx);
        self.stats.record_selection(result.is_ok());

        if let Err(PoolError::PoolExhausted) = &result {
            debug!(healthy = snapshot.len(), "No eligible endpoint");
        }
        result
    }

    pub fn list_all(&self) -> Vec<Endpoint> {
        self.registry.list_all()
    }

    pub fn snapshot(&self) -> Arc<PoolSnapshot> {
        self.registry.snapshot()
    }

    pub fn get(&self, id: &EndpointId) -> Option<Endpoint> {
        self.registry.get(id)
    }

    pub fn counts(&self) -> StateCounts {
        self.registry.counts()
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    pub fn strategy(&self) -> &'static str {
        self.selector.strategy_name()
    }

    /// Stop probing, flush state and stop the services
    ///
    /// Calling it more than once is a no-op.
    pub async fn shutdown(&self) {
        let Some(background) = self.background.lock().take() else {
            return;
        };
        let drain = self.config.drain_timeout;

        info!("Shutting down pool manager");

        background.periodic.shutdown();
        for task in background.periodic_tasks {
            let _ = task.await;
        }

        let aborted = self.prober.shutdown(drain).await;
        if aborted > 0 {
            warn!(aborted, "Probe tasks aborted during shutdown");
        }

        let endpoints = self.registry.list_all();
        info!(endpoints = endpoints.len(), "Flushing final endpoint state");
        if timeout(drain, self.reporter.flush(&endpoints)).await.is_err() {
            warn!("Final state flush did not fit in the drain timeout");
        }

        background.writer.shutdown();
        let mut writer_task = background.writer_task;
        if timeout(drain, &mut writer_task).await.is_err() {
            warn!("State writer did not finish in time, pending writes dropped");
            writer_task.abort();
        }

        background.dispatcher.shutdown();
        let mut dispatcher_task = background.dispatcher_task;
        if timeout(drain, &mut dispatcher_task).await.is_err() {
            warn!("Event dispatcher did not finish in time");
            dispatcher_task.abort();
        }

        info!("Pool manager stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{EndpointState, EventKind, ProbeErrorKind, NEUTRAL_SCORE};
    use crate::store::MemoryRecordStore;
    use crate::testing::{
        FlakyStore, RecordingMetrics, RecordingNotifier, ScriptedProbe, StaticStore,
    };
    use tokio::time::sleep;

    struct Harness {
        manager: PoolManager,
        probe: Arc<ScriptedProbe>,
        notifier: Arc<RecordingNotifier>,
    }

    fn test_config() -> PoolConfig {
        PoolConfig {
            probe: ProbeConfig {
                jitter: Duration::ZERO,
                ..ProbeConfig::default()
            },
            policy: PolicyConfig {
                eviction_cooldown: Duration::ZERO,
                ..PolicyConfig::default()
            },
            ..PoolConfig::default()
        }
    }

    fn endpoint(port: u16) -> EndpointConfig {
        EndpointConfig::parse(&format!("http://10.0.0.1:{}", port)).unwrap()
    }

    async fn start(store: Arc<dyn RecordStore>, config: PoolConfig) -> Harness {
        start_with_probe(store, config, ScriptedProbe::ok()).await
    }

    async fn start_with_probe(
        store: Arc<dyn RecordStore>,
        config: PoolConfig,
        probe: ScriptedProbe,
    ) -> Harness {
        let probe = Arc::new(probe);
        let notifier = Arc::new(RecordingNotifier::default());
        let manager = PoolManager::start(
            config,
            Collaborators {
                store,
                notifier: notifier.clone(),
                metrics: Arc::new(RecordingMetrics::default()),
                probe: probe.clone(),
            },
        )
        .await
        .unwrap();

        Harness {
            manager,
            probe,
            notifier,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_loads_and_promotes_endpoints() {
        let store = Arc::new(MemoryRecordStore::with_endpoints(vec![
            endpoint(8080),
            endpoint(8081),
        ]));
        let h = start(store, test_config()).await;

        assert_eq!(h.manager.list_all().len(), 2);
        assert!(matches!(
            h.manager.select(&SelectionContext::new()),
            Err(PoolError::PoolExhausted)
        ));

        sleep(Duration::from_secs(45)).await;

        assert_eq!(h.manager.counts().healthy, 2);
        let first = h.manager.select(&SelectionContext::new()).unwrap();
        let second = h.manager.select(&SelectionContext::new()).unwrap();
        assert_ne!(first, second);

        h.manager.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_duplicate_and_unreachable_store() {
        let store = Arc::new(StaticStore::new(vec![endpoint(8080), endpoint(8080)]));
        let h = start(store, test_config()).await;
        assert_eq!(h.manager.list_all().len(), 1);
        h.manager.shutdown().await;

        let config = PoolConfig {
            store_retry: RetryPolicy {
                max_attempts: 2,
                base_delay: Duration::from_millis(10),
                max_delay: Duration::from_millis(10),
            },
            ..test_config()
        };
        let store = Arc::new(FlakyStore::new(vec![endpoint(8080)], u32::MAX));
        let h = start(store, config).await;
        assert!(h.manager.list_all().is_empty());

        let id = h.manager.register(endpoint(9000)).unwrap();
        assert!(h.manager.get(&id).is_some());
        h.manager.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_register_twice_is_rejected() {
        let h = start(Arc::new(MemoryRecordStore::new()), test_config()).await;

        h.manager.register(endpoint(8080)).unwrap();
        assert!(matches!(
            h.manager.register(endpoint(8080)),
            Err(PoolError::DuplicateEndpoint { .. })
        ));
        assert_eq!(h.manager.list_all().len(), 1);

        h.manager.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_lifecycle_through_eviction_and_reinstatement() {
        let h = start(Arc::new(MemoryRecordStore::new()), test_config()).await;
        let id = h.manager.register(endpoint(8080)).unwrap();

        // Probes at t=0 and t=30 promote the endpoint
        sleep(Duration::from_secs(45)).await;
        assert_eq!(h.manager.get(&id).unwrap().state, EndpointState::Healthy);

        // Failures at t=60, 90 and 120 degrade it
        h.probe.set_outcome(Err(ProbeErrorKind::ConnectionRefused));
        sleep(Duration::from_secs(80)).await;
        assert_eq!(h.manager.get(&id).unwrap().state, EndpointState::Degraded);
        assert!(matches!(
            h.manager.select(&SelectionContext::new()),
            Err(PoolError::PoolExhausted)
        ));

        // Five more failures, the last at t=270, evict it
        sleep(Duration::from_secs(150)).await;
        assert_eq!(h.manager.get(&id).unwrap().state, EndpointState::Evicted);

        // The next sweep reinstates it immediately with a zero cooldown
        h.probe.set_outcome(Ok(()));
        sleep(Duration::from_secs(60)).await;

        let kinds: Vec<EventKind> = h.notifier.events_for(&id).iter().map(|e| e.kind).collect();
        assert!(kinds.contains(&EventKind::Registered));
        assert!(kinds.contains(&EventKind::StateTransitioned));
        assert!(kinds.contains(&EventKind::Evicted));
        assert!(kinds.contains(&EventKind::Reinstated));

        let ep = h.manager.get(&id).unwrap();
        assert_ne!(ep.state, EndpointState::Evicted);
        assert_eq!(ep.reinstatements, 1);

        h.manager.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_manual_reinstatement() {
        let config = PoolConfig {
            policy: PolicyConfig::default(),
            ..test_config()
        };
        let h = start(Arc::new(MemoryRecordStore::new()), config).await;
        let id = h.manager.register(endpoint(8080)).unwrap();

        assert!(matches!(
            h.manager.reinstate(&id),
            Err(PoolError::InvalidTransition { .. })
        ));

        sleep(Duration::from_secs(45)).await;
        h.probe.set_outcome(Err(ProbeErrorKind::Timeout));
        sleep(Duration::from_secs(240)).await;
        assert_eq!(h.manager.get(&id).unwrap().state, EndpointState::Evicted);

        let ep = h.manager.reinstate(&id).unwrap();
        assert_eq!(ep.state, EndpointState::Candidate);
        assert_eq!(ep.score, NEUTRAL_SCORE);

        h.manager.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_deregister_stops_selection_and_archives() {
        let store = Arc::new(MemoryRecordStore::with_endpoints(vec![
            endpoint(8080),
            endpoint(8081),
        ]));
        let h = start(store.clone(), test_config()).await;
        sleep(Duration::from_secs(45)).await;

        let gone = endpoint(8080).id();
        h.manager.deregister(&gone).unwrap();
        assert!(matches!(
            h.manager.deregister(&gone),
            Err(PoolError::NotFound { .. })
        ));

        for _ in 0..10 {
            assert_ne!(h.manager.select(&SelectionContext::new()).unwrap(), gone);
        }

        h.manager.shutdown().await;
        assert_eq!(store.removed(), vec![gone.clone()]);
        assert!(h
            .notifier
            .events_for(&gone)
            .iter()
            .any(|e| e.kind == EventKind::Removed));
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_flushes_final_state() {
        let store = Arc::new(MemoryRecordStore::with_endpoints(vec![endpoint(8080)]));
        let h = start(store.clone(), test_config()).await;
        let id = endpoint(8080).id();

        sleep(Duration::from_secs(100)).await;
        let ep = h.manager.get(&id).unwrap();
        assert_eq!(ep.state, EndpointState::Healthy);

        h.manager.shutdown().await;
        h.manager.shutdown().await;

        assert_eq!(store.state_of(&id), Some((EndpointState::Healthy, ep.score)));
        assert!(h.probe.calls() >= 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_flushes_result_of_in_flight_probe() {
        let store = Arc::new(MemoryRecordStore::with_endpoints(vec![endpoint(8080)]));
        let probe = ScriptedProbe::ok().with_delay(Duration::from_secs(2));
        let h = start_with_probe(store.clone(), test_config(), probe).await;
        let id = endpoint(8080).id();

        // The first probe ends at t=2, the second runs from t=32 to t=34
        sleep(Duration::from_secs(33)).await;
        assert_eq!(h.manager.get(&id).unwrap().state, EndpointState::Candidate);
        assert_eq!(h.probe.calls(), 2);

        h.manager.shutdown().await;

        let ep = h.manager.get(&id).unwrap();
        assert_eq!(ep.probes_total, 2);
        assert_eq!(ep.state, EndpointState::Healthy);
        assert_eq!(store.state_of(&id), Some((EndpointState::Healthy, ep.score)));
        assert_eq!(h.manager.stats().probes_total, 2);
    }
}
