//! Scripted probe and recording collaborators for unit tests

use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::error::{PoolError, Result};
use crate::models::{EndpointConfig, EndpointId, EndpointState, Metric, PoolEvent};
use crate::notify::{MetricsSink, Notifier};
use crate::pool::{Probe, ProbeStatus};
use crate::store::{MemoryRecordStore, RecordStore};

/// Probe whose outcome is set by the test
pub struct ScriptedProbe {
    outcome: Mutex<ProbeStatus>,
    delay: Duration,
    calls: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl ScriptedProbe {
    pub fn ok() -> Self {
        Self {
            outcome: Mutex::new(Ok(())),
            delay: Duration::ZERO,
            calls: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        }
    }

    /// Every probe takes `delay` before answering
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn set_outcome(&self, outcome: ProbeStatus) {
        *self.outcome.lock() = outcome;
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}

struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl Probe for ScriptedProbe {
    async fn probe(&self, _config: &EndpointConfig) -> ProbeStatus {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        let _guard = InFlight(&self.in_flight);

        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        *self.outcome.lock()
    }
}

/// Keeps every event it is handed
#[derive(Default)]
pub struct RecordingNotifier {
    events: Mutex<Vec<PoolEvent>>,
}

impl RecordingNotifier {
    pub fn events(&self) -> Vec<PoolEvent> {
        self.events.lock().clone()
    }

    pub fn events_for(&self, id: &EndpointId) -> Vec<PoolEvent> {
        self.events
            .lock()
            .iter()
            .filter(|e| &e.endpoint_id == id)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify(&self, event: &PoolEvent) -> anyhow::Result<()> {
        self.events.lock().push(event.clone());
        Ok(())
    }
}

/// Always fails
pub struct FailingNotifier;

#[async_trait]
impl Notifier for FailingNotifier {
    async fn notify(&self, _event: &PoolEvent) -> anyhow::Result<()> {
        anyhow::bail!("notification channel unreachable")
    }
}

/// Keeps every metric it is handed
#[derive(Default)]
pub struct RecordingMetrics {
    metrics: Mutex<Vec<Metric>>,
}

impl RecordingMetrics {
    pub fn values(&self, name: &str) -> Vec<f64> {
        self.metrics
            .lock()
            .iter()
            .filter(|m| m.name == name)
            .map(|m| m.value)
            .collect()
    }
}

impl MetricsSink for RecordingMetrics {
    fn emit_metric(&self, metric: &Metric) {
        self.metrics.lock().push(metric.clone());
    }
}

/// Returns a fixed list from `load_endpoints`, duplicates included
pub struct StaticStore {
    configs: Vec<EndpointConfig>,
}

impl StaticStore {
    pub fn new(configs: Vec<EndpointConfig>) -> Self {
        Self { configs }
    }
}

#[async_trait]
impl RecordStore for StaticStore {
    async fn load_endpoints(&self) -> Result<Vec<EndpointConfig>> {
        Ok(self.configs.clone())
    }

    async fn save_endpoint_state(&self, _: &EndpointId, _: EndpointState, _: f64) -> Result<()> {
        Ok(())
    }

    async fn record_endpoint_removed(&self, _: &EndpointId) -> Result<()> {
        Ok(())
    }
}

/// Memory store that fails its first `failures` calls
pub struct FlakyStore {
    inner: MemoryRecordStore,
    failures_left: AtomicU32,
    attempts: AtomicU32,
}

impl FlakyStore {
    pub fn new(configs: Vec<EndpointConfig>, failures: u32) -> Self {
        Self {
            inner: MemoryRecordStore::with_endpoints(configs),
            failures_left: AtomicU32::new(failures),
            attempts: AtomicU32::new(0),
        }
    }

    pub fn inner(&self) -> &MemoryRecordStore {
        &self.inner
    }

    pub fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }

    fn check(&self) -> Result<()> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let failing = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            Err(PoolError::StorageUnavailable("injected failure".into()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl RecordStore for FlakyStore {
    async fn load_endpoints(&self) -> Result<Vec<EndpointConfig>> {
        self.check()?;
        self.inner.load_endpoints().await
    }

    async fn save_endpoint_state(
        &self,
        id: &EndpointId,
        state: EndpointState,
        score: f64,
    ) -> Result<()> {
        self.check()?;
        self.inner.save_endpoint_state(id, state, score).await
    }

    async fn record_endpoint_removed(&self, id: &EndpointId) -> Result<()> {
        self.check()?;
        self.inner.record_endpoint_removed(id).await
    }
}
