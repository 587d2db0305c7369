//! Outbound event dispatcher
//!
//! Lifecycle events and metrics are queued on a bounded channel and
//! delivered by one worker task. Enqueueing never waits: when the queue is
//! full the item is dropped and counted.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::time::timeout;
use tracing::{debug, info, instrument, warn};

use crate::models::{Metric, PoolEvent};
use crate::notify::{MetricsSink, Notifier};

/// Upper bound on one notifier call
const NOTIFY_TIMEOUT: Duration = Duration::from_secs(5);

/// Item travelling to the collaborators
#[derive(Debug, Clone)]
pub enum Outbound {
    Event(PoolEvent),
    Metric(Metric),
}

/// Cheap, cloneable producer side of the outbound queue
#[derive(Clone)]
pub struct EventDispatcher {
    tx: mpsc::Sender<Outbound>,
    dropped: Arc<AtomicU64>,
}

impl EventDispatcher {
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<Outbound>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (
            Self {
                tx,
                dropped: Arc::new(AtomicU64::new(0)),
            },
            rx,
        )
    }

    pub fn emit_event(&self, event: PoolEvent) {
        self.enqueue(Outbound::Event(event));
    }

    pub fn emit_metric(&self, metric: Metric) {
        self.enqueue(Outbound::Metric(metric));
    }

    /// Items discarded because the queue was full or closed
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    fn enqueue(&self, item: Outbound) {
        match self.tx.try_send(item) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                let total = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                debug!(dropped_total = total, "Outbound queue full, dropping item");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                debug!("Outbound queue closed, dropping item");
            }
        }
    }
}

/// Consumer side: delivers queued items to the collaborators
pub struct DispatcherService {
    rx: mpsc::Receiver<Outbound>,
    notifier: Arc<dyn Notifier>,
    metrics: Arc<dyn MetricsSink>,
}

impl DispatcherService {
    pub fn new(
        rx: mpsc::Receiver<Outbound>,
        notifier: Arc<dyn Notifier>,
        metrics: Arc<dyn MetricsSink>,
    ) -> Self {
        Self {
            rx,
            notifier,
            metrics,
        }
    }

    /// Run until shutdown, then deliver whatever is already queued
    #[instrument(skip(self, shutdown))]
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!("Starting event dispatcher");

        loop {
            tokio::select! {
                item = self.rx.recv() => match item {
                    Some(item) => self.deliver(item).await,
                    None => break,
                },
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        self.rx.close();
        let mut drained = 0usize;
        while let Ok(item) = self.rx.try_recv() {
            self.deliver(item).await;
            drained += 1;
        }

        info!(drained, "Event dispatcher shutting down");
    }

    async fn deliver(&self, item: Outbound) {
        match item {
            Outbound::Event(event) => {
                match timeout(NOTIFY_TIMEOUT, self.notifier.notify(&event)).await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => {
                        warn!(
                            endpoint_id = %event.endpoint_id,
                            kind = event.kind.as_str(),
                            error = %e,
                            "Notification failed"
                        );
                    }
                    Err(_) => {
                        warn!(
                            endpoint_id = %event.endpoint_id,
                            kind = event.kind.as_str(),
                            "Notification timed out"
                        );
                    }
                }
            }
            Outbound::Metric(metric) => self.metrics.emit_metric(&metric),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{EndpointId, EventKind};
    use crate::services::ServiceHandle;
    use crate::testing::{FailingNotifier, RecordingMetrics, RecordingNotifier};

    fn event(kind: EventKind) -> PoolEvent {
        PoolEvent::new(kind, EndpointId::from("http://a:8080"), "")
    }

    #[test]
    fn test_full_queue_drops_without_blocking() {
        let (dispatcher, _rx) = EventDispatcher::new(2);
        for _ in 0..5 {
            dispatcher.emit_event(event(EventKind::Registered));
        }
        assert_eq!(dispatcher.dropped(), 3);
    }

    #[tokio::test]
    async fn test_delivers_events_and_metrics() {
        let (dispatcher, rx) = EventDispatcher::new(16);
        let notifier = Arc::new(RecordingNotifier::default());
        let metrics = Arc::new(RecordingMetrics::default());
        let service = DispatcherService::new(rx, notifier.clone(), metrics.clone());
        let (handle, shutdown_rx) = ServiceHandle::new();

        dispatcher.emit_event(event(EventKind::Registered));
        dispatcher.emit_event(event(EventKind::Evicted));
        dispatcher.emit_metric(Metric::new("pool.endpoints.healthy", 3.0));

        handle.shutdown();
        service.run(shutdown_rx).await;

        let kinds: Vec<EventKind> = notifier.events().iter().map(|e| e.kind).collect();
        assert_eq!(kinds, vec![EventKind::Registered, EventKind::Evicted]);
        assert_eq!(metrics.values("pool.endpoints.healthy"), vec![3.0]);
    }

    #[tokio::test]
    async fn test_failing_notifier_is_swallowed() {
        let (dispatcher, rx) = EventDispatcher::new(16);
        let metrics = Arc::new(RecordingMetrics::default());
        let service = DispatcherService::new(rx, Arc::new(FailingNotifier), metrics.clone());
        let (handle, shutdown_rx) = ServiceHandle::new();

        dispatcher.emit_event(event(EventKind::Evicted));
        dispatcher.emit_metric(Metric::new("pool.probe.success_rate", 0.5));

        handle.shutdown();
        service.run(shutdown_rx).await;

        assert_eq!(metrics.values("pool.probe.success_rate"), vec![0.5]);
    }
}
