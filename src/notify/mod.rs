//! Outbound notification and analytics collaborators
//!
//! Both are best-effort. The pool hands items to the event dispatcher, which
//! calls these from its own task; a failing or slow collaborator never
//! reaches the registry or the selector.

use async_trait::async_trait;
use tokio::sync::broadcast;
use tracing::{debug, info};

use crate::models::{Metric, PoolEvent};

/// Receives pool lifecycle events
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, event: &PoolEvent) -> anyhow::Result<()>;
}

/// Receives periodic aggregate metrics
pub trait MetricsSink: Send + Sync {
    fn emit_metric(&self, metric: &Metric);
}

/// Writes events to the log
#[derive(Debug, Default, Clone)]
pub struct TracingNotifier;

#[async_trait]
impl Notifier for TracingNotifier {
    async fn notify(&self, event: &PoolEvent) -> anyhow::Result<()> {
        info!(
            kind = event.kind.as_str(),
            endpoint_id = %event.endpoint_id,
            timestamp = %event.timestamp,
            detail = %event.detail,
            "Pool event"
        );
        Ok(())
    }
}

/// Publishes events to any number of in-process subscribers
///
/// Sending with no subscribers is not an error; events are simply dropped.
#[derive(Debug, Clone)]
pub struct BroadcastNotifier {
    sender: broadcast::Sender<PoolEvent>,
}

impl BroadcastNotifier {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PoolEvent> {
        self.sender.subscribe()
    }
}

#[async_trait]
impl Notifier for BroadcastNotifier {
    async fn notify(&self, event: &PoolEvent) -> anyhow::Result<()> {
        if self.sender.send(event.clone()).is_err() {
            debug!(endpoint_id = %event.endpoint_id, "No event subscribers");
        }
        Ok(())
    }
}

/// Writes metrics to the log
#[derive(Debug, Default, Clone)]
pub struct TracingMetricsSink;

impl MetricsSink for TracingMetricsSink {
    fn emit_metric(&self, metric: &Metric) {
        let tags = metric
            .tags
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect::<Vec<_>>()
            .join(",");
        info!(metric = metric.name, value = metric.value, tags = %tags, "Pool metric");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{EndpointId, EventKind};

    #[tokio::test]
    async fn test_broadcast_notifier_delivers_to_subscribers() {
        let notifier = BroadcastNotifier::new(8);
        let mut rx = notifier.subscribe();

        let event = PoolEvent::new(
            EventKind::Evicted,
            EndpointId::from("http://a:8080"),
            "5 consecutive failures",
        );
        notifier.notify(&event).await.unwrap();

        let received = rx.recv().await.unwrap();
        assert_eq!(received.kind, EventKind::Evicted);
        assert_eq!(received.endpoint_id.as_str(), "http://a:8080");
    }

    #[tokio::test]
    async fn test_broadcast_notifier_without_subscribers() {
        let notifier = BroadcastNotifier::new(8);
        let event = PoolEvent::new(EventKind::Registered, EndpointId::from("http://a:8080"), "");
        assert!(notifier.notify(&event).await.is_ok());
    }
}
