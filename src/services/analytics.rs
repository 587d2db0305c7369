//! Analytics reporter
//!
//! Emits aggregate pool metrics to the analytics sink on a fixed interval.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::interval;
use tracing::{debug, info, instrument};

use super::EventDispatcher;
use crate::models::Metric;
use crate::pool::{PoolStats, Registry, StatsSnapshot};

/// Analytics reporter configuration
#[derive(Clone)]
pub struct AnalyticsConfig {
    /// How often to emit metrics
    pub report_interval: Duration,
}

impl Default for AnalyticsConfig {
    fn default() -> Self {
        Self {
            report_interval: Duration::from_secs(60),
        }
    }
}

/// Analytics reporter service
pub struct AnalyticsService {
    registry: Arc<Registry>,
    stats: Arc<PoolStats>,
    events: EventDispatcher,
    config: AnalyticsConfig,
}

impl AnalyticsService {
    pub fn new(
        registry: Arc<Registry>,
        stats: Arc<PoolStats>,
        events: EventDispatcher,
        config: AnalyticsConfig,
    ) -> Self {
        Self {
            registry,
            stats,
            events,
            config,
        }
    }

    /// Run the analytics reporter
    #[instrument(skip(self, shutdown))]
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            "Starting analytics reporter (interval: {}s)",
            self.config.report_interval.as_secs()
        );

        let mut ticker = interval(self.config.report_interval);
        ticker.tick().await; // Skip immediate tick
        let mut previous = self.stats.snapshot();

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let current = self.stats.snapshot();
                    self.report(&current.since(&previous));
                    previous = current;
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("Analytics reporter shutting down");
                        break;
                    }
                }
            }
        }
    }

    /// Emit one round of metrics for the counter growth in `delta`
    pub fn report(&self, delta: &StatsSnapshot) {
        let counts = self.registry.counts();

        for (state, count) in [
            ("candidate", counts.candidate),
            ("healthy", counts.healthy),
            ("degraded", counts.degraded),
            ("evicted", counts.evicted),
        ] {
            self.events
                .emit_metric(Metric::new("pool.endpoints", count as f64).tag("state", state));
        }

        if let Some(rate) = delta.probe_success_rate() {
            self.events
                .emit_metric(Metric::new("pool.probe.success_rate", rate));
        }

        let secs = self.config.report_interval.as_secs_f64().max(1.0);
        self.events.emit_metric(Metric::new(
            "pool.selections.per_second",
            delta.selections as f64 / secs,
        ));
        self.events
            .emit_metric(Metric::new("pool.selections.exhausted", delta.exhausted as f64));
        self.events.emit_metric(Metric::new(
            "pool.outbound.dropped",
            self.events.dropped() as f64,
        ));

        debug!(
            healthy = counts.healthy,
            evicted = counts.evicted,
            selections = delta.selections,
            "Reported pool metrics"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::EndpointConfig;
    use crate::pool::{PolicyConfig, ScoringPolicy};
    use crate::services::Outbound;

    #[test]
    fn test_report_emits_counts_and_rates() {
        let registry = Arc::new(Registry::new(ScoringPolicy::new(PolicyConfig::default())));
        registry
            .register(EndpointConfig::parse("http://10.0.0.1:8080").unwrap())
            .unwrap();
        let (events, mut rx) = EventDispatcher::new(32);
        let service = AnalyticsService::new(
            registry,
            Arc::new(PoolStats::new()),
            events,
            AnalyticsConfig::default(),
        );

        service.report(&StatsSnapshot {
            probes_total: 4,
            probes_succeeded: 3,
            selections: 120,
            exhausted: 2,
        });

        let mut metrics = Vec::new();
        while let Ok(Outbound::Metric(metric)) = rx.try_recv() {
            metrics.push(metric);
        }

        let find = |name: &str, tag: Option<&str>| {
            metrics
                .iter()
                .find(|m| {
                    m.name == name && tag.map_or(true, |t| m.tags.iter().any(|(_, v)| v == t))
                })
                .map(|m| m.value)
        };

        assert_eq!(find("pool.endpoints", Some("candidate")), Some(1.0));
        assert_eq!(find("pool.endpoints", Some("healthy")), Some(0.0));
        assert_eq!(find("pool.probe.success_rate", None), Some(0.75));
        assert_eq!(find("pool.selections.per_second", None), Some(2.0));
        assert_eq!(find("pool.selections.exhausted", None), Some(2.0));
    }
}
