//! Eviction sweep service
//!
//! Periodically reinstates Evicted endpoints whose cooldown has elapsed and
//! removes those that stayed Evicted past the retention window after using up
//! their automatic reinstatements.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;
use tokio::time::interval;
use tracing::{info, instrument};

use crate::pool::{HealthProber, LifecycleReporter, Registry};

/// Eviction sweep service configuration
#[derive(Clone)]
pub struct EvictionSweepConfig {
    /// How often to scan Evicted endpoints
    pub check_interval: Duration,
}

impl Default for EvictionSweepConfig {
    fn default() -> Self {
        Self {
            check_interval: Duration::from_secs(60),
        }
    }
}

/// Eviction sweep service
pub struct EvictionSweepService {
    registry: Arc<Registry>,
    prober: Arc<HealthProber>,
    reporter: LifecycleReporter,
    config: EvictionSweepConfig,
}

impl EvictionSweepService {
    pub fn new(
        registry: Arc<Registry>,
        prober: Arc<HealthProber>,
        reporter: LifecycleReporter,
        config: EvictionSweepConfig,
    ) -> Self {
        Self {
            registry,
            prober,
            reporter,
            config,
        }
    }

    /// Run the eviction sweep service
    #[instrument(skip(self, shutdown))]
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            "Starting eviction sweep service (interval: {}s)",
            self.config.check_interval.as_secs()
        );

        let mut ticker = interval(self.config.check_interval);
        ticker.tick().await; // Skip immediate tick

        loop {
            tokio::select! {
                _ = ticker.tick() => self.sweep(),
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("Eviction sweep service shutting down");
                        break;
                    }
                }
            }
        }
    }

    /// One pass over the Evicted endpoints
    pub fn sweep(&self) {
        let report = self.registry.sweep_evicted(Utc::now());
        if report.is_empty() {
            return;
        }

        for endpoint in &report.removed {
            self.prober.cancel(&endpoint.id);
            self.reporter
                .removed(endpoint, "evicted past retention with no reinstatements left");
        }
        for endpoint in &report.reinstated {
            self.reporter.reinstated(endpoint, true);
        }

        info!(
            reinstated = report.reinstated.len(),
            removed = report.removed.len(),
            "Eviction sweep complete"
        );
    }
}
