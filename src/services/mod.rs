//! Background services

pub mod analytics;
pub mod dispatcher;
pub mod eviction_sweep;
pub mod persistence;

pub use analytics::{AnalyticsConfig, AnalyticsService};
pub use dispatcher::{DispatcherService, EventDispatcher, Outbound};
pub use eviction_sweep::{EvictionSweepConfig, EvictionSweepService};
pub use persistence::{StateWriter, StateWriterService, StoreCommand};

use tokio::sync::watch;

/// Handle for stopping a background service
pub struct ServiceHandle {
    shutdown_tx: watch::Sender<bool>,
}

impl ServiceHandle {
    pub fn new() -> (Self, watch::Receiver<bool>) {
        let (tx, rx) = watch::channel(false);
        (Self { shutdown_tx: tx }, rx)
    }

    /// A second receiver for another service stopped by the same handle
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.shutdown_tx.subscribe()
    }

    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }
}

impl Default for ServiceHandle {
    fn default() -> Self {
        Self::new().0
    }
}
