use std::sync::atomic::{AtomicU64, Ordering};

/// Running counters shared by the prober, the selector path and the
/// analytics reporter
#[derive(Debug, Default)]
pub struct PoolStats {
    probes_total: AtomicU64,
    probes_succeeded: AtomicU64,
    selections: AtomicU64,
    exhausted: AtomicU64,
}

/// Point-in-time copy of [`PoolStats`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub probes_total: u64,
    pub probes_succeeded: u64,
    pub selections: u64,
    pub exhausted: u64,
}

impl StatsSnapshot {
    /// Counter growth since an earlier snapshot
    pub fn since(&self, earlier: &StatsSnapshot) -> StatsSnapshot {
        StatsSnapshot {
            probes_total: self.probes_total.saturating_sub(earlier.probes_total),
            probes_succeeded: self.probes_succeeded.saturating_sub(earlier.probes_succeeded),
            selections: self.selections.saturating_sub(earlier.selections),
            exhausted: self.exhausted.saturating_sub(earlier.exhausted),
        }
    }

    /// Fraction of successful probes, `None` when nothing was probed
    pub fn probe_success_rate(&self) -> Option<f64> {
        (self.probes_total > 0).then(|| self.probes_succeeded as f64 / self.probes_total as f64)
    }
}

impl PoolStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_probe(&self, success: bool) {
        self.probes_total.fetch_add(1, Ordering::Relaxed);
        if success {
            self.probes_succeeded.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_selection(&self, served: bool) {
        if served {
            self.selections.fetch_add(1, Ordering::Relaxed);
        } else {
            self.exhausted.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            probes_total: self.probes_total.load(Ordering::Relaxed),
            probes_succeeded: self.probes_succeeded.load(Ordering::Relaxed),
            selections: self.selections.load(Ordering::Relaxed),
            exhausted: self.exhausted.load(Ordering::Relaxed),
        }
    }
}
