//! Round-robin endpoint selection strategy

use std::sync::atomic::{AtomicUsize, Ordering};

use super::{EndpointSelector, SelectionContext};
use crate::error::{PoolError, Result};
use crate::models::{EndpointId, PoolSnapshot, SnapshotEntry};

/// Selects endpoints in order, ignoring scores
///
/// Uses atomic operations for lock-free index tracking.
pub struct RoundRobinSelector {
    index: AtomicUsize,
}

impl RoundRobinSelector {
    pub fn new() -> Self {
        Self {
            index: AtomicUsize::new(0),
        }
    }
}

impl Default for RoundRobinSelector {
    fn default() -> Self {
        Self::new()
    }
}

impl EndpointSelector for RoundRobinSelector {
    fn select(&self, snapshot: &PoolSnapshot, ctx: &SelectionContext) -> Result<EndpointId> {
        let candidates: Vec<&SnapshotEntry> =
            snapshot.entries().iter().filter(|e| ctx.allows(e)).collect();

        if candidates.is_empty() {
            return Err(PoolError::PoolExhausted);
        }

        let idx = self.index.fetch_add(1, Ordering::Relaxed) % candidates.len();
        candidates
            .get(idx)
            .map(|e| e.id.clone())
            .ok_or(PoolError::PoolExhausted)
    }

    fn strategy_name(&self) -> &'static str {
        "round_robin"
    }
}
