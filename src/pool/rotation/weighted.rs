//! Smooth weighted round-robin selection
//!
//! Each call adds every candidate's weight to its running total, picks the
//! largest total and subtracts the sum of weights from the winner. Over time
//! every endpoint is chosen in proportion to its score, interleaved rather
//! than in bursts.

use std::collections::{HashMap, HashSet};

use parking_lot::Mutex;

use super::{EndpointSelector, SelectionContext};
use crate::error::{PoolError, Result};
use crate::models::{EndpointId, PoolSnapshot, SnapshotEntry};

/// Running totals keyed by endpoint, plus the snapshot they were pruned for
#[derive(Debug, Default)]
struct RotationCursor {
    snapshot_version: u64,
    current: HashMap<EndpointId, i64>,
}

/// Weighted round-robin over Healthy endpoints, weight = score
pub struct WeightedRoundRobinSelector {
    cursor: Mutex<RotationCursor>,
}

impl WeightedRoundRobinSelector {
    pub fn new() -> Self {
        Self {
            cursor: Mutex::new(RotationCursor::default()),
        }
    }

    /// Integer weight of an entry; every Healthy endpoint keeps at least 1
    fn weight(entry: &SnapshotEntry) -> i64 {
        (entry.score.round() as i64).max(1)
    }
}

impl Default for WeightedRoundRobinSelector {
    fn default() -> Self {
        Self::new()
    }
}

impl EndpointSelector for WeightedRoundRobinSelector {
    fn select(&self, snapshot: &PoolSnapshot, ctx: &SelectionContext) -> Result<EndpointId> {
        let candidates: Vec<&SnapshotEntry> =
            snapshot.entries().iter().filter(|e| ctx.allows(e)).collect();

        if candidates.is_empty() {
            return Err(PoolError::PoolExhausted);
        }

        let mut cursor = self.cursor.lock();

        if cursor.snapshot_version != snapshot.version {
            let live: HashSet<&EndpointId> = snapshot.entries().iter().map(|e| &e.id).collect();
            cursor.current.retain(|id, _| live.contains(id));
            cursor.snapshot_version = snapshot.version;
        }

        let total: i64 = candidates.iter().map(|e| Self::weight(e)).sum();
        let mut best: Option<(&SnapshotEntry, i64)> = None;

        for entry in candidates.iter().copied() {
            let current = cursor.current.entry(entry.id.clone()).or_insert(0);
            *current += Self::weight(entry);
            if best.map_or(true, |(_, b)| *current > b) {
                best = Some((entry, *current));
            }
        }

        let (chosen, _) = best.ok_or(PoolError::PoolExhausted)?;
        if let Some(current) = cursor.current.get_mut(&chosen.id) {
            *current -= total;
        }

        Ok(chosen.id.clone())
    }

    fn strategy_name(&self) -> &'static str {
        "weighted_round_robin"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::rotation::test_snapshot;

    fn tally(
        selector: &WeightedRoundRobinSelector,
        snapshot: &PoolSnapshot,
        n: usize,
    ) -> HashMap<String, usize> {
        let ctx = SelectionContext::new();
        let mut counts = HashMap::new();
        for _ in 0..n {
            let id = selector.select(snapshot, &ctx).unwrap();
            *counts.entry(id.to_string()).or_insert(0) += 1;
        }
        counts
    }

    #[test]
    fn test_weighted_empty() {
        let selector = WeightedRoundRobinSelector::new();
        let result = selector.select(&PoolSnapshot::default(), &SelectionContext::new());
        assert!(matches!(result, Err(PoolError::PoolExhausted)));
    }

    #[test]
    fn test_equal_scores_alternate() {
        let selector = WeightedRoundRobinSelector::new();
        let snapshot = test_snapshot(&[("http://a:1", 70.0), ("http://b:1", 70.0)]);
        let ctx = SelectionContext::new();

        let picks: Vec<String> = (0..4)
            .map(|_| selector.select(&snapshot, &ctx).unwrap().to_string())
            .collect();
        assert_eq!(picks, vec!["http://a:1", "http://b:1", "http://a:1", "http://b:1"]);

        let counts = tally(&selector, &snapshot, 1000);
        let a = counts["http://a:1"] as i64;
        let b = counts["http://b:1"] as i64;
        assert!((a - b).abs() <= 1, "a={} b={}", a, b);
    }

    #[test]
    fn test_distribution_follows_score() {
        let selector = WeightedRoundRobinSelector::new();
        let snapshot = test_snapshot(&[("http://a:1", 75.0), ("http://b:1", 25.0)]);
        let counts = tally(&selector, &snapshot, 1000);
        assert_eq!(counts["http://a:1"], 750);
        assert_eq!(counts["http://b:1"], 250);
    }

    #[test]
    fn test_low_score_not_starved() {
        let selector = WeightedRoundRobinSelector::new();
        let snapshot = test_snapshot(&[("http://a:1", 100.0), ("http://b:1", 0.0)]);
        let counts = tally(&selector, &snapshot, 202);
        assert_eq!(counts["http://b:1"], 2);
    }

    #[test]
    fn test_deterministic_for_fixed_snapshot() {
        let snapshot = test_snapshot(&[
            ("http://a:1", 60.0),
            ("http://b:1", 30.0),
            ("http://c:1", 10.0),
        ]);
        let ctx = SelectionContext::new();
        let first = WeightedRoundRobinSelector::new();
        let second = WeightedRoundRobinSelector::new();
        for _ in 0..50 {
            assert_eq!(
                first.select(&snapshot, &ctx).unwrap(),
                second.select(&snapshot, &ctx).unwrap()
            );
        }
    }

    #[test]
    fn test_cursor_pruned_on_new_snapshot() {
        let selector = WeightedRoundRobinSelector::new();
        let ctx = SelectionContext::new();
        let before = test_snapshot(&[("http://a:1", 50.0), ("http://b:1", 50.0)]);
        selector.select(&before, &ctx).unwrap();

        let after = PoolSnapshot::new(
            2,
            chrono::Utc::now(),
            before.entries()[1..].to_vec(),
        );
        assert_eq!(selector.select(&after, &ctx).unwrap().as_str(), "http://b:1");
        assert!(!selector.cursor.lock().current.contains_key(&EndpointId::from("http://a:1")));
    }

    #[test]
    fn test_protocol_filter_exhausts() {
        let selector = WeightedRoundRobinSelector::new();
        let snapshot = test_snapshot(&[("http://a:1", 50.0)]);
        let ctx = SelectionContext::new().with_protocol(crate::models::ProxyProtocol::Socks5);
        assert!(matches!(
            selector.select(&snapshot, &ctx),
            Err(PoolError::PoolExhausted)
        ));
    }
}
