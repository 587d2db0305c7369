//! Endpoint rotation strategies
//!
//! Selectors pick one endpoint from a [`PoolSnapshot`]. They never perform
//! I/O; the only state they keep is their private rotation cursor.

mod round_robin;
mod weighted;

pub use round_robin::RoundRobinSelector;
pub use weighted::WeightedRoundRobinSelector;

use crate::error::Result;
use crate::models::{EndpointId, PoolSnapshot, ProxyProtocol, SnapshotEntry};

/// Strategy types for endpoint rotation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RotationStrategy {
    #[default]
    WeightedRoundRobin,
    RoundRobin,
}

impl RotationStrategy {
    pub fn from_str(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "round_robin" | "roundrobin" | "round-robin" => Self::RoundRobin,
            _ => Self::WeightedRoundRobin,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::WeightedRoundRobin => "weighted_round_robin",
            Self::RoundRobin => "round_robin",
        }
    }
}

/// Caller-supplied constraints for one selection
#[derive(Debug, Clone, Default)]
pub struct SelectionContext {
    /// Only consider endpoints speaking this protocol
    pub protocol: Option<ProxyProtocol>,
    /// Endpoints the caller already tried for this request
    pub exclude: Vec<EndpointId>,
}

impl SelectionContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_protocol(mut self, protocol: ProxyProtocol) -> Self {
        self.protocol = Some(protocol);
        self
    }

    pub fn excluding(mut self, id: EndpointId) -> Self {
        self.exclude.push(id);
        self
    }

    pub fn allows(&self, entry: &SnapshotEntry) -> bool {
        if let Some(protocol) = self.protocol {
            if entry.protocol != protocol {
                return false;
            }
        }
        !self.exclude.contains(&entry.id)
    }
}

/// Trait for endpoint selection strategies
pub trait EndpointSelector: Send + Sync {
    /// Pick an endpoint from the snapshot
    ///
    /// Returns `PoolExhausted` when no entry satisfies the context.
    fn select(&self, snapshot: &PoolSnapshot, ctx: &SelectionContext) -> Result<EndpointId>;

    /// Get the strategy name
    fn strategy_name(&self) -> &'static str;
}

/// Create an endpoint selector based on the strategy type
pub fn create_selector(strategy: RotationStrategy) -> Box<dyn EndpointSelector> {
    match strategy {
        RotationStrategy::WeightedRoundRobin => Box::new(WeightedRoundRobinSelector::new()),
        RotationStrategy::RoundRobin => Box::new(RoundRobinSelector::new()),
    }
}

#[cfg(test)]
pub(crate) fn test_snapshot(entries: &[(&str, f64)]) -> PoolSnapshot {
    let entries = entries
        .iter()
        .map(|(id, score)| SnapshotEntry {
            id: EndpointId::from(*id),
            protocol: ProxyProtocol::Http,
            score: *score,
        })
        .collect();
    PoolSnapshot::new(1, chrono::Utc::now(), entries)
}
