use chrono::{DateTime, Utc};
use serde::Serialize;

use super::{Endpoint, EndpointId, ProxyProtocol};

/// A selectable endpoint as seen by the selector
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SnapshotEntry {
    pub id: EndpointId,
    pub protocol: ProxyProtocol,
    pub score: f64,
}

impl From<&Endpoint> for SnapshotEntry {
    fn from(endpoint: &Endpoint) -> Self {
        Self {
            id: endpoint.id.clone(),
            protocol: endpoint.config.protocol,
            score: endpoint.score,
        }
    }
}

/// Immutable view of the Healthy endpoints at one point in time
///
/// Entries are ordered by endpoint id so that selection over the same
/// snapshot is deterministic.
#[derive(Debug, Clone, Default, Serialize)]
pub struct PoolSnapshot {
    pub version: u64,
    pub taken_at: Option<DateTime<Utc>>,
    entries: Vec<SnapshotEntry>,
}

impl PoolSnapshot {
    pub fn new(version: u64, taken_at: DateTime<Utc>, mut entries: Vec<SnapshotEntry>) -> Self {
        entries.sort_by(|a, b| a.id.cmp(&b.id));
        Self {
            version,
            taken_at: Some(taken_at),
            entries,
        }
    }

    pub fn entries(&self) -> &[SnapshotEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, id: &EndpointId) -> bool {
        self.entries.iter().any(|e| &e.id == id)
    }
}
