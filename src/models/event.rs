use chrono::{DateTime, Utc};
use serde::Serialize;

use super::EndpointId;

/// Kind of lifecycle event emitted by the pool
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Registered,
    StateTransitioned,
    Evicted,
    Reinstated,
    Removed,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Registered => "registered",
            EventKind::StateTransitioned => "state_transitioned",
            EventKind::Evicted => "evicted",
            EventKind::Reinstated => "reinstated",
            EventKind::Removed => "removed",
        }
    }
}

/// Lifecycle event delivered to the notification channel
#[derive(Debug, Clone, Serialize)]
pub struct PoolEvent {
    pub kind: EventKind,
    pub endpoint_id: EndpointId,
    pub timestamp: DateTime<Utc>,
    pub detail: String,
}

impl PoolEvent {
    pub fn new(kind: EventKind, endpoint_id: EndpointId, detail: impl Into<String>) -> Self {
        Self {
            kind,
            endpoint_id,
            timestamp: Utc::now(),
            detail: detail.into(),
        }
    }
}

/// One analytics data point
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Metric {
    pub name: &'static str,
    pub value: f64,
    pub tags: Vec<(&'static str, String)>,
}

impl Metric {
    pub fn new(name: &'static str, value: f64) -> Self {
        Self {
            name,
            value,
            tags: Vec::new(),
        }
    }

    pub fn tag(mut self, key: &'static str, value: impl Into<String>) -> Self {
        self.tags.push((key, value.into()));
        self
    }
}
