//! Endpoint registry
//!
//! The authoritative in-memory set of endpoints. Writers are serialized
//! through one lock; selectable endpoints are republished as an immutable
//! [`PoolSnapshot`] that readers load without locking.

use std::collections::HashMap;
use std::sync::Arc;

use arc_swap::ArcSwap;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use tracing::{debug, error, info};

use super::policy::{HealthTrack, ScoringPolicy};
use crate::error::{PoolError, Result};
use crate::models::{
    Endpoint, EndpointConfig, EndpointId, EndpointState, PoolSnapshot, ProbeResult,
    SnapshotEntry, NEUTRAL_SCORE,
};

/// Result of applying one probe result
#[derive(Debug, Clone)]
pub struct ProbeOutcome {
    pub endpoint: Endpoint,
    pub previous_state: EndpointState,
}

impl ProbeOutcome {
    /// The `(from, to)` pair when the probe moved the endpoint
    pub fn transition(&self) -> Option<(EndpointState, EndpointState)> {
        (self.previous_state != self.endpoint.state)
            .then_some((self.previous_state, self.endpoint.state))
    }
}

/// Endpoints touched by an eviction sweep
#[derive(Debug, Clone, Default)]
pub struct SweepReport {
    pub reinstated: Vec<Endpoint>,
    pub removed: Vec<Endpoint>,
}

impl SweepReport {
    pub fn is_empty(&self) -> bool {
        self.reinstated.is_empty() && self.removed.is_empty()
    }
}

/// Number of endpoints per state
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StateCounts {
    pub candidate: usize,
    pub healthy: usize,
    pub degraded: usize,
    pub evicted: usize,
}

impl StateCounts {
    pub fn total(&self) -> usize {
        self.candidate + self.healthy + self.degraded + self.evicted
    }
}

struct Slot {
    endpoint: Endpoint,
    track: HealthTrack,
}

#[derive(Default)]
struct RegistryInner {
    endpoints: HashMap<EndpointId, Slot>,
    next_generation: u64,
    snapshot_version: u64,
}

/// Authoritative set of endpoints and their health state
pub struct Registry {
    policy: ScoringPolicy,
    inner: RwLock<RegistryInner>,
    snapshot: ArcSwap<PoolSnapshot>,
}

impl Registry {
    pub fn new(policy: ScoringPolicy) -> Self {
        Self {
            policy,
            inner: RwLock::new(RegistryInner::default()),
            snapshot: ArcSwap::from_pointee(PoolSnapshot::default()),
        }
    }

    pub fn policy(&self) -> &ScoringPolicy {
        &self.policy
    }

    /// Insert a new endpoint in Candidate state
    pub fn register(&self, config: EndpointConfig) -> Result<EndpointId> {
        let id = config.id();
        let mut inner = self.inner.write();

        if inner.endpoints.contains_key(&id) {
            return Err(PoolError::DuplicateEndpoint { id });
        }

        inner.next_generation += 1;
        let endpoint = Endpoint::new(config, inner.next_generation, Utc::now());
        inner.endpoints.insert(
            id.clone(),
            Slot {
                endpoint,
                track: HealthTrack::default(),
            },
        );

        info!(endpoint_id = %id, "Registered endpoint");
        Ok(id)
    }

    /// Remove an endpoint; `NotFound` when it is already gone
    pub fn deregister(&self, id: &EndpointId) -> Result<Endpoint> {
        let mut inner = self.inner.write();
        let slot = inner
            .endpoints
            .remove(id)
            .ok_or_else(|| PoolError::NotFound { id: id.clone() })?;

        if slot.endpoint.state.is_selectable() {
            self.publish(&mut inner);
        }

        info!(endpoint_id = %id, state = %slot.endpoint.state, "Deregistered endpoint");
        Ok(slot.endpoint)
    }

    /// Fold a probe result into the endpoint's history, score and state
    pub fn record_probe(&self, id: &EndpointId, result: ProbeResult) -> Result<ProbeOutcome> {
        let mut inner = self.inner.write();

        let slot = inner
            .endpoints
            .get_mut(id)
            .ok_or_else(|| PoolError::NotFound { id: id.clone() })?;

        if let Some(generation) = result.generation {
            if generation != slot.endpoint.generation {
                debug!(endpoint_id = %id, "Discarding probe result from a previous registration");
                return Err(PoolError::NotFound { id: id.clone() });
            }
        }

        let previous_state = slot.endpoint.state;
        if previous_state == EndpointState::Evicted {
            debug!(endpoint_id = %id, "Ignoring probe result for evicted endpoint");
            return Ok(ProbeOutcome {
                endpoint: slot.endpoint.clone(),
                previous_state,
            });
        }

        let evaluation = self.policy.evaluate(previous_state, &mut slot.track, &result);

        let endpoint = &mut slot.endpoint;
        endpoint.score = evaluation.score;
        endpoint.consecutive_successes = slot.track.consecutive_successes;
        endpoint.consecutive_failures = slot.track.consecutive_failures;
        endpoint.last_probe_at = Some(result.timestamp);
        endpoint.last_error = result.error;
        endpoint.probes_total += 1;
        if result.success {
            endpoint.last_latency = result.latency;
        } else {
            endpoint.probes_failed += 1;
        }

        let mut transition_error = None;
        if let Some(next) = evaluation.next_state {
            match self.policy.transition(id, previous_state, next) {
                Ok(state) => {
                    endpoint.state = state;
                    if state == EndpointState::Evicted {
                        endpoint.evicted_at = Some(result.timestamp);
                    }
                    info!(
                        endpoint_id = %id,
                        from = %previous_state,
                        to = %state,
                        score = endpoint.score,
                        "Endpoint state changed"
                    );
                }
                Err(e) => {
                    error!(endpoint_id = %id, error = %e, "Policy produced an illegal transition");
                    transition_error = Some(e);
                }
            }
        }

        let outcome = ProbeOutcome {
            endpoint: endpoint.clone(),
            previous_state,
        };

        if previous_state.is_selectable() || outcome.endpoint.state.is_selectable() {
            self.publish(&mut inner);
        }

        match transition_error {
            Some(e) => Err(e),
            None => Ok(outcome),
        }
    }

    /// Manually move an Evicted endpoint back to Candidate
    pub fn reinstate(&self, id: &EndpointId, now: DateTime<Utc>) -> Result<Endpoint> {
        let mut inner = self.inner.write();
        let slot = inner
            .endpoints
            .get_mut(id)
            .ok_or_else(|| PoolError::NotFound { id: id.clone() })?;

        self.reset_to_candidate(slot, now)?;
        slot.endpoint.reinstatements = 0;

        info!(endpoint_id = %id, "Endpoint reinstated manually");
        Ok(slot.endpoint.clone())
    }

    /// Reinstate Evicted endpoints whose cooldown elapsed and drop those
    /// kept past retention
    pub fn sweep_evicted(&self, now: DateTime<Utc>) -> SweepReport {
        let mut inner = self.inner.write();
        let mut report = SweepReport::default();

        let expired: Vec<EndpointId> = inner
            .endpoints
            .values()
            .filter(|slot| self.policy.retention_expired(&slot.endpoint, now))
            .map(|slot| slot.endpoint.id.clone())
            .collect();

        for id in expired {
            if let Some(slot) = inner.endpoints.remove(&id) {
                info!(endpoint_id = %id, "Removed endpoint after eviction retention");
                report.removed.push(slot.endpoint);
            }
        }

        for slot in inner.endpoints.values_mut() {
            if !self.policy.reinstatement_due(&slot.endpoint, now) {
                continue;
            }
            match self.reset_to_candidate(slot, now) {
                Ok(()) => {
                    slot.endpoint.reinstatements += 1;
                    info!(
                        endpoint_id = %slot.endpoint.id,
                        reinstatements = slot.endpoint.reinstatements,
                        "Endpoint reinstated after cooldown"
                    );
                    report.reinstated.push(slot.endpoint.clone());
                }
                Err(e) => error!(error = %e, "Automatic reinstatement failed"),
            }
        }

        report
    }

    fn reset_to_candidate(&self, slot: &mut Slot, now: DateTime<Utc>) -> Result<()> {
        let endpoint = &mut slot.endpoint;
        endpoint.state = self
            .policy
            .transition(&endpoint.id, endpoint.state, EndpointState::Candidate)?;
        endpoint.score = NEUTRAL_SCORE;
        endpoint.consecutive_failures = 0;
        endpoint.consecutive_successes = 0;
        endpoint.evicted_at = None;
        endpoint.last_error = None;
        endpoint.last_probe_at = Some(now);
        slot.track = HealthTrack::default();
        Ok(())
    }

    /// Latest published snapshot of Healthy endpoints
    pub fn snapshot(&self) -> Arc<PoolSnapshot> {
        self.snapshot.load_full()
    }

    /// Copies of every endpoint
    pub fn list_all(&self) -> Vec<Endpoint> {
        self.inner
            .read()
            .endpoints
            .values()
            .map(|slot| slot.endpoint.clone())
            .collect()
    }

    pub fn get(&self, id: &EndpointId) -> Option<Endpoint> {
        self.inner.read().endpoints.get(id).map(|slot| slot.endpoint.clone())
    }

    /// Config and registration generation of an endpoint due for probing
    ///
    /// `Ok(None)` while the endpoint is Evicted.
    pub fn probe_target(&self, id: &EndpointId) -> Result<Option<(EndpointConfig, u64)>> {
        let inner = self.inner.read();
        let slot = inner
            .endpoints
            .get(id)
            .ok_or_else(|| PoolError::NotFound { id: id.clone() })?;

        if slot.endpoint.state == EndpointState::Evicted {
            return Ok(None);
        }
        Ok(Some((slot.endpoint.config.clone(), slot.endpoint.generation)))
    }

    pub fn counts(&self) -> StateCounts {
        let inner = self.inner.read();
        let mut counts = StateCounts::default();
        for slot in inner.endpoints.values() {
            match slot.endpoint.state {
                EndpointState::Candidate => counts.candidate += 1,
                EndpointState::Healthy => counts.healthy += 1,
                EndpointState::Degraded => counts.degraded += 1,
                EndpointState::Evicted => counts.evicted += 1,
            }
        }
        counts
    }

    pub fn len(&self) -> usize {
        self.inner.read().endpoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Rebuild and swap in the snapshot; caller holds the write lock
    fn publish(&self, inner: &mut RegistryInner) {
        inner.snapshot_version += 1;
        let entries = inner
            .endpoints
            .values()
            .filter(|slot| slot.endpoint.state.is_selectable())
            .map(|slot| SnapshotEntry::from(&slot.endpoint))
            .collect();
        self.snapshot.store(Arc::new(PoolSnapshot::new(
            inner.snapshot_version,
            Utc::now(),
            entries,
        )));
    }
}
