use crate::models::{Endpoint, EndpointId, EndpointState, EventKind, PoolEvent};
use crate::services::{EventDispatcher, StateWriter};

use super::registry::ProbeOutcome;

/// Fans registry changes out to the notification queue and the state writer
///
/// Every method returns immediately; delivery happens on the service tasks.
#[derive(Clone)]
pub struct LifecycleReporter {
    events: EventDispatcher,
    writer: StateWriter,
}

impl LifecycleReporter {
    pub fn new(events: EventDispatcher, writer: StateWriter) -> Self {
        Self { events, writer }
    }

    pub fn events(&self) -> &EventDispatcher {
        &self.events
    }

    pub fn registered(&self, id: &EndpointId) {
        self.events
            .emit_event(PoolEvent::new(EventKind::Registered, id.clone(), "registered"));
    }

    /// Report the effect of one probe; silent unless the state changed
    pub fn probe_applied(&self, outcome: &ProbeOutcome) {
        let Some((from, to)) = outcome.transition() else {
            return;
        };
        let endpoint = &outcome.endpoint;

        let event = match to {
            EndpointState::Evicted => PoolEvent::new(
                EventKind::Evicted,
                endpoint.id.clone(),
                format!(
                    "evicted from {} after {} consecutive failures (score {:.1})",
                    from, endpoint.consecutive_failures, endpoint.score
                ),
            ),
            _ => PoolEvent::new(
                EventKind::StateTransitioned,
                endpoint.id.clone(),
                format!("{} -> {} (score {:.1})", from, to, endpoint.score),
            ),
        };

        self.events.emit_event(event);
        self.writer
            .save_state(endpoint.id.clone(), endpoint.state, endpoint.score);
    }

    pub fn reinstated(&self, endpoint: &Endpoint, automatic: bool) {
        let detail = if automatic {
            format!("automatic reinstatement #{} after cooldown", endpoint.reinstatements)
        } else {
            "manual reinstatement".to_string()
        };

        self.events.emit_event(PoolEvent::new(
            EventKind::Reinstated,
            endpoint.id.clone(),
            detail,
        ));
        self.writer
            .save_state(endpoint.id.clone(), endpoint.state, endpoint.score);
    }

    /// Endpoint left the pool for good
    pub fn removed(&self, endpoint: &Endpoint, reason: &str) {
        self.events.emit_event(PoolEvent::new(
            EventKind::Removed,
            endpoint.id.clone(),
            reason,
        ));
        self.writer.removed(endpoint.id.clone());
    }

    /// Queue the final state of every endpoint, waiting for queue room
    pub async fn flush(&self, endpoints: &[Endpoint]) {
        for endpoint in endpoints {
            self.writer
                .save_state_waiting(endpoint.id.clone(), endpoint.state, endpoint.score)
                .await;
        }
    }
}
