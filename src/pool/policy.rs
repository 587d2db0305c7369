//! Scoring and eviction policy
//!
//! Translates probe history into a bounded health score and decides the
//! state-machine transitions of an endpoint. Everything here is synchronous
//! and free of I/O; the registry calls it under its write lock.

use std::collections::VecDeque;
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::error::{PoolError, Result};
use crate::models::{
    Endpoint, EndpointId, EndpointState, ProbeResult, MAX_SCORE, MIN_SCORE, NEUTRAL_SCORE,
};

/// Policy parameters
#[derive(Debug, Clone)]
pub struct PolicyConfig {
    /// Consecutive successes needed to become Healthy (K)
    pub success_threshold: u32,
    /// Consecutive failures or slow probes that degrade a Healthy endpoint (M)
    pub failure_threshold: u32,
    /// Consecutive failures in Degraded that evict the endpoint (N)
    pub eviction_threshold: u32,
    /// Failure ratio over a full history window that evicts a Degraded endpoint
    pub failure_rate_threshold: f64,
    /// Number of probe results retained per endpoint
    pub history_window: usize,
    /// Latency above which a successful probe counts as slow
    pub degraded_latency: Duration,
    /// Weight of the newest outcome in the moving average
    pub ewma_alpha: f64,
    /// Latency that carries no score penalty
    pub latency_baseline: Duration,
    /// Points subtracted per baseline multiple above the baseline
    pub latency_penalty_per_baseline: f64,
    /// Cap on the latency penalty
    pub max_latency_penalty: f64,
    /// Time an endpoint stays Evicted before automatic reinstatement
    pub eviction_cooldown: Duration,
    /// Automatic reinstatements allowed before an endpoint is left Evicted
    pub max_auto_reinstatements: u32,
    /// Time an endpoint that exhausted its reinstatements is kept before removal
    pub evicted_retention: Duration,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            success_threshold: 2,
            failure_threshold: 3,
            eviction_threshold: 5,
            failure_rate_threshold: 0.8,
            history_window: 10,
            degraded_latency: Duration::from_secs(5),
            ewma_alpha: 0.3,
            latency_baseline: Duration::from_secs(1),
            latency_penalty_per_baseline: 10.0,
            max_latency_penalty: 40.0,
            eviction_cooldown: Duration::from_secs(60 * 60),
            max_auto_reinstatements: 3,
            evicted_retention: Duration::from_secs(24 * 60 * 60),
        }
    }
}

impl PolicyConfig {
    pub fn validate(&self) -> Result<()> {
        if self.success_threshold == 0
            || self.failure_threshold == 0
            || self.eviction_threshold == 0
        {
            return Err(PoolError::InvalidConfig(
                "policy thresholds must be at least 1".into(),
            ));
        }
        if !(self.ewma_alpha > 0.0 && self.ewma_alpha <= 1.0) {
            return Err(PoolError::InvalidConfig(
                "POLICY_EWMA_ALPHA must be in (0, 1]".into(),
            ));
        }
        if !(self.failure_rate_threshold > 0.0 && self.failure_rate_threshold <= 1.0) {
            return Err(PoolError::InvalidConfig(
                "POLICY_FAILURE_RATE_THRESHOLD must be in (0, 1]".into(),
            ));
        }
        if self.history_window == 0 {
            return Err(PoolError::InvalidConfig(
                "POLICY_HISTORY_WINDOW must be at least 1".into(),
            ));
        }
        if self.latency_baseline.is_zero() {
            return Err(PoolError::InvalidConfig(
                "POLICY_LATENCY_BASELINE_MS must be positive".into(),
            ));
        }
        Ok(())
    }
}

/// One retained probe outcome
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProbeSample {
    pub success: bool,
    pub latency: Option<Duration>,
}

/// Per-endpoint counters and history the policy works on
#[derive(Debug, Clone)]
pub struct HealthTrack {
    pub success_ewma: f64,
    pub consecutive_successes: u32,
    pub consecutive_failures: u32,
    pub consecutive_slow: u32,
    pub failures_since_degraded: u32,
    pub history: VecDeque<ProbeSample>,
}

impl Default for HealthTrack {
    fn default() -> Self {
        Self {
            success_ewma: NEUTRAL_SCORE / MAX_SCORE,
            consecutive_successes: 0,
            consecutive_failures: 0,
            consecutive_slow: 0,
            failures_since_degraded: 0,
            history: VecDeque::new(),
        }
    }
}

impl HealthTrack {
    /// Failure ratio over the retained history
    pub fn failure_rate(&self) -> f64 {
        if self.history.is_empty() {
            return 0.0;
        }
        let failures = self.history.iter().filter(|s| !s.success).count();
        failures as f64 / self.history.len() as f64
    }

    /// Mean latency of the successful probes in the history
    pub fn mean_latency(&self) -> Option<Duration> {
        let latencies: Vec<Duration> = self.history.iter().filter_map(|s| s.latency).collect();
        if latencies.is_empty() {
            return None;
        }
        Some(latencies.iter().sum::<Duration>() / latencies.len() as u32)
    }
}

/// Result of applying one probe to an endpoint
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Evaluation {
    pub score: f64,
    pub next_state: Option<EndpointState>,
}

/// Scoring and eviction policy
#[derive(Debug, Clone, Default)]
pub struct ScoringPolicy {
    config: PolicyConfig,
}

impl ScoringPolicy {
    pub fn new(config: PolicyConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &PolicyConfig {
        &self.config
    }

    /// Fold one probe result into `track` and decide the next state
    ///
    /// Results for Evicted endpoints leave the track untouched.
    pub fn evaluate(
        &self,
        state: EndpointState,
        track: &mut HealthTrack,
        result: &ProbeResult,
    ) -> Evaluation {
        if state == EndpointState::Evicted {
            return Evaluation {
                score: self.score(track),
                next_state: None,
            };
        }

        let cfg = &self.config;
        let slow = result.success
            && result
                .latency
                .map(|l| l > cfg.degraded_latency)
                .unwrap_or(false);

        track.history.push_back(ProbeSample {
            success: result.success,
            latency: if result.success { result.latency } else { None },
        });
        while track.history.len() > cfg.history_window {
            track.history.pop_front();
        }

        let outcome = if result.success { 1.0 } else { 0.0 };
        track.success_ewma = cfg.ewma_alpha * outcome + (1.0 - cfg.ewma_alpha) * track.success_ewma;

        if result.success {
            track.consecutive_failures = 0;
            track.consecutive_successes = track.consecutive_successes.saturating_add(1);
            if slow {
                track.consecutive_slow = track.consecutive_slow.saturating_add(1);
            } else {
                track.consecutive_slow = 0;
            }
        } else {
            track.consecutive_successes = 0;
            track.consecutive_slow = 0;
            track.consecutive_failures = track.consecutive_failures.saturating_add(1);
        }

        let next_state = match state {
            EndpointState::Candidate => (track.consecutive_successes >= cfg.success_threshold)
                .then_some(EndpointState::Healthy),
            EndpointState::Healthy => {
                let failing = track.consecutive_failures >= cfg.failure_threshold;
                let sluggish = track.consecutive_slow >= cfg.failure_threshold;
                (failing || sluggish).then_some(EndpointState::Degraded)
            }
            EndpointState::Degraded => {
                if result.success {
                    track.failures_since_degraded = 0;
                    // Recovery needs successes inside the latency budget.
                    if slow {
                        track.consecutive_successes = 0;
                    }
                    (track.consecutive_successes >= cfg.success_threshold)
                        .then_some(EndpointState::Healthy)
                } else {
                    track.failures_since_degraded = track.failures_since_degraded.saturating_add(1);
                    let window_full = track.history.len() >= cfg.history_window;
                    let rate_exceeded =
                        window_full && track.failure_rate() > cfg.failure_rate_threshold;
                    (track.failures_since_degraded >= cfg.eviction_threshold || rate_exceeded)
                        .then_some(EndpointState::Evicted)
                }
            }
            EndpointState::Evicted => None,
        };

        if let Some(next) = next_state {
            self.enter(next, track);
        }

        Evaluation {
            score: self.score(track),
            next_state,
        }
    }

    /// Reset the counters that are scoped to a state
    fn enter(&self, state: EndpointState, track: &mut HealthTrack) {
        match state {
            EndpointState::Healthy => {
                track.consecutive_failures = 0;
                track.consecutive_slow = 0;
            }
            EndpointState::Degraded => {
                track.consecutive_successes = 0;
                track.consecutive_slow = 0;
                track.failures_since_degraded = 0;
            }
            EndpointState::Evicted => {
                track.consecutive_successes = 0;
                track.consecutive_slow = 0;
            }
            EndpointState::Candidate => *track = HealthTrack::default(),
        }
    }

    /// Check a requested transition against the state machine
    pub fn transition(
        &self,
        id: &EndpointId,
        from: EndpointState,
        to: EndpointState,
    ) -> Result<EndpointState> {
        if from.can_transition_to(to) {
            Ok(to)
        } else {
            Err(PoolError::InvalidTransition {
                id: id.clone(),
                from,
                to,
            })
        }
    }

    /// Health score in `[MIN_SCORE, MAX_SCORE]`
    pub fn score(&self, track: &HealthTrack) -> f64 {
        let base = track.success_ewma * MAX_SCORE;
        let score = base - self.latency_penalty(track.mean_latency());
        if score.is_finite() {
            score.clamp(MIN_SCORE, MAX_SCORE)
        } else {
            MIN_SCORE
        }
    }

    fn latency_penalty(&self, latency: Option<Duration>) -> f64 {
        let cfg = &self.config;
        let Some(latency) = latency else {
            return 0.0;
        };
        if latency <= cfg.latency_baseline {
            return 0.0;
        }
        let excess = (latency - cfg.latency_baseline).as_secs_f64();
        let multiples = excess / cfg.latency_baseline.as_secs_f64();
        (multiples * cfg.latency_penalty_per_baseline).min(cfg.max_latency_penalty)
    }

    /// An Evicted endpoint whose cooldown elapsed and that still has
    /// automatic reinstatements left
    pub fn reinstatement_due(&self, endpoint: &Endpoint, now: DateTime<Utc>) -> bool {
        endpoint.state == EndpointState::Evicted
            && endpoint.reinstatements < self.config.max_auto_reinstatements
            && elapsed_since(endpoint.evicted_at, now)
                .map(|d| d >= self.config.eviction_cooldown)
                .unwrap_or(false)
    }

    /// An Evicted endpoint with no reinstatements left, kept past retention
    pub fn retention_expired(&self, endpoint: &Endpoint, now: DateTime<Utc>) -> bool {
        endpoint.state == EndpointState::Evicted
            && endpoint.reinstatements >= self.config.max_auto_reinstatements
            && elapsed_since(endpoint.evicted_at, now)
                .map(|d| d >= self.config.evicted_retention)
                .unwrap_or(false)
    }
}

fn elapsed_since(since: Option<DateTime<Utc>>, now: DateTime<Utc>) -> Option<Duration> {
    now.signed_duration_since(since?).to_std().ok()
}
