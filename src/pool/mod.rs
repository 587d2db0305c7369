//! Proxy pool core
//!
//! This module provides the pool functionality including:
//! - The endpoint registry and its published snapshot
//! - Health probing with bounded concurrency
//! - The scoring and eviction policy
//! - Endpoint selection strategies
//! - The pool manager that ties them together

pub mod health;
pub mod lifecycle;
pub mod manager;
pub mod policy;
pub mod registry;
pub mod rotation;
pub mod stats;
pub mod transport;

pub use health::{HealthProber, ProbeConfig};
pub use lifecycle::LifecycleReporter;
pub use manager::{Collaborators, PoolConfig, PoolManager};
pub use policy::{PolicyConfig, ScoringPolicy};
pub use registry::{ProbeOutcome, Registry, StateCounts, SweepReport};
pub use rotation::{create_selector, EndpointSelector, RotationStrategy, SelectionContext};
pub use stats::{PoolStats, StatsSnapshot};
pub use transport::{ConnectProbe, Probe, ProbeStatus};
