//! Rota Pool - Upstream Proxy Pool
//!
//! Keeps a set of upstream proxy endpoints probed, scored and rotated.
//!
//! ## Features
//!
//! - HTTP, HTTPS, SOCKS4, SOCKS4a, and SOCKS5 endpoint support
//! - Background health probing with bounded concurrency and jitter
//! - Scoring with automatic degradation, eviction and reinstatement
//! - Weighted round-robin and round-robin selection over a lock-free snapshot
//! - PostgreSQL or in-memory record store with retrying writes
//! - Lifecycle events and pool metrics through pluggable sinks

pub mod config;
pub mod database;
pub mod error;
pub mod models;
pub mod notify;
pub mod pool;
pub mod services;
pub mod store;

#[cfg(test)]
pub(crate) mod testing;

pub use config::Config;
pub use database::Database;
pub use error::{PoolError, Result};
pub use pool::{Collaborators, PoolConfig, PoolManager, SelectionContext};
