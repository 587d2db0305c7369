//! Record store collaborator
//!
//! The pool reads endpoint configuration once at startup and writes state
//! changes back through the state writer. Every failure is reported as
//! `StorageUnavailable` by the caller and retried with backoff.

pub mod memory;
pub mod postgres;
pub mod retry;

pub use memory::MemoryRecordStore;
pub use postgres::PgRecordStore;
pub use retry::{calculate_backoff, RetryPolicy};

use async_trait::async_trait;

use crate::error::Result;
use crate::models::{EndpointConfig, EndpointId, EndpointState};

/// Persistence contract the pool depends on
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// All configured endpoints
    async fn load_endpoints(&self) -> Result<Vec<EndpointConfig>>;

    /// Persist the latest state and score of an endpoint
    async fn save_endpoint_state(
        &self,
        id: &EndpointId,
        state: EndpointState,
        score: f64,
    ) -> Result<()>;

    /// Mark an endpoint as permanently removed from the pool
    async fn record_endpoint_removed(&self, id: &EndpointId) -> Result<()>;
}
