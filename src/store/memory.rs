use std::collections::BTreeMap;

use async_trait::async_trait;
use parking_lot::RwLock;
use tracing::{debug, warn};

use super::RecordStore;
use crate::error::Result;
use crate::models::{EndpointConfig, EndpointId, EndpointState};

#[derive(Debug, Clone)]
struct StoredEndpoint {
    config: EndpointConfig,
    state: EndpointState,
    score: f64,
}

/// In-process record store
///
/// Used when no database is configured. Contents live only as long as the
/// process.
#[derive(Debug, Default)]
pub struct MemoryRecordStore {
    endpoints: RwLock<BTreeMap<EndpointId, StoredEndpoint>>,
    removed: RwLock<Vec<EndpointId>>,
}

impl MemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_endpoints(configs: impl IntoIterator<Item = EndpointConfig>) -> Self {
        let store = Self::new();
        {
            let mut endpoints = store.endpoints.write();
            for config in configs {
                endpoints.insert(
                    config.id(),
                    StoredEndpoint {
                        config,
                        state: EndpointState::Candidate,
                        score: crate::models::NEUTRAL_SCORE,
                    },
                );
            }
        }
        store
    }

    /// Seed from endpoint URLs, skipping the ones that do not parse
    pub fn from_seed(raw: &[String]) -> Self {
        let configs = raw.iter().filter_map(|entry| match EndpointConfig::parse(entry) {
            Ok(config) => Some(config),
            Err(e) => {
                warn!(entry = %entry, error = %e, "Skipping invalid seed endpoint");
                None
            }
        });
        Self::with_endpoints(configs.collect::<Vec<_>>())
    }

    /// Last persisted state and score of an endpoint
    pub fn state_of(&self, id: &EndpointId) -> Option<(EndpointState, f64)> {
        self.endpoints.read().get(id).map(|e| (e.state, e.score))
    }

    pub fn removed(&self) -> Vec<EndpointId> {
        self.removed.read().clone()
    }
}

#[async_trait]
impl RecordStore for MemoryRecordStore {
    async fn load_endpoints(&self) -> Result<Vec<EndpointConfig>> {
        Ok(self
            .endpoints
            .read()
            .values()
            .map(|e| e.config.clone())
            .collect())
    }

    async fn save_endpoint_state(
        &self,
        id: &EndpointId,
        state: EndpointState,
        score: f64,
    ) -> Result<()> {
        match self.endpoints.write().get_mut(id) {
            Some(stored) => {
                stored.state = state;
                stored.score = score;
            }
            None => debug!(endpoint_id = %id, "State saved for unknown endpoint, ignoring"),
        }
        Ok(())
    }

    async fn record_endpoint_removed(&self, id: &EndpointId) -> Result<()> {
        self.endpoints.write().remove(id);
        self.removed.write().push(id.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_seed_skips_invalid_entries() {
        let store = MemoryRecordStore::from_seed(&[
            "http://10.0.0.1:8080".to_string(),
            "gopher://10.0.0.2:70".to_string(),
            "socks5://user:pw@10.0.0.3:1080".to_string(),
        ]);

        let loaded = store.load_endpoints().await.unwrap();
        assert_eq!(loaded.len(), 2);
    }

    #[tokio::test]
    async fn test_state_round_trip_and_removal() {
        let config = EndpointConfig::parse("http://10.0.0.1:8080").unwrap();
        let id = config.id();
        let store = MemoryRecordStore::with_endpoints(vec![config]);

        store
            .save_endpoint_state(&id, EndpointState::Healthy, 82.5)
            .await
            .unwrap();
        assert_eq!(store.state_of(&id), Some((EndpointState::Healthy, 82.5)));

        store.record_endpoint_removed(&id).await.unwrap();
        assert!(store.state_of(&id).is_none());
        assert_eq!(store.removed(), vec![id]);
        assert!(store.load_endpoints().await.unwrap().is_empty());
    }
}
