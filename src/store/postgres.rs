use async_trait::async_trait;
use sqlx::{FromRow, PgPool};
use tracing::{info, warn};

use super::RecordStore;
use crate::error::{PoolError, Result};
use crate::models::{EndpointConfig, EndpointId, EndpointState, ProxyProtocol};

/// Row shape of the `endpoints` table used for loading
#[derive(Debug, Clone, FromRow)]
struct EndpointRow {
    id: String,
    protocol: String,
    host: String,
    port: i32,
    username: Option<String>,
    password: Option<String>,
}

impl EndpointRow {
    fn into_config(self) -> Result<EndpointConfig> {
        let protocol = ProxyProtocol::from_str(&self.protocol)
            .ok_or_else(|| PoolError::UnsupportedProtocol(self.protocol.clone()))?;
        let port = u16::try_from(self.port).map_err(|_| {
            PoolError::InvalidEndpointAddress(format!(
                "{}: port {} out of range",
                self.id, self.port
            ))
        })?;

        let config = EndpointConfig::new(protocol, self.host, port);
        Ok(match self.username.filter(|u| !u.is_empty()) {
            Some(username) => config.with_credentials(username, self.password.unwrap_or_default()),
            None => config,
        })
    }
}

/// Record store backed by PostgreSQL
#[derive(Clone)]
pub struct PgRecordStore {
    pool: PgPool,
}

impl PgRecordStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Insert an endpoint unless it already exists
    ///
    /// Returns whether a row was written.
    pub async fn insert_endpoint(&self, config: &EndpointConfig) -> Result<bool> {
        let (username, password) = match &config.credentials {
            Some(c) => (Some(c.username.as_str()), Some(c.password.as_str())),
            None => (None, None),
        };

        let result = sqlx::query(
            r#"
            INSERT INTO endpoints (id, protocol, host, port, username, password)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (id) DO NOTHING
            "#,
        )
        .bind(config.id().as_str())
        .bind(config.protocol.as_str())
        .bind(&config.host)
        .bind(config.port as i32)
        .bind(username)
        .bind(password)
        .execute(&self.pool)
        .await?;

        let inserted = result.rows_affected() > 0;
        if inserted {
            info!(endpoint_id = %config.id(), "Seeded endpoint");
        }
        Ok(inserted)
    }
}

#[async_trait]
impl RecordStore for PgRecordStore {
    async fn load_endpoints(&self) -> Result<Vec<EndpointConfig>> {
        let rows = sqlx::query_as::<_, EndpointRow>(
            r#"
            SELECT id, protocol, host, port, username, password
            FROM endpoints
            ORDER BY id
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let configs = rows
            .into_iter()
            .filter_map(|row| {
                let id = row.id.clone();
                match row.into_config() {
                    Ok(config) => Some(config),
                    Err(e) => {
                        warn!(endpoint_id = %id, error = %e, "Skipping invalid endpoint record");
                        None
                    }
                }
            })
            .collect();

        Ok(configs)
    }

    async fn save_endpoint_state(
        &self,
        id: &EndpointId,
        state: EndpointState,
        score: f64,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE endpoints
            SET state = $2, score = $3, updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(id.as_str())
        .bind(state.as_str())
        .bind(score)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Move the row into `removed_endpoints`
    async fn record_endpoint_removed(&self, id: &EndpointId) -> Result<()> {
        let moved: Option<String> = sqlx::query_scalar(
            r#"
            WITH moved AS (
                DELETE FROM endpoints
                WHERE id = $1
                RETURNING id, protocol, host, port, username, state, score, created_at
            )
            INSERT INTO removed_endpoints (
                id, protocol, host, port, username, last_state, last_score, created_at, removed_at
            )
            SELECT id, protocol, host, port, username, state, score, created_at, NOW()
            FROM moved
            ON CONFLICT (id) DO UPDATE SET removed_at = EXCLUDED.removed_at
            RETURNING id
            "#,
        )
        .bind(id.as_str())
        .fetch_optional(&self.pool)
        .await?;

        if moved.is_some() {
            info!(endpoint_id = %id, "Archived removed endpoint");
        }
        Ok(())
    }
}
