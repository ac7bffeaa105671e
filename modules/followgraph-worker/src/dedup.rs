use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use tracing::info;

use followgraph_common::EntityId;

use crate::error::DedupError;

/// Durable set of already-expanded entity ids, shared by every worker.
#[async_trait]
pub trait DedupStore: Send + Sync {
    /// Insert `id`. Returns true if it was not yet present. The insert is the
    /// only cross-process gate: exactly one worker wins it.
    async fn add(&self, id: EntityId) -> Result<bool, DedupError>;

    /// Remove `id` after a failed expansion so a later delivery can retry.
    async fn remove(&self, id: EntityId) -> Result<(), DedupError>;
}

/// Redis set backend (`SADD` / `SREM`).
pub struct RedisDedupStore {
    conn: ConnectionManager,
    key: String,
}

impl RedisDedupStore {
    pub async fn connect(url: &str, key: &str) -> Result<Self, DedupError> {
        let client = redis::Client::open(url)?;
        let conn = ConnectionManager::new(client).await?;
        info!(key, "Connected to Redis");
        Ok(Self {
            conn,
            key: key.to_string(),
        })
    }
}

#[async_trait]
impl DedupStore for RedisDedupStore {
    async fn add(&self, id: EntityId) -> Result<bool, DedupError> {
        let mut conn = self.conn.clone();
        let added: i64 = conn.sadd(&self.key, id.get()).await?;
        Ok(added == 1)
    }

    async fn remove(&self, id: EntityId) -> Result<(), DedupError> {
        let mut conn = self.conn.clone();
        let _: i64 = conn.srem(&self.key, id.get()).await?;
        Ok(())
    }
}
