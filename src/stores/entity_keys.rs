use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use redis::AsyncCommands;
use redis::aio::ConnectionManager;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tokio::time::timeout;
use uuid::Uuid;

/// How long a published index entry lives.
pub const ENTITY_KEY_TTL: Duration = Duration::from_secs(7 * 24 * 60 * 60);

/// Hard deadline on cache reads; past it the caller falls back to a ledger
/// attribute query.
const GET_DEADLINE: Duration = Duration::from_secs(5);

const KEY_PREFIX: &str = "entitykeys:";

/// The ledger keys backing one stored file.
///
/// `chunk_keys` is ordered by chunk index and matches the metadata's chunk
/// count once the owning session has completed.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EntityKeyIndex {
    pub metadata_key: Option<String>,
    pub chunk_keys: Vec<String>,
}

/// Caches file-id → entity-key mappings so reassembly can skip the owner
/// scan.
///
/// The cache is a write-through observation of successful ledger writes,
/// never the source of truth: a miss, a failure or a slow read all degrade
/// to the attribute-query path.
#[derive(Clone)]
pub struct EntityKeyCache {
    redis: Option<ConnectionManager>,
    memory: Arc<RwLock<HashMap<String, (EntityKeyIndex, DateTime<Utc>)>>>,
}

impl EntityKeyCache {
    pub fn new(redis: Option<ConnectionManager>) -> Self {
        Self {
            redis,
            memory: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    fn cache_key(file_id: Uuid) -> String {
        format!("{}{}", KEY_PREFIX, file_id)
    }

    /// Publishes the index for a completed upload. Best-effort.
    pub async fn put(&self, file_id: Uuid, index: &EntityKeyIndex, ttl: Duration) {
        if let Some(redis) = &self.redis {
            match sonic_rs::to_string(index) {
                Ok(record) => {
                    let mut conn = redis.clone();
                    if let Err(e) = conn
                        .set_ex::<_, _, ()>(Self::cache_key(file_id), record, ttl.as_secs())
                        .await
                    {
                        tracing::warn!("Entity-key cache put failed for {}: {}", file_id, e);
                    }
                }
                Err(e) => {
                    tracing::warn!("Entity-key index encode failed for {}: {}", file_id, e);
                }
            }
        }

        let expires_at = Utc::now() + chrono::Duration::from_std(ttl).unwrap_or_default();
        self.memory
            .write()
            .await
            .insert(file_id.to_string(), (index.clone(), expires_at));
    }

    /// Looks up the index for a file, bounded by the read deadline.
    ///
    /// Returns `None` on miss, error or deadline; the caller then takes the
    /// attribute-query path, which has no latency guarantee.
    pub async fn get(&self, file_id: Uuid) -> Option<EntityKeyIndex> {
        if let Some(redis) = &self.redis {
            let mut conn = redis.clone();
            match timeout(
                GET_DEADLINE,
                conn.get::<_, Option<String>>(Self::cache_key(file_id)),
            )
            .await
            {
                Ok(Ok(Some(record))) => match sonic_rs::from_str(&record) {
                    Ok(index) => return Some(index),
                    Err(e) => {
                        tracing::warn!("Discarding undecodable entity-key index: {}", e);
                    }
                },
                Ok(Ok(None)) => {}
                Ok(Err(e)) => {
                    tracing::warn!("Entity-key cache get failed for {}: {}", file_id, e);
                }
                Err(_) => {
                    tracing::warn!("Entity-key cache get timed out for {}", file_id);
                }
            }
        }

        let memory = self.memory.read().await;
        memory
            .get(&file_id.to_string())
            .filter(|(_, expires_at)| *expires_at > Utc::now())
            .map(|(index, _)| index.clone())
    }
}
