use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use redis::AsyncCommands;
use redis::aio::ConnectionManager;
use tokio::sync::{Mutex, RwLock};
use uuid::Uuid;

use crate::error::Result;
use crate::models::session::UploadSession;

/// How long a session record lives.
pub const SESSION_TTL: Duration = Duration::from_secs(2 * 60 * 60);

/// Minimum spacing between logged cache failures.
const ERROR_LOG_INTERVAL: Duration = Duration::from_secs(60);

/// Namespace for session records. Disjoint from the file-id index so the two
/// key families can never collide.
const SESSION_PREFIX: &str = "session:";
/// Namespace for the file-id secondary index.
const FILE_ID_PREFIX: &str = "fileid:";

struct MemoryEntry {
    session: UploadSession,
    expires_at: DateTime<Utc>,
}

/// Persists upload sessions under their idempotency key.
///
/// Redis is the primary store (it survives process restarts); the in-process
/// maps mirror every write and answer reads whenever Redis is absent or
/// failing. Redis expiry is the TTL mechanism; the memory mirror honors its
/// own `expires_at` on read, so no sweep is needed. Cache failures degrade
/// to memory and are logged at most once per minute.
#[derive(Clone)]
pub struct SessionStore {
    redis: Option<ConnectionManager>,
    sessions: Arc<RwLock<HashMap<String, MemoryEntry>>>,
    by_file_id: Arc<RwLock<HashMap<String, String>>>,
    last_error_log: Arc<Mutex<Option<Instant>>>,
}

impl SessionStore {
    /// Creates a store over an optional Redis connection.
    pub fn new(redis: Option<ConnectionManager>) -> Self {
        Self {
            redis,
            sessions: Arc::new(RwLock::new(HashMap::new())),
            by_file_id: Arc::new(RwLock::new(HashMap::new())),
            last_error_log: Arc::new(Mutex::new(None)),
        }
    }

    fn session_key(idempotency_key: &str) -> String {
        format!("{}{}", SESSION_PREFIX, idempotency_key)
    }

    fn file_id_key(file_id: Uuid) -> String {
        format!("{}{}", FILE_ID_PREFIX, file_id)
    }

    async fn log_cache_error(&self, op: &str, err: &redis::RedisError) {
        let mut last = self.last_error_log.lock().await;
        let now = Instant::now();
        if last.is_none_or(|t| now.duration_since(t) >= ERROR_LOG_INTERVAL) {
            tracing::warn!("Session cache {} failed, using memory fallback: {}", op, err);
            *last = Some(now);
        }
    }

    /// Stores a session with the given TTL. Best-effort: a cache failure
    /// falls through to the memory mirror and never errors.
    pub async fn put(&self, session: &UploadSession, ttl: Duration) -> Result<()> {
        let record = sonic_rs::to_string(session)
            .map_err(|e| crate::error::AppError::Internal(format!("session encode: {}", e)))?;

        if let Some(redis) = &self.redis {
            let mut conn = redis.clone();
            let outcome: redis::RedisResult<()> = async {
                conn.set_ex::<_, _, ()>(
                    Self::session_key(&session.idempotency_key),
                    &record,
                    ttl.as_secs(),
                )
                .await?;
                conn.set_ex::<_, _, ()>(
                    Self::file_id_key(session.file_id),
                    &session.idempotency_key,
                    ttl.as_secs(),
                )
                .await
            }
            .await;

            if let Err(e) = outcome {
                self.log_cache_error("put", &e).await;
            }
        }

        let expires_at = Utc::now() + chrono::Duration::from_std(ttl).unwrap_or_default();
        self.sessions.write().await.insert(
            session.idempotency_key.clone(),
            MemoryEntry {
                session: session.clone(),
                expires_at,
            },
        );
        self.by_file_id
            .write()
            .await
            .insert(session.file_id.to_string(), session.idempotency_key.clone());

        Ok(())
    }

    /// Fetches a session by idempotency key: cache first, memory next.
    pub async fn get(&self, idempotency_key: &str) -> Option<UploadSession> {
        if let Some(redis) = &self.redis {
            let mut conn = redis.clone();
            match conn
                .get::<_, Option<String>>(Self::session_key(idempotency_key))
                .await
            {
                Ok(Some(record)) => match sonic_rs::from_str(&record) {
                    Ok(session) => return Some(session),
                    Err(e) => {
                        tracing::warn!("Discarding undecodable session record: {}", e);
                    }
                },
                Ok(None) => {}
                Err(e) => self.log_cache_error("get", &e).await,
            }
        }

        let sessions = self.sessions.read().await;
        sessions
            .get(idempotency_key)
            .filter(|entry| entry.expires_at > Utc::now())
            .map(|entry| entry.session.clone())
    }

    /// Fetches a session through the file-id secondary index.
    pub async fn get_by_file_id(&self, file_id: Uuid) -> Option<UploadSession> {
        if let Some(redis) = &self.redis {
            let mut conn = redis.clone();
            match conn
                .get::<_, Option<String>>(Self::file_id_key(file_id))
                .await
            {
                Ok(Some(idempotency_key)) => {
                    if let Some(session) = self.get(&idempotency_key).await {
                        return Some(session);
                    }
                }
                Ok(None) => {}
                Err(e) => self.log_cache_error("get_by_file_id", &e).await,
            }
        }

        let idempotency_key = {
            let index = self.by_file_id.read().await;
            index.get(&file_id.to_string()).cloned()
        }?;

        let sessions = self.sessions.read().await;
        sessions
            .get(&idempotency_key)
            .filter(|entry| entry.expires_at > Utc::now())
            .map(|entry| entry.session.clone())
    }

    /// Pushes the expiry of a session and its index entry out by `ttl`.
    pub async fn extend_ttl(&self, idempotency_key: &str, ttl: Duration) {
        let file_id = self.get(idempotency_key).await.map(|s| s.file_id);

        if let Some(redis) = &self.redis {
            let mut conn = redis.clone();
            let outcome: redis::RedisResult<()> = async {
                conn.expire::<_, ()>(Self::session_key(idempotency_key), ttl.as_secs() as i64)
                    .await?;
                if let Some(file_id) = file_id {
                    conn.expire::<_, ()>(Self::file_id_key(file_id), ttl.as_secs() as i64)
                        .await?;
                }
                Ok(())
            }
            .await;

            if let Err(e) = outcome {
                self.log_cache_error("extend_ttl", &e).await;
            }
        }

        let mut sessions = self.sessions.write().await;
        if let Some(entry) = sessions.get_mut(idempotency_key) {
            entry.expires_at = Utc::now() + chrono::Duration::from_std(ttl).unwrap_or_default();
        }
    }

    /// Lists sessions currently in the store.
    ///
    /// Redis keys are discovered with cursor-based SCAN iteration so large
    /// instances are never stalled by a blocking enumeration. Memory-only
    /// sessions are merged in. Intended for recovery and operator tooling,
    /// not the request path.
    pub async fn scan_sessions(&self) -> Vec<UploadSession> {
        let mut sessions: HashMap<String, UploadSession> = HashMap::new();

        if let Some(redis) = &self.redis {
            let mut conn = redis.clone();
            let mut cursor: u64 = 0;
            loop {
                let reply: redis::RedisResult<(u64, Vec<String>)> = redis::cmd("SCAN")
                    .arg(cursor)
                    .arg("MATCH")
                    .arg(format!("{}*", SESSION_PREFIX))
                    .arg("COUNT")
                    .arg(100)
                    .query_async(&mut conn)
                    .await;

                let (next, keys) = match reply {
                    Ok(page) => page,
                    Err(e) => {
                        self.log_cache_error("scan", &e).await;
                        break;
                    }
                };

                for key in keys {
                    if let Ok(Some(record)) = conn.get::<_, Option<String>>(&key).await
                        && let Ok(session) = sonic_rs::from_str::<UploadSession>(&record)
                    {
                        sessions.insert(session.idempotency_key.clone(), session);
                    }
                }

                cursor = next;
                if cursor == 0 {
                    break;
                }
            }
        }

        let now = Utc::now();
        let memory = self.sessions.read().await;
        for (key, entry) in memory.iter() {
            if entry.expires_at > now {
                sessions
                    .entry(key.clone())
                    .or_insert_with(|| entry.session.clone());
            }
        }

        sessions.into_values().collect()
    }

    /// Removes a session and its index entry.
    pub async fn delete(&self, idempotency_key: &str) {
        let file_id = self.get(idempotency_key).await.map(|s| s.file_id);

        if let Some(redis) = &self.redis {
            let mut conn = redis.clone();
            let outcome: redis::RedisResult<()> = async {
                conn.del::<_, ()>(Self::session_key(idempotency_key)).await?;
                if let Some(file_id) = file_id {
                    conn.del::<_, ()>(Self::file_id_key(file_id)).await?;
                }
                Ok(())
            }
            .await;

            if let Err(e) = outcome {
                self.log_cache_error("delete", &e).await;
            }
        }

        let mut sessions = self.sessions.write().await;
        sessions.remove(idempotency_key);
        if let Some(file_id) = file_id {
            self.by_file_id.write().await.remove(&file_id.to_string());
        }
    }
}
