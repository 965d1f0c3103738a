use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use redis::AsyncCommands;
use redis::aio::ConnectionManager;
use subtle::ConstantTimeEq;
use tokio::sync::RwLock;

use crate::config::{Config, StorageMode};
use crate::error::{AppError, Result};
use crate::ledger::entity::{EntityCreate, EntityQuery, quota_from_entity};
use crate::ledger::pool::LedgerPools;
use crate::ledger::retry::RetryPolicy;
use crate::models::quota::{QuotaRecord, QuotaStatus};

/// How long cached quota records live.
pub const QUOTA_CACHE_TTL: Duration = Duration::from_secs(10 * 60);
/// Deadline for the best-effort authoritative write.
const COMMIT_DEADLINE: Duration = Duration::from_secs(30);

const QUOTA_PREFIX: &str = "quota:";

/// Tracks per-user daily usage against the free-tier ceilings.
///
/// The in-process counters absorb commits immediately; Redis fronts reads
/// with a short TTL; the ledger is the authoritative store in ledger mode
/// and is written best-effort after each commit. Counters are date-scoped:
/// the first touch of a new calendar date resets them.
#[derive(Clone)]
pub struct QuotaAccountant {
    redis: Option<ConnectionManager>,
    pools: Arc<LedgerPools>,
    counters: Arc<RwLock<HashMap<String, QuotaRecord>>>,
    max_bytes: u64,
    max_uploads: u32,
    bypass_key: Option<String>,
    ledger_authoritative: bool,
}

fn today() -> String {
    Utc::now().format("%Y-%m-%d").to_string()
}

impl QuotaAccountant {
    pub fn new(config: &Config, redis: Option<ConnectionManager>, pools: Arc<LedgerPools>) -> Self {
        let ledger_authoritative =
            config.storage_mode == StorageMode::Ledger && pools.can_write();
        Self {
            redis,
            pools,
            counters: Arc::new(RwLock::new(HashMap::new())),
            max_bytes: config.free_tier_max_bytes,
            max_uploads: config.free_tier_max_uploads_per_day,
            bypass_key: config.unlimited_bypass_key.clone(),
            ledger_authoritative,
        }
    }

    fn cache_key(user_id: &str, date: &str) -> String {
        format!("{}{}:{}", QUOTA_PREFIX, user_id, date)
    }

    /// Whether a presented bypass key matches the configured one.
    /// Compared in constant time.
    pub fn bypass_allowed(&self, presented: Option<&str>) -> bool {
        match (&self.bypass_key, presented) {
            (Some(expected), Some(given)) => {
                expected.as_bytes().ct_eq(given.as_bytes()).into()
            }
            _ => false,
        }
    }

    async fn read_cache(&self, user_id: &str, date: &str) -> Option<QuotaRecord> {
        let redis = self.redis.as_ref()?;
        let mut conn = redis.clone();
        match conn
            .get::<_, Option<String>>(Self::cache_key(user_id, date))
            .await
        {
            Ok(Some(record)) => sonic_rs::from_str(&record).ok(),
            Ok(None) => None,
            Err(e) => {
                tracing::warn!("Quota cache read failed for {}: {}", user_id, e);
                None
            }
        }
    }

    async fn write_cache(&self, record: &QuotaRecord) {
        let Some(redis) = &self.redis else { return };
        let Ok(encoded) = sonic_rs::to_string(record) else {
            return;
        };
        let mut conn = redis.clone();
        if let Err(e) = conn
            .set_ex::<_, _, ()>(
                Self::cache_key(&record.user_id, &record.date),
                encoded,
                QUOTA_CACHE_TTL.as_secs(),
            )
            .await
        {
            tracing::warn!("Quota cache write failed for {}: {}", record.user_id, e);
        }
    }

    /// Reads the authoritative daily record from the ledger. Several commits
    /// may have written competing entities; usage is monotonic within a day,
    /// so the largest `used_bytes` wins.
    async fn read_ledger(&self, user_id: &str, date: &str) -> Result<Option<QuotaRecord>> {
        let query = EntityQuery::new()
            .with_str("type", "quota")
            .with_str("user_address", user_id)
            .with_str("date", date);

        let entities = self.pools.query_all("quota lookup", &query).await?;
        Ok(entities
            .iter()
            .filter_map(|e| quota_from_entity(e).ok())
            .max_by_key(|r| r.used_bytes))
    }

    /// The current record for a user: cache, then the backing store, merged
    /// with the in-process counter.
    async fn load_record(&self, user_id: &str) -> QuotaRecord {
        let date = today();

        let mut record = match self.read_cache(user_id, &date).await {
            Some(record) => record,
            None => {
                let backing = if self.ledger_authoritative {
                    match self.read_ledger(user_id, &date).await {
                        Ok(record) => record,
                        Err(e) => {
                            tracing::warn!("Authoritative quota read failed for {}: {}", user_id, e);
                            None
                        }
                    }
                } else {
                    None
                };
                let record = backing.unwrap_or_else(|| QuotaRecord::empty(user_id, &date));
                self.write_cache(&record).await;
                record
            }
        };

        // A commit may have landed in-process before the cache caught up.
        let counters = self.counters.read().await;
        if let Some(counter) = counters.get(user_id)
            && counter.date == date
        {
            record.used_bytes = record.used_bytes.max(counter.used_bytes);
            record.uploads_today = record.uploads_today.max(counter.uploads_today);
        }

        record
    }

    /// Admission check: denies when the added bytes or the upload count
    /// would cross a ceiling. A valid bypass key skips the check entirely.
    pub async fn check(&self, user_id: &str, bytes: u64, bypass: Option<&str>) -> Result<()> {
        if self.bypass_allowed(bypass) {
            tracing::debug!("Quota bypass accepted for {}", user_id);
            return Ok(());
        }

        let record = self.load_record(user_id).await;

        if record.used_bytes.saturating_add(bytes) > self.max_bytes {
            return Err(AppError::QuotaExceeded(format!(
                "Storage quota exceeded: {} of {} bytes used",
                record.used_bytes, self.max_bytes
            )));
        }

        if record.uploads_today >= self.max_uploads {
            return Err(AppError::QuotaExceeded(format!(
                "Daily upload limit of {} reached",
                self.max_uploads
            )));
        }

        Ok(())
    }

    /// Records accepted usage. The in-process counter and cache are updated
    /// before returning; the authoritative ledger write is detached and
    /// bounded, and its failure is logged, never surfaced.
    pub async fn commit(&self, user_id: &str, bytes: u64) {
        let date = today();

        let record = {
            let mut counters = self.counters.write().await;
            let entry = counters
                .entry(user_id.to_string())
                .or_insert_with(|| QuotaRecord::empty(user_id, &date));
            if entry.date != date {
                // Daily rollover: uploads reset with the calendar date.
                *entry = QuotaRecord::empty(user_id, &date);
            }
            entry.used_bytes += bytes;
            entry.uploads_today += 1;
            entry.clone()
        };

        self.write_cache(&record).await;

        if self.ledger_authoritative {
            let accountant = self.clone();
            tokio::spawn(async move {
                match tokio::time::timeout(COMMIT_DEADLINE, accountant.write_ledger(&record)).await
                {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => {
                        tracing::warn!(
                            "Authoritative quota write failed for {}: {}",
                            record.user_id,
                            e
                        );
                    }
                    Err(_) => {
                        tracing::warn!(
                            "Authoritative quota write timed out for {}",
                            record.user_id
                        );
                    }
                }
            });
        }
    }

    async fn write_ledger(&self, record: &QuotaRecord) -> Result<()> {
        let expiration_block = self.pools.expiration_block(1).await?;
        let entity = EntityCreate::for_quota(record, expiration_block)?;
        self.pools
            .with_write("quota write", RetryPolicy::SINGLE, |backend| {
                let entity = entity.clone();
                async move { backend.create_entities(vec![entity]).await }
            })
            .await?;
        Ok(())
    }

    /// The usage document for the quota endpoint.
    pub async fn status(&self, user_id: &str) -> QuotaStatus {
        let record = self.load_record(user_id).await;
        let usage_percentage = if self.max_bytes == 0 {
            0.0
        } else {
            (record.used_bytes as f64 / self.max_bytes as f64) * 100.0
        };

        QuotaStatus {
            used_bytes: record.used_bytes,
            max_bytes: self.max_bytes,
            uploads_today: record.uploads_today,
            max_uploads_per_day: self.max_uploads,
            usage_percentage,
        }
    }
}
