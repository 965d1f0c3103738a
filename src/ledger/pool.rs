use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use deadpool::Runtime;
use deadpool::managed::{Metrics, Pool, RecycleResult, Timeouts};
use tokio::sync::RwLock;
use tokio::time::MissedTickBehavior;

use crate::config::{Config, StorageMode};
use crate::error::{AppError, Result};
use crate::ledger::backend::LedgerBackend;
use crate::ledger::memory::MemoryLedger;
use crate::ledger::retry::RetryPolicy;
use crate::ledger::rpc::LedgerRpcClient;

/// Deadline for recycling a returned handle.
const RECYCLE_TIMEOUT: Duration = Duration::from_secs(1);
/// Seconds in a BTL day.
const SECONDS_PER_DAY: f64 = 86_400.0;

/// How pooled handles are produced.
enum HandleFactory {
    /// Every handle shares one in-process backend.
    Shared(Arc<dyn LedgerBackend>),
    /// Every handle is its own RPC client.
    Rpc {
        url: String,
        private_key: Option<String>,
        timeout: Duration,
        connect_timeout: Duration,
    },
}

/// Produces and recycles the handles of one pool.
pub struct LedgerManager {
    factory: HandleFactory,
    label: &'static str,
}

impl deadpool::managed::Manager for LedgerManager {
    type Type = Arc<dyn LedgerBackend>;
    type Error = AppError;

    async fn create(&self) -> Result<Self::Type> {
        match &self.factory {
            HandleFactory::Shared(backend) => Ok(Arc::clone(backend)),
            HandleFactory::Rpc {
                url,
                private_key,
                timeout,
                connect_timeout,
            } => {
                tracing::debug!("Creating {} ledger handle", self.label);
                let client =
                    LedgerRpcClient::new(url, private_key.clone(), *timeout, *connect_timeout)?;
                Ok(Arc::new(client))
            }
        }
    }

    async fn recycle(&self, _handle: &mut Self::Type, _metrics: &Metrics) -> RecycleResult<AppError> {
        Ok(())
    }
}

/// The bounded read and write pools of ledger handles, plus the cached
/// block-timing probe.
///
/// Acquisition blocks on the pool's FIFO waiter queue and fails with
/// `TIMEOUT` when the wait deadline fires, or `SHUTTING_DOWN` once the pools
/// are closed. Handles idle past the configured window are evicted by the
/// health sweep and recreated on demand.
pub struct LedgerPools {
    read: Pool<LedgerManager>,
    write: Option<Pool<LedgerManager>>,
    seconds_per_block: RwLock<Option<f64>>,
    blocks_per_day_fallback: u64,
}

fn build_pool(
    factory: HandleFactory,
    label: &'static str,
    max_size: usize,
    config: &Config,
) -> Result<Pool<LedgerManager>> {
    Pool::builder(LedgerManager { factory, label })
        .max_size(max_size)
        .timeouts(Timeouts {
            wait: Some(config.ledger_timeout),
            create: Some(config.pool_connect_timeout),
            recycle: Some(RECYCLE_TIMEOUT),
        })
        .runtime(Runtime::Tokio1)
        .build()
        .map_err(|e| AppError::Internal(format!("failed to build {} pool: {}", label, e)))
}

impl LedgerPools {
    /// Builds the pools for the configured backend.
    ///
    /// In memory mode both pools share one in-process ledger. In ledger mode
    /// the write pool exists only when a signing key is configured.
    pub fn new(config: &Config) -> Result<Arc<Self>> {
        let shared = match config.storage_mode {
            StorageMode::Memory => {
                Some(Arc::new(MemoryLedger::new()) as Arc<dyn LedgerBackend>)
            }
            StorageMode::Ledger => None,
        };
        Self::with_shared_backend(config, shared)
    }

    /// Builds the pools over an explicit shared backend.
    ///
    /// Used by memory mode and by tests that inject fault-wrapping backends.
    pub fn with_shared_backend(
        config: &Config,
        shared: Option<Arc<dyn LedgerBackend>>,
    ) -> Result<Arc<Self>> {
        let (read_factory, write_factory) = match shared {
            Some(backend) => (
                HandleFactory::Shared(Arc::clone(&backend)),
                Some(HandleFactory::Shared(backend)),
            ),
            None => {
                let url = config.ledger_rpc_url.clone().ok_or_else(|| {
                    AppError::Internal("ledger mode requires a ledger RPC URL".to_string())
                })?;
                let read = HandleFactory::Rpc {
                    url: url.clone(),
                    private_key: None,
                    timeout: config.ledger_timeout,
                    connect_timeout: config.pool_connect_timeout,
                };
                let write = config.ledger_private_key.clone().map(|key| HandleFactory::Rpc {
                    url,
                    private_key: Some(key),
                    timeout: config.ledger_timeout,
                    connect_timeout: config.pool_connect_timeout,
                });
                (read, write)
            }
        };

        let read = build_pool(read_factory, "read", config.read_pool_max, config)?;
        let write = write_factory
            .map(|factory| build_pool(factory, "write", config.write_pool_max, config))
            .transpose()?;

        Ok(Arc::new(Self {
            read,
            write,
            seconds_per_block: RwLock::new(None),
            blocks_per_day_fallback: config.blocks_per_day,
        }))
    }

    /// Whether write credentials are available.
    pub fn can_write(&self) -> bool {
        self.write.is_some()
    }

    /// Runs `op` on a read handle under the given retry policy.
    pub async fn with_read<T, F, Fut>(&self, what: &str, policy: RetryPolicy, op: F) -> Result<T>
    where
        F: FnMut(Arc<dyn LedgerBackend>) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        run(&self.read, what, policy, op).await
    }

    /// Runs `op` on a write handle under the given retry policy.
    pub async fn with_write<T, F, Fut>(&self, what: &str, policy: RetryPolicy, op: F) -> Result<T>
    where
        F: FnMut(Arc<dyn LedgerBackend>) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let pool = self.write.as_ref().ok_or_else(|| {
            AppError::LedgerUnavailable("no write credentials configured".to_string())
        })?;
        run(pool, what, policy, op).await
    }

    /// Probes the ledger's block duration and caches it.
    ///
    /// Called once at startup. A failed probe leaves the configured
    /// `BLOCKS_PER_DAY` conversion in force.
    pub async fn refresh_block_timing(&self) {
        let probe = self
            .with_read("block timing probe", RetryPolicy::SINGLE, |backend| async move {
                backend.block_duration_secs().await
            })
            .await;

        match probe {
            Ok(secs) if secs > 0.0 => {
                *self.seconds_per_block.write().await = Some(secs);
                tracing::info!("✅ Ledger block duration: {:.2}s", secs);
            }
            Ok(secs) => {
                tracing::warn!(
                    "Ledger reported a non-positive block duration ({}); using the BLOCKS_PER_DAY fallback",
                    secs
                );
            }
            Err(e) => {
                tracing::warn!("Block timing probe failed; using the BLOCKS_PER_DAY fallback: {}", e);
            }
        }
    }

    /// The ledger's current block height.
    pub async fn current_block(&self) -> Result<u64> {
        self.with_read("block number", RetryPolicy::SINGLE, |backend| async move {
            backend.block_number().await
        })
        .await
    }

    async fn blocks_per_day(&self) -> u64 {
        match *self.seconds_per_block.read().await {
            Some(secs) => (SECONDS_PER_DAY / secs).floor() as u64,
            None => self.blocks_per_day_fallback,
        }
    }

    /// Computes the absolute expiration block for a BTL window.
    pub async fn expiration_block(&self, btl_days: u32) -> Result<u64> {
        let current = self.current_block().await?;
        let blocks = (btl_days as u64)
            .saturating_mul(self.blocks_per_day().await)
            .max(1);
        Ok(current + blocks)
    }

    /// Runs an annotation query to completion, draining every page.
    pub async fn query_all(
        &self,
        what: &str,
        query: &crate::ledger::entity::EntityQuery,
    ) -> Result<Vec<crate::ledger::entity::LedgerEntity>> {
        let mut entities = Vec::new();
        let mut cursor: Option<String> = None;
        loop {
            let page = self
                .with_read(what, RetryPolicy::SINGLE, |backend| {
                    let query = query.clone();
                    let cursor = cursor.clone();
                    async move { backend.query_entities(&query, cursor).await }
                })
                .await?;
            entities.extend(page.entities);
            match page.next_cursor {
                Some(next) => cursor = Some(next),
                None => break,
            }
        }
        Ok(entities)
    }

    /// Estimates the wall-clock instant at which a block height is reached.
    pub async fn estimate_block_time(&self, block: u64) -> Result<DateTime<Utc>> {
        let current = self.current_block().await?;
        let secs = match *self.seconds_per_block.read().await {
            Some(s) => s,
            None => SECONDS_PER_DAY / self.blocks_per_day_fallback as f64,
        };
        let delta_ms = (block.saturating_sub(current) as f64 * secs * 1000.0) as i64;
        Ok(Utc::now() + chrono::Duration::milliseconds(delta_ms))
    }

    /// Spawns the periodic sweep that evicts handles idle past `idle`.
    pub fn spawn_health_loop(pools: &Arc<Self>, idle: Duration, every: Duration) {
        let pools = Arc::clone(pools);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if pools.read.is_closed() {
                    break;
                }
                let _ = pools.read.retain(|_, metrics| metrics.last_used() <= idle);
                if let Some(write) = &pools.write {
                    let _ = write.retain(|_, metrics| metrics.last_used() <= idle);
                }
            }
            tracing::debug!("Pool health loop stopped");
        });
    }

    /// Closes both pools. Waiters are woken with an error and new
    /// acquisitions fail with `SHUTTING_DOWN`.
    pub fn close(&self) {
        self.read.close();
        if let Some(write) = &self.write {
            write.close();
        }
    }
}

async fn run<T, F, Fut>(
    pool: &Pool<LedgerManager>,
    what: &str,
    policy: RetryPolicy,
    mut op: F,
) -> Result<T>
where
    F: FnMut(Arc<dyn LedgerBackend>) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 0u32;
    loop {
        // The handle returns to the pool as soon as the call resolves; the
        // backoff sleep never pins a pool slot.
        let outcome = match pool.get().await {
            Ok(handle) => op(Arc::clone(&handle)).await,
            Err(e) => Err(AppError::from(e)),
        };

        match outcome {
            Ok(value) => return Ok(value),
            Err(AppError::ShuttingDown) => return Err(AppError::ShuttingDown),
            Err(e) if e.is_retryable() && attempt + 1 < policy.max_attempts => {
                let delay = policy.delay_for(attempt);
                attempt += 1;
                tracing::warn!(
                    "⏳ {} failed (attempt {}/{}), retrying in {:?}: {}",
                    what,
                    attempt,
                    policy.max_attempts,
                    delay,
                    e
                );
                tokio::time::sleep(delay).await;
            }
            Err(e) if e.is_retryable() => {
                return Err(AppError::RetryExhausted(format!(
                    "{} failed after {} attempts: {}",
                    what, policy.max_attempts, e
                )));
            }
            Err(e) => return Err(e),
        }
    }
}
