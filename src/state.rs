use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use redis::aio::ConnectionManager;

use crate::config::Config;
use crate::error::Result;
use crate::ledger::backend::LedgerBackend;
use crate::ledger::pool::LedgerPools;
use crate::services::quota::QuotaAccountant;
use crate::stores::entity_keys::EntityKeyCache;
use crate::stores::session_store::SessionStore;

/// The application's state.
///
/// The composition root wired once at boot: ledger pools, the optional Redis
/// connection, the session and entity-key stores and the quota accountant.
/// Cloning is cheap; every component shares its inner state.
#[derive(Clone)]
pub struct AppState {
    /// The application's configuration.
    pub config: Config,
    /// The Redis connection manager, when caching is enabled.
    pub redis: Option<ConnectionManager>,
    /// The ledger read/write pools.
    pub pools: Arc<LedgerPools>,
    /// The upload-session store.
    pub sessions: SessionStore,
    /// The entity-key index cache.
    pub entity_keys: EntityKeyCache,
    /// The quota accountant.
    pub quota: QuotaAccountant,
    shutting_down: Arc<AtomicBool>,
}

impl AppState {
    /// Creates a new `AppState` for the configured backend.
    ///
    /// # Arguments
    ///
    /// * `config` - The application's configuration.
    ///
    /// # Returns
    ///
    /// A `Result` containing the `AppState`.
    pub async fn new(config: &Config) -> Result<Self> {
        let pools = LedgerPools::new(config)?;
        Self::wire(config, pools).await
    }

    /// Creates an `AppState` over an injected shared ledger backend.
    ///
    /// Used by tests and embedders that bring their own backend.
    pub async fn with_backend(config: &Config, backend: Arc<dyn LedgerBackend>) -> Result<Self> {
        let pools = LedgerPools::with_shared_backend(config, Some(backend))?;
        Self::wire(config, pools).await
    }

    async fn wire(config: &Config, pools: Arc<LedgerPools>) -> Result<Self> {
        let redis = match &config.redis_url {
            Some(url) => match connect_redis(url).await {
                Ok(conn) => {
                    tracing::info!("✅ Redis connection manager initialized");
                    Some(conn)
                }
                Err(e) => {
                    tracing::warn!("Redis unavailable, caches degrade to memory: {}", e);
                    None
                }
            },
            None => None,
        };

        pools.refresh_block_timing().await;
        LedgerPools::spawn_health_loop(&pools, config.pool_idle, config.pool_health);
        tracing::info!(
            "✅ Ledger pools initialized (read: {}, write: {})",
            config.read_pool_max,
            if pools.can_write() {
                config.write_pool_max
            } else {
                0
            }
        );

        let sessions = SessionStore::new(redis.clone());
        let entity_keys = EntityKeyCache::new(redis.clone());
        let quota = QuotaAccountant::new(config, redis.clone(), Arc::clone(&pools));

        Ok(AppState {
            config: config.clone(),
            redis,
            pools,
            sessions,
            entity_keys,
            quota,
            shutting_down: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Whether shutdown has begun.
    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    /// Begins shutdown: new admissions are refused and the ledger pools are
    /// closed. In-flight writers finish or time out on their own deadlines.
    pub fn shutdown(&self) {
        if self.shutting_down.swap(true, Ordering::SeqCst) {
            return;
        }
        tracing::info!("🛑 Shutdown requested, closing ledger pools");
        self.pools.close();
    }
}

async fn connect_redis(url: &str) -> Result<ConnectionManager> {
    let client = redis::Client::open(url)?;
    let manager = ConnectionManager::new(client).await?;
    Ok(manager)
}
