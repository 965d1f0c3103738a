use std::env;
use std::time::Duration;
use anyhow::{Context, Result, bail};

/// Selects the ledger backend the service runs against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageMode {
    /// In-process backend; all entities live in a process-local map.
    Memory,
    /// The real ledger, reached over JSON-RPC.
    Ledger,
}

/// The application's configuration.
#[derive(Clone)]
pub struct Config {
    /// The selected storage backend.
    pub storage_mode: StorageMode,
    /// The ledger JSON-RPC endpoint. Required in ledger mode.
    pub ledger_rpc_url: Option<String>,
    /// The hex-encoded signing key for ledger writes. The write pool only
    /// exists when this is present.
    pub ledger_private_key: Option<String>,
    /// The URL of the Redis server, when caching is enabled.
    pub redis_url: Option<String>,
    /// The maximum accepted payload size in bytes.
    pub max_file_size: u64,
    /// The uncompressed chunk slice size in bytes.
    pub chunk_size: usize,
    /// The default expiration window in days when the caller supplies none.
    pub default_btl_days: u32,
    /// Blocks per day fallback when the ledger timing probe fails.
    pub blocks_per_day: u64,
    /// The free-tier byte ceiling per user and day.
    pub free_tier_max_bytes: u64,
    /// The free-tier upload-count ceiling per user and day.
    pub free_tier_max_uploads_per_day: u32,
    /// Allowed MIME type prefixes.
    pub allowed_content_types: Vec<String>,
    /// The per-ledger-call deadline.
    pub ledger_timeout: Duration,
    /// Chunks per ledger batch write.
    pub batch_size: usize,
    /// Maximum handles in the write pool.
    pub write_pool_max: usize,
    /// Maximum handles in the read pool.
    pub read_pool_max: usize,
    /// Idle duration after which a pooled handle is evicted.
    pub pool_idle: Duration,
    /// Interval of the pool health sweep.
    pub pool_health: Duration,
    /// Deadline for creating a new pooled handle.
    pub pool_connect_timeout: Duration,
    /// Opaque key that bypasses quota checks when presented.
    pub unlimited_bypass_key: Option<String>,
}

/// Reads an optional unsigned integer from the environment.
fn env_u64(name: &str, default: u64) -> Result<u64> {
    match env::var(name) {
        Ok(value) => value
            .parse()
            .with_context(|| format!("Invalid {}: {}", name, value)),
        Err(_) => Ok(default),
    }
}

/// Reads an optional millisecond duration from the environment.
fn env_ms(name: &str, default_ms: u64) -> Result<Duration> {
    Ok(Duration::from_millis(env_u64(name, default_ms)?))
}

impl Config {
    /// Creates a new `Config` from environment variables.
    ///
    /// # Returns
    ///
    /// A `Result` containing the `Config`.
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();

        let storage_mode = match env::var("STORAGE_MODE")
            .unwrap_or_else(|_| "memory".to_string())
            .to_lowercase()
            .as_str()
        {
            "memory" => StorageMode::Memory,
            "ledger" => StorageMode::Ledger,
            other => bail!("STORAGE_MODE must be 'memory' or 'ledger', got '{}'", other),
        };

        let ledger_rpc_url = env::var("LEDGER_RPC_URL").ok();
        if storage_mode == StorageMode::Ledger && ledger_rpc_url.is_none() {
            bail!("LEDGER_RPC_URL must be set when STORAGE_MODE=ledger");
        }

        let allowed_content_types = env::var("ALLOWED_CONTENT_TYPES")
            .unwrap_or_else(|_| {
                "text/,image/,application/pdf,application/json,application/octet-stream"
                    .to_string()
            })
            .split(',')
            .map(|s| s.trim().to_lowercase())
            .filter(|s| !s.is_empty())
            .collect();

        let batch_size = env_u64("BATCH_SIZE", 16)? as usize;
        if batch_size == 0 {
            bail!("BATCH_SIZE must be greater than 0");
        }

        let chunk_size = env_u64("CHUNK_SIZE", 32 * 1024)? as usize;
        if chunk_size == 0 {
            bail!("CHUNK_SIZE must be greater than 0");
        }

        Ok(Self {
            storage_mode,
            ledger_rpc_url,
            ledger_private_key: env::var("LEDGER_PRIVATE_KEY").ok(),
            redis_url: env::var("REDIS_URL").ok(),
            max_file_size: env_u64("MAX_FILE_SIZE", 50 * 1024 * 1024)?,
            chunk_size,
            default_btl_days: env_u64("DEFAULT_BTL_DAYS", 30)? as u32,
            blocks_per_day: env_u64("BLOCKS_PER_DAY", 2880)?,
            free_tier_max_bytes: env_u64("FREE_TIER_MAX_BYTES", 500 * 1024 * 1024)?,
            free_tier_max_uploads_per_day: env_u64("FREE_TIER_MAX_UPLOADS_PER_DAY", 100)? as u32,
            allowed_content_types,
            ledger_timeout: env_ms("BLOCKCHAIN_TIMEOUT_MS", 30_000)?,
            batch_size,
            write_pool_max: env_u64("WRITE_POOL_MAX", 8)? as usize,
            read_pool_max: env_u64("READ_POOL_MAX", 16)? as usize,
            pool_idle: env_ms("POOL_IDLE_MS", 300_000)?,
            pool_health: env_ms("POOL_HEALTH_MS", 60_000)?,
            pool_connect_timeout: env_ms("POOL_CONNECT_TIMEOUT_MS", 5_000)?,
            unlimited_bypass_key: env::var("UNLIMITED_BYPASS_KEY").ok(),
        })
    }

    /// Builds a memory-mode configuration with defaults, without touching the
    /// environment. Used by tests and embedded setups.
    pub fn for_memory_mode() -> Self {
        Self {
            storage_mode: StorageMode::Memory,
            ledger_rpc_url: None,
            ledger_private_key: None,
            redis_url: None,
            max_file_size: 50 * 1024 * 1024,
            chunk_size: 32 * 1024,
            default_btl_days: 30,
            blocks_per_day: 2880,
            free_tier_max_bytes: 500 * 1024 * 1024,
            free_tier_max_uploads_per_day: 100,
            allowed_content_types: vec![
                "text/".to_string(),
                "image/".to_string(),
                "application/pdf".to_string(),
                "application/json".to_string(),
                "application/octet-stream".to_string(),
            ],
            ledger_timeout: Duration::from_secs(30),
            batch_size: 16,
            write_pool_max: 8,
            read_pool_max: 16,
            pool_idle: Duration::from_secs(300),
            pool_health: Duration::from_secs(60),
            pool_connect_timeout: Duration::from_secs(5),
            unlimited_bypass_key: None,
        }
    }
}
