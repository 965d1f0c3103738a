use deadpool::managed::{PoolError, TimeoutType};
use serde::Serialize;
use thiserror::Error;

/// The application's error type.
#[derive(Error, Debug)]
pub enum AppError {
    /// A request validation error.
    #[error("Validation error: {0}")]
    Validation(String),

    /// A content type outside the configured allowlist.
    #[error("Unsupported content type: {0}")]
    UnsupportedType(String),

    /// A payload larger than the configured maximum.
    #[error("Payload too large: {size} bytes (max {max})")]
    TooLarge { size: u64, max: u64 },

    /// A quota admission denial.
    #[error("Quota exceeded: {0}")]
    QuotaExceeded(String),

    /// A file that does not exist on the ledger.
    #[error("File not found")]
    NotFound,

    /// A chunk set shorter than the metadata's chunk count.
    #[error("File incomplete: {found} of {expected} chunks available")]
    FileIncomplete { found: u32, expected: u32 },

    /// A checksum mismatch after reassembly.
    #[error("Integrity verification failed: {0}")]
    IntegrityFailed(String),

    /// An upload session that does not exist or has expired.
    #[error("Upload session not found")]
    SessionNotFound,

    /// A ledger that rejected or cannot service the call.
    #[error("Ledger unavailable: {0}")]
    LedgerUnavailable(String),

    /// A deadline that fired before the operation finished.
    #[error("Operation timed out: {0}")]
    Timeout(String),

    /// A retry budget that was exhausted without success.
    #[error("Retries exhausted: {0}")]
    RetryExhausted(String),

    /// A transport-level connection failure.
    #[error("Connection error: {0}")]
    Connection(String),

    /// The process is shutting down; no new work is accepted.
    #[error("Shutting down")]
    ShuttingDown,

    /// A Redis error.
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    /// A ledger transport error.
    #[error("Ledger transport error: {0}")]
    Transport(#[from] reqwest::Error),

    /// An internal server error.
    #[error("Internal error: {0}")]
    Internal(String),
}

/// A `Result` type that uses `AppError` as the error type.
pub type Result<T> = std::result::Result<T, AppError>;

/// The machine-readable body returned to callers.
///
/// Internal messages and error sources are logged, never serialized here.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorBody {
    pub code: &'static str,
    pub error: String,
}

impl AppError {
    /// Returns the stable machine code for this error kind.
    pub fn code(&self) -> &'static str {
        match self {
            AppError::Validation(_) => "VALIDATION",
            AppError::UnsupportedType(_) => "UNSUPPORTED_TYPE",
            AppError::TooLarge { .. } => "TOO_LARGE",
            AppError::QuotaExceeded(_) => "QUOTA_EXCEEDED",
            AppError::NotFound => "NOT_FOUND",
            AppError::FileIncomplete { .. } => "FILE_INCOMPLETE",
            AppError::IntegrityFailed(_) => "INTEGRITY_FAILED",
            AppError::SessionNotFound => "SESSION_NOT_FOUND",
            AppError::LedgerUnavailable(_) => "LEDGER_UNAVAILABLE",
            AppError::Timeout(_) => "TIMEOUT",
            AppError::RetryExhausted(_) => "RETRY_EXHAUSTED",
            AppError::Connection(_) | AppError::Transport(_) => "CONNECTION_ERROR",
            AppError::ShuttingDown => "SHUTTING_DOWN",
            AppError::Redis(_) | AppError::Internal(_) => "INTERNAL",
        }
    }

    /// Whether a retry of the failed call may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            AppError::LedgerUnavailable(_)
                | AppError::Timeout(_)
                | AppError::Connection(_)
                | AppError::Transport(_)
        )
    }

    /// Converts the error into its outward body, logging the full detail.
    pub fn to_body(&self) -> ErrorBody {
        let message = match self {
            AppError::Validation(msg) => {
                tracing::debug!("Validation error: {}", msg);
                msg.clone()
            }

            AppError::UnsupportedType(ct) => {
                tracing::debug!("Unsupported content type: {}", ct);
                format!("Content type '{}' is not allowed", ct)
            }

            AppError::TooLarge { size, max } => {
                tracing::debug!("Payload too large: {} > {}", size, max);
                format!("File size {} exceeds the maximum of {} bytes", size, max)
            }

            AppError::QuotaExceeded(msg) => {
                tracing::warn!("Quota exceeded: {}", msg);
                msg.clone()
            }

            AppError::NotFound => {
                tracing::debug!("File not found");
                "File not found".to_string()
            }

            AppError::FileIncomplete { found, expected } => {
                tracing::warn!("File incomplete: {}/{} chunks", found, expected);
                format!("Only {} of {} chunks are available yet", found, expected)
            }

            AppError::IntegrityFailed(msg) => {
                tracing::error!("Integrity verification failed: {}", msg);
                "File integrity verification failed".to_string()
            }

            AppError::SessionNotFound => {
                tracing::debug!("Upload session not found");
                "Upload session not found".to_string()
            }

            AppError::LedgerUnavailable(msg) => {
                tracing::error!("Ledger unavailable: {}", msg);
                "Storage ledger is temporarily unavailable".to_string()
            }

            AppError::Timeout(msg) => {
                tracing::warn!("Timeout: {}", msg);
                "Operation timed out".to_string()
            }

            AppError::RetryExhausted(msg) => {
                tracing::error!("Retries exhausted: {}", msg);
                "Storage operation failed after retries".to_string()
            }

            AppError::Connection(msg) => {
                tracing::error!("Connection error: {}", msg);
                "Storage connection failed".to_string()
            }

            AppError::Transport(e) => {
                tracing::error!("Ledger transport error: {}", e);
                "Storage connection failed".to_string()
            }

            AppError::ShuttingDown => {
                tracing::warn!("Request rejected during shutdown");
                "Service is shutting down".to_string()
            }

            AppError::Redis(e) => {
                tracing::error!("Redis error: {}", e);
                "Internal server error".to_string()
            }

            AppError::Internal(msg) => {
                tracing::error!("Internal error: {}", msg);
                "Internal server error".to_string()
            }
        };

        ErrorBody {
            code: self.code(),
            error: message,
        }
    }
}

impl From<PoolError<AppError>> for AppError {
    fn from(err: PoolError<AppError>) -> Self {
        match err {
            PoolError::Backend(e) => e,
            PoolError::Timeout(TimeoutType::Wait) => {
                AppError::Timeout("waiting for a ledger client handle".to_string())
            }
            PoolError::Timeout(kind) => {
                AppError::Timeout(format!("ledger pool {:?} deadline", kind))
            }
            PoolError::Closed => AppError::ShuttingDown,
            other => AppError::Internal(format!("ledger pool error: {}", other)),
        }
    }
}
