//! Content-addressed file-storage core.
//!
//! Payloads are split into gzip-compressed, checksummed chunks and persisted
//! as annotated entities on an external block-TTL ledger. Upload sessions,
//! the entity-key index and quota counters are cached in Redis with an
//! in-process fallback. The public operations in [`services`] are
//! transport-agnostic: any HTTP (or other) layer can drive them through an
//! [`AppState`].

pub mod config;
pub mod error;
pub mod state;

pub mod models {
    pub mod chunk;
    pub mod file;
    pub mod quota;
    pub mod session;
}

pub mod ledger {
    pub mod backend;
    pub mod entity;
    pub mod memory;
    pub mod pool;
    pub mod retry;
    pub mod rpc;
}

pub mod stores {
    pub mod entity_keys;
    pub mod session_store;
}

pub mod services {
    pub mod chunker;
    pub mod health;
    pub mod ingestion;
    pub mod query;
    pub mod quota;
    pub mod retrieval;
}

pub mod validation {
    pub mod upload;
}

pub use config::{Config, StorageMode};
pub use error::{AppError, ErrorBody, Result};
pub use state::AppState;
