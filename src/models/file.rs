use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// The descriptor of one stored file.
///
/// Persisted to the ledger as a `type=metadata` entity; the invariant
/// `total_size == Σ original_size of chunks` and
/// `chunk_count == ceil(total_size / chunk_size)` holds for every accepted
/// payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileMetadata {
    pub file_id: Uuid,
    pub original_filename: String,
    pub content_type: String,
    /// Lowercased suffix after the last dot, or empty.
    pub file_extension: String,
    pub total_size: u64,
    pub chunk_count: u32,
    /// SHA-256 of the whole plaintext, hex-encoded.
    pub checksum: String,
    pub created_at: DateTime<Utc>,
    pub expiration_block: u64,
    pub btl_days: u32,
    /// Entity key minted by the ledger, set once the metadata is written.
    pub ledger_key: Option<String>,
    pub owner: Option<String>,
}

impl FileMetadata {
    /// Extracts the normalized extension from a filename.
    ///
    /// A name without a dot, or with only a leading dot, has no extension.
    pub fn extension_of(filename: &str) -> String {
        match filename.rfind('.') {
            None | Some(0) => String::new(),
            Some(idx) => filename[idx + 1..].to_lowercase(),
        }
    }
}

/// A single row in listing responses.
#[derive(Debug, Clone, Serialize)]
pub struct FileSummary {
    pub file_id: Uuid,
    pub original_filename: String,
    pub content_type: String,
    pub file_extension: String,
    pub total_size: u64,
    pub created_at: DateTime<Utc>,
    pub owner: Option<String>,
}
