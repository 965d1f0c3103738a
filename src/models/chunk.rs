use chrono::{DateTime, Utc};
use uuid::Uuid;

/// One compressed fragment of a payload.
///
/// Produced by the chunker, owned by the ingestion pipeline until written,
/// then owned by the ledger. `checksum` covers the uncompressed slice;
/// `chunk_index` is dense and zero-based across the file's chunk set.
#[derive(Debug, Clone)]
pub struct Chunk {
    pub id: Uuid,
    pub file_id: Uuid,
    pub chunk_index: u32,
    /// Gzip-compressed slice bytes.
    pub data: Vec<u8>,
    pub original_size: u64,
    pub compressed_size: u64,
    /// SHA-256 of the uncompressed slice, hex-encoded.
    pub checksum: String,
    pub created_at: DateTime<Utc>,
    pub expiration_block: u64,
    /// Entity key minted by the ledger, set once the chunk is written.
    pub ledger_key: Option<String>,
}
