use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{AppError, Result};
use crate::models::chunk::Chunk;
use crate::models::file::{FileMetadata, FileSummary};
use crate::models::quota::QuotaRecord;

/// A key/value annotation attached to a ledger entity.
///
/// The ledger indexes annotations; equality queries over them are the only
/// way to find an entity without knowing its key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Annotation<T> {
    pub key: String,
    pub value: T,
}

impl<T> Annotation<T> {
    pub fn new(key: impl Into<String>, value: T) -> Self {
        Self {
            key: key.into(),
            value,
        }
    }
}

/// A new entity to be written to the ledger.
#[derive(Debug, Clone)]
pub struct EntityCreate {
    pub payload: Vec<u8>,
    /// Absolute block at which the ledger drops the entity. Must be at least
    /// one block past the current block at write time.
    pub expiration_block: u64,
    pub string_annotations: Vec<Annotation<String>>,
    pub numeric_annotations: Vec<Annotation<u64>>,
}

/// An entity read back from the ledger.
#[derive(Debug, Clone)]
pub struct LedgerEntity {
    /// The opaque key minted by the ledger at creation.
    pub key: String,
    pub payload: Vec<u8>,
    pub expiration_block: u64,
    pub string_annotations: Vec<Annotation<String>>,
    pub numeric_annotations: Vec<Annotation<u64>>,
}

impl LedgerEntity {
    /// Looks up a string annotation by key.
    pub fn string_annotation(&self, key: &str) -> Option<&str> {
        self.string_annotations
            .iter()
            .find(|a| a.key == key)
            .map(|a| a.value.as_str())
    }

    /// Looks up a numeric annotation by key.
    pub fn numeric_annotation(&self, key: &str) -> Option<u64> {
        self.numeric_annotations
            .iter()
            .find(|a| a.key == key)
            .map(|a| a.value)
    }
}

/// One equality clause of an annotation query.
#[derive(Debug, Clone)]
pub enum QueryClause {
    Str(String, String),
    Num(String, u64),
}

/// An equality query over the ledger's annotation index.
#[derive(Debug, Clone, Default)]
pub struct EntityQuery {
    pub clauses: Vec<QueryClause>,
    /// Page-size hint; the ledger may return fewer entries per page.
    pub limit: Option<usize>,
}

impl EntityQuery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_str(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.clauses
            .push(QueryClause::Str(key.into(), value.into()));
        self
    }

    pub fn with_num(mut self, key: impl Into<String>, value: u64) -> Self {
        self.clauses.push(QueryClause::Num(key.into(), value));
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Renders the ledger's query expression, e.g.
    /// `type="chunk" && file_id="..."`.
    pub fn to_expression(&self) -> String {
        self.clauses
            .iter()
            .map(|clause| match clause {
                QueryClause::Str(key, value) => {
                    format!("{}=\"{}\"", key, value.replace('"', "\\\""))
                }
                QueryClause::Num(key, value) => format!("{}={}", key, value),
            })
            .collect::<Vec<_>>()
            .join(" && ")
    }

    /// Evaluates the query against a single entity. Used by the in-memory
    /// backend in place of the ledger's index.
    pub fn matches(&self, entity: &LedgerEntity) -> bool {
        self.clauses.iter().all(|clause| match clause {
            QueryClause::Str(key, value) => entity.string_annotation(key) == Some(value.as_str()),
            QueryClause::Num(key, value) => entity.numeric_annotation(key) == Some(*value),
        })
    }
}

/// One page of query results; feed `next_cursor` back to continue.
#[derive(Debug, Clone)]
pub struct QueryPage {
    pub entities: Vec<LedgerEntity>,
    pub next_cursor: Option<String>,
}

/// The JSON payload of a `type=metadata` entity.
#[derive(Debug, Serialize, Deserialize)]
struct MetadataPayload {
    file_id: Uuid,
    original_filename: String,
    content_type: String,
    file_extension: String,
    total_size: u64,
    chunk_count: u32,
    checksum: String,
    created_at: DateTime<Utc>,
    btl_days: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    owner: Option<String>,
}

/// The JSON payload of a `type=quota` entity.
#[derive(Debug, Serialize, Deserialize)]
struct QuotaPayload {
    user_address: String,
    used_bytes: u64,
    uploads_today: u32,
    last_updated: DateTime<Utc>,
    date: String,
}

impl EntityCreate {
    /// Builds the metadata entity for a file descriptor.
    pub fn for_metadata(meta: &FileMetadata) -> Result<Self> {
        let payload = MetadataPayload {
            file_id: meta.file_id,
            original_filename: meta.original_filename.clone(),
            content_type: meta.content_type.clone(),
            file_extension: meta.file_extension.clone(),
            total_size: meta.total_size,
            chunk_count: meta.chunk_count,
            checksum: meta.checksum.clone(),
            created_at: meta.created_at,
            btl_days: meta.btl_days,
            owner: meta.owner.clone(),
        };
        let payload = sonic_rs::to_string(&payload)
            .map_err(|e| AppError::Internal(format!("metadata payload encode: {}", e)))?
            .into_bytes();

        let mut string_annotations = vec![
            Annotation::new("type", "metadata".to_string()),
            Annotation::new("file_id", meta.file_id.to_string()),
            Annotation::new("original_filename", meta.original_filename.clone()),
            Annotation::new("content_type", meta.content_type.clone()),
            Annotation::new("file_extension", meta.file_extension.clone()),
            Annotation::new("checksum", meta.checksum.clone()),
        ];
        if let Some(owner) = &meta.owner {
            string_annotations.push(Annotation::new("owner", owner.clone()));
        }

        Ok(Self {
            payload,
            expiration_block: meta.expiration_block,
            string_annotations,
            numeric_annotations: vec![
                Annotation::new("total_size", meta.total_size),
                Annotation::new("chunk_count", meta.chunk_count as u64),
                Annotation::new("expiration_block", meta.expiration_block),
                Annotation::new("btl_days", meta.btl_days as u64),
            ],
        })
    }

    /// Builds the chunk entity for one compressed fragment.
    pub fn for_chunk(chunk: &Chunk) -> Self {
        Self {
            payload: chunk.data.clone(),
            expiration_block: chunk.expiration_block,
            string_annotations: vec![
                Annotation::new("type", "chunk".to_string()),
                Annotation::new("file_id", chunk.file_id.to_string()),
                Annotation::new("chunk_index", chunk.chunk_index.to_string()),
                Annotation::new("checksum", chunk.checksum.clone()),
                Annotation::new("created_at", chunk.created_at.to_rfc3339()),
            ],
            numeric_annotations: vec![
                Annotation::new("chunk_size", chunk.original_size),
                Annotation::new("expiration_block", chunk.expiration_block),
            ],
        }
    }

    /// Builds the daily quota entity for a user.
    pub fn for_quota(record: &QuotaRecord, expiration_block: u64) -> Result<Self> {
        let payload = QuotaPayload {
            user_address: record.user_id.clone(),
            used_bytes: record.used_bytes,
            uploads_today: record.uploads_today,
            last_updated: Utc::now(),
            date: record.date.clone(),
        };
        let payload = sonic_rs::to_string(&payload)
            .map_err(|e| AppError::Internal(format!("quota payload encode: {}", e)))?
            .into_bytes();

        Ok(Self {
            payload,
            expiration_block,
            string_annotations: vec![
                Annotation::new("type", "quota".to_string()),
                Annotation::new("user_address", record.user_id.clone()),
                Annotation::new("date", record.date.clone()),
            ],
            numeric_annotations: vec![
                Annotation::new("used_bytes", record.used_bytes),
                Annotation::new("uploads_today", record.uploads_today as u64),
            ],
        })
    }
}

/// Decodes a metadata entity back into a file descriptor.
pub fn metadata_from_entity(entity: &LedgerEntity) -> Result<FileMetadata> {
    let payload: MetadataPayload = sonic_rs::from_slice(&entity.payload)
        .map_err(|e| AppError::Internal(format!("metadata payload decode ({}): {}", entity.key, e)))?;

    Ok(FileMetadata {
        file_id: payload.file_id,
        original_filename: payload.original_filename,
        content_type: payload.content_type,
        file_extension: payload.file_extension,
        total_size: payload.total_size,
        chunk_count: payload.chunk_count,
        checksum: payload.checksum,
        created_at: payload.created_at,
        expiration_block: entity.expiration_block,
        btl_days: payload.btl_days,
        ledger_key: Some(entity.key.clone()),
        owner: payload.owner,
    })
}

/// Decodes a metadata entity into a listing row.
pub fn summary_from_entity(entity: &LedgerEntity) -> Result<FileSummary> {
    let meta = metadata_from_entity(entity)?;
    Ok(FileSummary {
        file_id: meta.file_id,
        original_filename: meta.original_filename,
        content_type: meta.content_type,
        file_extension: meta.file_extension,
        total_size: meta.total_size,
        created_at: meta.created_at,
        owner: meta.owner,
    })
}

/// Decodes a chunk entity back into a chunk record.
pub fn chunk_from_entity(entity: &LedgerEntity) -> Result<Chunk> {
    let file_id = entity
        .string_annotation("file_id")
        .and_then(|v| Uuid::parse_str(v).ok())
        .ok_or_else(|| bad_chunk(entity, "file_id"))?;
    let chunk_index = entity
        .string_annotation("chunk_index")
        .and_then(|v| v.parse().ok())
        .ok_or_else(|| bad_chunk(entity, "chunk_index"))?;
    let checksum = entity
        .string_annotation("checksum")
        .ok_or_else(|| bad_chunk(entity, "checksum"))?
        .to_string();
    let created_at = entity
        .string_annotation("created_at")
        .and_then(|v| DateTime::parse_from_rfc3339(v).ok())
        .map(|dt| dt.with_timezone(&Utc))
        .ok_or_else(|| bad_chunk(entity, "created_at"))?;
    let original_size = entity
        .numeric_annotation("chunk_size")
        .ok_or_else(|| bad_chunk(entity, "chunk_size"))?;

    Ok(Chunk {
        id: Uuid::new_v4(),
        file_id,
        chunk_index,
        compressed_size: entity.payload.len() as u64,
        data: entity.payload.clone(),
        original_size,
        checksum,
        created_at,
        expiration_block: entity.expiration_block,
        ledger_key: Some(entity.key.clone()),
    })
}

/// Decodes a quota entity back into a usage record.
pub fn quota_from_entity(entity: &LedgerEntity) -> Result<QuotaRecord> {
    let payload: QuotaPayload = sonic_rs::from_slice(&entity.payload)
        .map_err(|e| AppError::Internal(format!("quota payload decode ({}): {}", entity.key, e)))?;

    Ok(QuotaRecord {
        user_id: payload.user_address,
        used_bytes: payload.used_bytes,
        uploads_today: payload.uploads_today,
        date: payload.date,
    })
}

fn bad_chunk(entity: &LedgerEntity, field: &str) -> AppError {
    AppError::Internal(format!(
        "chunk entity {} has a missing or invalid '{}' annotation",
        entity.key, field
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stored(create: EntityCreate, key: &str) -> LedgerEntity {
        LedgerEntity {
            key: key.to_string(),
            payload: create.payload,
            expiration_block: create.expiration_block,
            string_annotations: create.string_annotations,
            numeric_annotations: create.numeric_annotations,
        }
    }

    #[test]
    fn metadata_survives_the_wire() {
        let meta = FileMetadata {
            file_id: Uuid::new_v4(),
            original_filename: "report.pdf".to_string(),
            content_type: "application/pdf".to_string(),
            file_extension: "pdf".to_string(),
            total_size: 4096,
            chunk_count: 2,
            checksum: "ab".repeat(32),
            created_at: Utc::now(),
            expiration_block: 9_000,
            btl_days: 14,
            ledger_key: None,
            owner: Some("desk-7".to_string()),
        };

        let create = EntityCreate::for_metadata(&meta).unwrap();
        assert_eq!(create.expiration_block, 9_000);

        let entity = stored(create, "0xmeta");
        assert_eq!(entity.string_annotation("type"), Some("metadata"));
        assert_eq!(entity.numeric_annotation("chunk_count"), Some(2));

        let decoded = metadata_from_entity(&entity).unwrap();
        assert_eq!(decoded.file_id, meta.file_id);
        assert_eq!(decoded.total_size, 4096);
        assert_eq!(decoded.owner.as_deref(), Some("desk-7"));
        assert_eq!(decoded.ledger_key.as_deref(), Some("0xmeta"));
    }

    #[test]
    fn chunk_survives_the_wire() {
        let chunk = Chunk {
            id: Uuid::new_v4(),
            file_id: Uuid::new_v4(),
            chunk_index: 3,
            data: vec![1, 2, 3, 4],
            original_size: 64,
            compressed_size: 4,
            checksum: "cd".repeat(32),
            created_at: Utc::now(),
            expiration_block: 9_000,
            ledger_key: None,
        };

        let entity = stored(EntityCreate::for_chunk(&chunk), "0xchunk");
        assert_eq!(entity.string_annotation("chunk_index"), Some("3"));

        let decoded = chunk_from_entity(&entity).unwrap();
        assert_eq!(decoded.file_id, chunk.file_id);
        assert_eq!(decoded.chunk_index, 3);
        assert_eq!(decoded.data, vec![1, 2, 3, 4]);
        assert_eq!(decoded.original_size, 64);
        assert_eq!(decoded.compressed_size, 4);
    }

    #[test]
    fn chunk_with_missing_annotations_is_rejected() {
        let entity = LedgerEntity {
            key: "0xbroken".to_string(),
            payload: vec![],
            expiration_block: 9_000,
            string_annotations: vec![Annotation::new("type", "chunk".to_string())],
            numeric_annotations: vec![],
        };
        assert!(chunk_from_entity(&entity).is_err());
    }

    #[test]
    fn quota_survives_the_wire() {
        let record = QuotaRecord {
            user_id: "0xuser".to_string(),
            used_bytes: 1_000,
            uploads_today: 3,
            date: "2026-08-01".to_string(),
        };

        let entity = stored(EntityCreate::for_quota(&record, 9_000).unwrap(), "0xquota");
        assert_eq!(entity.string_annotation("date"), Some("2026-08-01"));
        assert_eq!(entity.numeric_annotation("used_bytes"), Some(1_000));

        let decoded = quota_from_entity(&entity).unwrap();
        assert_eq!(decoded.user_id, "0xuser");
        assert_eq!(decoded.uploads_today, 3);
    }

    #[test]
    fn query_expression_renders_clauses() {
        let query = EntityQuery::new()
            .with_str("type", "chunk")
            .with_str("file_id", "abc")
            .with_num("chunk_size", 64);
        assert_eq!(
            query.to_expression(),
            "type=\"chunk\" && file_id=\"abc\" && chunk_size=64"
        );
    }
}
