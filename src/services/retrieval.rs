use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt, TryStreamExt};
use serde::Serialize;
use uuid::Uuid;

use crate::error::{AppError, Result};
use crate::ledger::entity::{
    EntityQuery, LedgerEntity, chunk_from_entity, metadata_from_entity,
};
use crate::ledger::retry::RetryPolicy;
use crate::models::chunk::Chunk;
use crate::models::file::FileMetadata;
use crate::services::chunker;
use crate::state::AppState;
use crate::stores::entity_keys::EntityKeyIndex;

/// Concurrent chunk fetches per file.
const CHUNK_FETCH_PARALLELISM: usize = 8;

/// The metadata document served next to info requests.
#[derive(Debug, Clone, Serialize)]
pub struct FileInfoResponse {
    pub file_id: Uuid,
    pub original_filename: String,
    pub content_type: String,
    pub file_extension: String,
    pub total_size: u64,
    pub chunk_count: u32,
    pub checksum: String,
    pub created_at: DateTime<Utc>,
    pub btl_days: u32,
    pub expiration_block: u64,
    pub expires_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub owner: Option<String>,
    pub metadata_entity_key: Option<String>,
    pub chunk_entity_keys: Vec<String>,
    pub total_blockchain_entities: usize,
}

/// The bare entity-key document.
#[derive(Debug, Clone, Serialize)]
pub struct EntityKeysResponse {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata_entity_key: Option<String>,
    pub chunk_entity_keys: Vec<String>,
    pub total_entities: usize,
}

/// Fetches a file's bytes and metadata.
///
/// The entity-key cache short-circuits the owner scan when it has the keys;
/// otherwise the attribute index is queried. A chunk set shorter than the
/// metadata's count surfaces as `FILE_INCOMPLETE` (the client may retry); a
/// checksum mismatch after reassembly is `INTEGRITY_FAILED`.
pub async fn get_file(state: &AppState, file_id: Uuid) -> Result<(Vec<u8>, FileMetadata)> {
    let cached = state.entity_keys.get(file_id).await;

    let metadata = resolve_metadata(state, file_id, cached.as_ref()).await?;

    let chunks = match cached
        .as_ref()
        .filter(|index| index.chunk_keys.len() == metadata.chunk_count as usize)
    {
        Some(index) => fetch_chunks_by_keys(state, &index.chunk_keys).await?,
        None => query_chunks(state, file_id).await?,
    };

    let payload = chunker::reassemble(&metadata, chunks)?;
    Ok((payload, metadata))
}

/// Fetches the metadata document plus the keys and expiry estimate.
pub async fn get_file_info(state: &AppState, file_id: Uuid) -> Result<FileInfoResponse> {
    let cached = state.entity_keys.get(file_id).await;
    let metadata = resolve_metadata(state, file_id, cached.as_ref()).await?;
    let keys = entity_key_set(state, file_id, cached, &metadata).await?;

    // Fall back to the BTL window when the ledger cannot be asked for the
    // block estimate.
    let expires_at = match state.pools.estimate_block_time(metadata.expiration_block).await {
        Ok(instant) => instant,
        Err(_) => metadata.created_at + chrono::Duration::days(metadata.btl_days as i64),
    };

    let total = keys.chunk_keys.len() + usize::from(keys.metadata_key.is_some());
    Ok(FileInfoResponse {
        file_id: metadata.file_id,
        original_filename: metadata.original_filename,
        content_type: metadata.content_type,
        file_extension: metadata.file_extension,
        total_size: metadata.total_size,
        chunk_count: metadata.chunk_count,
        checksum: metadata.checksum,
        created_at: metadata.created_at,
        btl_days: metadata.btl_days,
        expiration_block: metadata.expiration_block,
        expires_at,
        owner: metadata.owner,
        metadata_entity_key: keys.metadata_key,
        chunk_entity_keys: keys.chunk_keys,
        total_blockchain_entities: total,
    })
}

/// Fetches the ledger keys backing a file.
pub async fn get_entity_keys(state: &AppState, file_id: Uuid) -> Result<EntityKeysResponse> {
    let cached = state.entity_keys.get(file_id).await;
    let metadata = resolve_metadata(state, file_id, cached.as_ref()).await?;
    let keys = entity_key_set(state, file_id, cached, &metadata).await?;

    let total = keys.chunk_keys.len() + usize::from(keys.metadata_key.is_some());
    Ok(EntityKeysResponse {
        metadata_entity_key: keys.metadata_key,
        chunk_entity_keys: keys.chunk_keys,
        total_entities: total,
    })
}

/// Resolves metadata through the cached key or the attribute index.
async fn resolve_metadata(
    state: &AppState,
    file_id: Uuid,
    cached: Option<&EntityKeyIndex>,
) -> Result<FileMetadata> {
    if let Some(key) = cached.and_then(|index| index.metadata_key.clone()) {
        let entity = fetch_entity(state, &key).await?;
        if let Some(entity) = entity {
            return metadata_from_entity(&entity);
        }
        // The cached key can outlive the entity; fall through to the scan.
    }

    let query = EntityQuery::new()
        .with_str("type", "metadata")
        .with_str("file_id", file_id.to_string())
        .with_limit(1);

    let page = state
        .pools
        .with_read("metadata lookup", RetryPolicy::SINGLE, |backend| {
            let query = query.clone();
            async move { backend.query_entities(&query, None).await }
        })
        .await?;

    match page.entities.first() {
        Some(entity) => metadata_from_entity(entity),
        None => Err(AppError::NotFound),
    }
}

/// The full key set for a file: from the cache when complete, otherwise from
/// the attribute index.
async fn entity_key_set(
    state: &AppState,
    file_id: Uuid,
    cached: Option<EntityKeyIndex>,
    metadata: &FileMetadata,
) -> Result<EntityKeyIndex> {
    if let Some(index) = cached
        && index.metadata_key.is_some()
        && index.chunk_keys.len() == metadata.chunk_count as usize
    {
        return Ok(index);
    }

    let mut entities = query_chunk_entities(state, file_id).await?;
    entities.sort_by_key(|entity| {
        entity
            .string_annotation("chunk_index")
            .and_then(|v| v.parse::<u32>().ok())
            .unwrap_or(u32::MAX)
    });

    Ok(EntityKeyIndex {
        metadata_key: metadata.ledger_key.clone(),
        chunk_keys: entities.into_iter().map(|e| e.key).collect(),
    })
}

async fn fetch_entity(state: &AppState, key: &str) -> Result<Option<LedgerEntity>> {
    state
        .pools
        .with_read("entity fetch", RetryPolicy::SINGLE, |backend| {
            let key = key.to_string();
            async move { backend.get_entity(&key).await }
        })
        .await
}

/// Fetches chunks by their cached keys with bounded parallelism, preserving
/// index order. A key whose entity has expired simply drops out; reassembly
/// reports the shortfall.
async fn fetch_chunks_by_keys(state: &AppState, keys: &[String]) -> Result<Vec<Chunk>> {
    let fetches = keys.iter().map(|key| fetch_entity(state, key));

    let entities: Vec<Option<LedgerEntity>> = stream::iter(fetches)
        .buffered(CHUNK_FETCH_PARALLELISM)
        .try_collect()
        .await?;

    entities
        .into_iter()
        .flatten()
        .map(|entity| chunk_from_entity(&entity))
        .collect()
}

async fn query_chunk_entities(state: &AppState, file_id: Uuid) -> Result<Vec<LedgerEntity>> {
    let query = EntityQuery::new()
        .with_str("type", "chunk")
        .with_str("file_id", file_id.to_string());
    state.pools.query_all("chunk scan", &query).await
}

async fn query_chunks(state: &AppState, file_id: Uuid) -> Result<Vec<Chunk>> {
    query_chunk_entities(state, file_id)
        .await?
        .iter()
        .map(chunk_from_entity)
        .collect()
}
