use chrono::Utc;
use serde::Serialize;
use uuid::Uuid;

use crate::error::{AppError, Result};
use crate::ledger::entity::EntityCreate;
use crate::ledger::retry::RetryPolicy;
use crate::models::chunk::Chunk;
use crate::models::file::FileMetadata;
use crate::models::session::{UploadProgress, UploadSession, UploadStatus};
use crate::services::chunker;
use crate::state::AppState;
use crate::stores::entity_keys::{ENTITY_KEY_TTL, EntityKeyIndex};
use crate::stores::session_store::SESSION_TTL;
use crate::validation::upload as validate;

/// The inputs of one upload attempt, as handed over by the transport.
#[derive(Debug, Clone)]
pub struct UploadRequest {
    pub payload: Vec<u8>,
    pub filename: String,
    pub content_type: String,
    pub owner: Option<String>,
    /// Client-supplied deduplication token; also the session identifier.
    pub idempotency_key: String,
    /// Expiration window in days; the configured default applies when absent.
    pub btl_days: Option<u32>,
    /// Optional quota bypass key.
    pub bypass_key: Option<String>,
    pub user_id: String,
}

/// The admission response. Persistence continues in the background.
#[derive(Debug, Clone, Serialize)]
pub struct UploadAccepted {
    pub file_id: Uuid,
    pub message: String,
}

/// The session status document.
#[derive(Debug, Clone, Serialize)]
pub struct UploadStatusResponse {
    pub file_id: Uuid,
    pub idempotency_key: String,
    pub status: UploadStatus,
    pub completed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub progress: UploadProgress,
}

/// Admits an upload and schedules its ledger persistence.
///
/// The admission steps run in order and short-circuit on the first failure:
/// size, content type, quota, idempotency replay. Past admission the payload
/// is chunked, a session is persisted and the detached writer takes over;
/// the call returns without waiting for the ledger.
pub async fn initiate_upload(state: &AppState, request: UploadRequest) -> Result<UploadAccepted> {
    if state.is_shutting_down() {
        return Err(AppError::ShuttingDown);
    }

    validate::validate_idempotency_key(&request.idempotency_key)?;
    if let Some(owner) = &request.owner {
        validate::validate_owner(owner)?;
    }
    validate::validate_payload_size(&state.config, request.payload.len())?;
    validate::validate_content_type(&state.config, &request.content_type)?;

    state
        .quota
        .check(
            &request.user_id,
            request.payload.len() as u64,
            request.bypass_key.as_deref(),
        )
        .await?;

    // Replays of a known idempotency key return the original file without
    // scheduling any new work, regardless of the replayed body.
    if let Some(existing) = state.sessions.get(&request.idempotency_key).await {
        tracing::info!(
            "♻️ Idempotent replay of key {} -> {}",
            request.idempotency_key,
            existing.file_id
        );
        return Ok(UploadAccepted {
            file_id: existing.file_id,
            message: "Upload already accepted".to_string(),
        });
    }

    let file_id = Uuid::new_v4();
    let btl_days = request.btl_days.unwrap_or(state.config.default_btl_days);
    let expiration_block = state.pools.expiration_block(btl_days).await?;

    let (metadata, chunks) = chunker::chunk_payload(
        &state.config,
        file_id,
        &request.payload,
        &request.filename,
        &request.content_type,
        request.owner.clone(),
        btl_days,
        expiration_block,
    )?;

    let session = UploadSession::new(request.idempotency_key.clone(), metadata.clone());
    state.sessions.put(&session, SESSION_TTL).await?;

    state
        .quota
        .commit(&request.user_id, request.payload.len() as u64)
        .await;

    tracing::info!(
        "📦 Upload {} admitted: {} bytes in {} chunks (expires at block {})",
        file_id,
        metadata.total_size,
        metadata.chunk_count,
        expiration_block
    );

    spawn_writer(state.clone(), session, metadata, chunks);

    Ok(UploadAccepted {
        file_id,
        message: "Upload successful".to_string(),
    })
}

/// The status document for a file id.
pub async fn upload_status(state: &AppState, file_id: Uuid) -> Result<UploadStatusResponse> {
    let session = state
        .sessions
        .get_by_file_id(file_id)
        .await
        .ok_or(AppError::SessionNotFound)?;
    Ok(status_response(session))
}

/// The status document for an idempotency key.
pub async fn upload_status_by_key(
    state: &AppState,
    idempotency_key: &str,
) -> Result<UploadStatusResponse> {
    let session = state
        .sessions
        .get(idempotency_key)
        .await
        .ok_or(AppError::SessionNotFound)?;
    Ok(status_response(session))
}

fn status_response(session: UploadSession) -> UploadStatusResponse {
    let progress = session.progress(Utc::now());
    UploadStatusResponse {
        file_id: session.file_id,
        idempotency_key: session.idempotency_key,
        status: session.status,
        completed: session.completed,
        error: session.error,
        progress,
    }
}

/// Detaches the background writer for an admitted session. The writer is the
/// session's single mutator and outlives the admitting request.
fn spawn_writer(state: AppState, session: UploadSession, metadata: FileMetadata, chunks: Vec<Chunk>) {
    tokio::spawn(async move {
        let file_id = session.file_id;
        match run_writer(&state, session, metadata, chunks).await {
            Ok(()) => tracing::info!("✅ Upload {} persisted to ledger", file_id),
            Err(e) => tracing::error!("❌ Upload {} failed: {}", file_id, e),
        }
    });
}

async fn run_writer(
    state: &AppState,
    mut session: UploadSession,
    mut metadata: FileMetadata,
    mut chunks: Vec<Chunk>,
) -> Result<()> {
    match write_all(state, &mut session, &mut metadata, &mut chunks).await {
        Ok(index) => {
            state
                .entity_keys
                .put(session.file_id, &index, ENTITY_KEY_TTL)
                .await;

            session.metadata = metadata;
            session.status = UploadStatus::Completed;
            session.completed = true;
            state.sessions.put(&session, SESSION_TTL).await?;
            Ok(())
        }
        Err(e) => {
            session.metadata = metadata;
            session.status = UploadStatus::Failed;
            session.error = Some(e.to_string());
            let _ = state.sessions.put(&session, SESSION_TTL).await;
            Err(e)
        }
    }
}

/// Pushes every entity of a session to the ledger.
///
/// Batches run first, in ascending chunk order, the metadata entity leading
/// the first batch. When a batch exhausts its retry budget the writer
/// switches to the individual-write plan for everything still unwritten;
/// exhaustion there is terminal. Progress is persisted after every
/// successful write so status readers observe it monotonically.
async fn write_all(
    state: &AppState,
    session: &mut UploadSession,
    metadata: &mut FileMetadata,
    chunks: &mut [Chunk],
) -> Result<EntityKeyIndex> {
    let batch_size = state.config.batch_size;
    let mut index = EntityKeyIndex {
        metadata_key: None,
        chunk_keys: Vec::with_capacity(chunks.len()),
    };

    let mut batch_start = 0usize;
    let mut fell_back = false;

    while batch_start < chunks.len() {
        let batch_end = (batch_start + batch_size).min(chunks.len());
        let include_metadata = batch_start == 0;

        let mut entities = Vec::with_capacity(batch_end - batch_start + 1);
        if include_metadata {
            entities.push(EntityCreate::for_metadata(metadata)?);
        }
        entities.extend(chunks[batch_start..batch_end].iter().map(EntityCreate::for_chunk));

        let outcome = state
            .pools
            .with_write("batch entity write", RetryPolicy::BATCH, |backend| {
                let entities = entities.clone();
                async move { backend.create_entities(entities).await }
            })
            .await;

        match outcome {
            Ok(keys) => {
                let mut keys = keys.into_iter();
                if include_metadata {
                    let key = keys.next();
                    metadata.ledger_key = key.clone();
                    index.metadata_key = key;
                }
                for (chunk, key) in chunks[batch_start..batch_end].iter_mut().zip(keys) {
                    chunk.ledger_key = Some(key.clone());
                    index.chunk_keys.push(key);
                    mark_chunk_written(session, chunk.chunk_index);
                }
                session.metadata = metadata.clone();
                persist_progress(state, session).await;
                batch_start = batch_end;
            }
            Err(AppError::RetryExhausted(reason)) => {
                tracing::warn!(
                    "🪂 Batch writes for {} exhausted retries ({}), falling back to individual writes",
                    session.file_id,
                    reason
                );
                fell_back = true;
                break;
            }
            Err(e) => return Err(e),
        }
    }

    if fell_back {
        if metadata.ledger_key.is_none() {
            let key = write_single(state, EntityCreate::for_metadata(metadata)?, "metadata write")
                .await?;
            metadata.ledger_key = Some(key.clone());
            index.metadata_key = Some(key);
            session.metadata = metadata.clone();
            persist_progress(state, session).await;
        }

        for chunk in chunks.iter_mut().filter(|c| c.ledger_key.is_none()) {
            let key = write_single(state, EntityCreate::for_chunk(chunk), "chunk write").await?;
            chunk.ledger_key = Some(key.clone());
            index.chunk_keys.push(key);
            mark_chunk_written(session, chunk.chunk_index);
            persist_progress(state, session).await;
        }
    }

    Ok(index)
}

async fn write_single(state: &AppState, entity: EntityCreate, what: &str) -> Result<String> {
    let keys = state
        .pools
        .with_write(what, RetryPolicy::SINGLE, |backend| {
            let entity = entity.clone();
            async move { backend.create_entities(vec![entity]).await }
        })
        .await?;

    keys.into_iter().next().ok_or_else(|| {
        AppError::LedgerUnavailable("ledger returned no key for a single write".to_string())
    })
}

fn mark_chunk_written(session: &mut UploadSession, chunk_index: u32) {
    session.chunks_received.insert(chunk_index);
    session.chunks_uploaded_to_ledger = session.chunks_received.len() as u32;
    session.last_chunk_uploaded_at = Some(Utc::now());
}

async fn persist_progress(state: &AppState, session: &UploadSession) {
    // Progress persistence is best-effort; the writer carries the truth.
    let _ = state.sessions.put(session, SESSION_TTL).await;
}
