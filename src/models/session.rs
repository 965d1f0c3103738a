use std::collections::BTreeSet;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::file::FileMetadata;

/// Lifecycle state of an upload session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UploadStatus {
    Uploading,
    Completed,
    Failed,
}

/// The stateful record of one in-flight or terminal upload.
///
/// Created by the ingestion pipeline on admission and mutated only by the
/// background writer that owns it. Readers observe monotonically
/// non-decreasing progress. Serialized to the session store as JSON: the
/// chunk set as an array, dates as ISO-8601 strings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadSession {
    pub file_id: Uuid,
    pub idempotency_key: String,
    pub metadata: FileMetadata,
    /// Indices whose ledger write has succeeded.
    pub chunks_received: BTreeSet<u32>,
    pub completed: bool,
    pub status: UploadStatus,
    pub error: Option<String>,
    pub chunks_uploaded_to_ledger: u32,
    pub total_chunks: u32,
    pub started_at: DateTime<Utc>,
    pub last_chunk_uploaded_at: Option<DateTime<Utc>>,
}

impl UploadSession {
    /// Creates a fresh session in the `Uploading` state.
    pub fn new(idempotency_key: String, metadata: FileMetadata) -> Self {
        Self {
            file_id: metadata.file_id,
            idempotency_key,
            total_chunks: metadata.chunk_count,
            metadata,
            chunks_received: BTreeSet::new(),
            completed: false,
            status: UploadStatus::Uploading,
            error: None,
            chunks_uploaded_to_ledger: 0,
            started_at: Utc::now(),
            last_chunk_uploaded_at: None,
        }
    }

    /// Whether the session has reached a terminal state.
    pub fn is_terminal(&self) -> bool {
        self.status != UploadStatus::Uploading
    }

    /// Computes the progress document reported by status operations.
    pub fn progress(&self, now: DateTime<Utc>) -> UploadProgress {
        let uploaded = self.chunks_uploaded_to_ledger;
        let total = self.total_chunks;
        let remaining = total.saturating_sub(uploaded);
        let elapsed = (now - self.started_at).num_milliseconds().max(0) as f64 / 1000.0;

        let percentage = if total == 0 {
            100.0
        } else {
            (uploaded as f64 / total as f64) * 100.0
        };

        // No estimate until at least one chunk has landed.
        let estimated_remaining_seconds = if uploaded > 0 {
            Some((elapsed / uploaded as f64) * remaining as f64)
        } else {
            None
        };

        UploadProgress {
            chunks_uploaded: uploaded,
            total_chunks: total,
            percentage,
            remaining_chunks: remaining,
            elapsed_seconds: elapsed,
            estimated_remaining_seconds,
            last_chunk_uploaded_at: self.last_chunk_uploaded_at,
        }
    }
}

/// The progress object embedded in status responses.
#[derive(Debug, Clone, Serialize)]
pub struct UploadProgress {
    pub chunks_uploaded: u32,
    pub total_chunks: u32,
    pub percentage: f64,
    pub remaining_chunks: u32,
    pub elapsed_seconds: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub estimated_remaining_seconds: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_chunk_uploaded_at: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session(total_chunks: u32) -> UploadSession {
        let metadata = FileMetadata {
            file_id: Uuid::new_v4(),
            original_filename: "clip.bin".to_string(),
            content_type: "application/octet-stream".to_string(),
            file_extension: "bin".to_string(),
            total_size: total_chunks as u64 * 64,
            chunk_count: total_chunks,
            checksum: "00".repeat(32),
            created_at: Utc::now(),
            expiration_block: 9_000,
            btl_days: 7,
            ledger_key: None,
            owner: None,
        };
        UploadSession::new("progress-session-key".to_string(), metadata)
    }

    #[test]
    fn estimate_is_omitted_until_a_chunk_lands() {
        let session = session(4);
        let progress = session.progress(session.started_at + chrono::Duration::seconds(5));

        assert_eq!(progress.chunks_uploaded, 0);
        assert_eq!(progress.remaining_chunks, 4);
        assert_eq!(progress.percentage, 0.0);
        assert!(progress.estimated_remaining_seconds.is_none());
    }

    #[test]
    fn estimate_scales_with_average_chunk_time() {
        let mut session = session(4);
        session.chunks_received.extend([0, 1]);
        session.chunks_uploaded_to_ledger = 2;

        // Two chunks in ten seconds leaves two more at five seconds each.
        let progress = session.progress(session.started_at + chrono::Duration::seconds(10));
        assert_eq!(progress.percentage, 50.0);
        assert_eq!(progress.remaining_chunks, 2);
        let estimate = progress.estimated_remaining_seconds.unwrap();
        assert!((estimate - 10.0).abs() < 0.1);
    }

    #[test]
    fn serialized_record_uses_arrays_and_iso_dates() {
        let mut session = session(2);
        session.chunks_received.insert(0);

        let json = sonic_rs::to_string(&session).unwrap();
        assert!(json.contains("\"chunks_received\":[0]"));
        assert!(json.contains("\"status\":\"uploading\""));

        let decoded: UploadSession = sonic_rs::from_str(&json).unwrap();
        assert_eq!(decoded.file_id, session.file_id);
        assert!(decoded.chunks_received.contains(&0));
    }
}
