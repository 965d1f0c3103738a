use std::time::Duration;

use chrono::Utc;
use uuid::Uuid;

use blockvault::models::file::FileMetadata;
use blockvault::models::session::{UploadSession, UploadStatus};
use blockvault::stores::session_store::{SESSION_TTL, SessionStore};

fn session(idempotency_key: &str) -> UploadSession {
    let file_id = Uuid::new_v4();
    let metadata = FileMetadata {
        file_id,
        original_filename: "stored.txt".to_string(),
        content_type: "text/plain".to_string(),
        file_extension: "txt".to_string(),
        total_size: 128,
        chunk_count: 4,
        checksum: "ef".repeat(32),
        created_at: Utc::now(),
        expiration_block: 9_000,
        btl_days: 7,
        ledger_key: None,
        owner: None,
    };
    UploadSession::new(idempotency_key.to_string(), metadata)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_fallback_round_trip() {
        // No Redis configured: the in-process mirror is authoritative.
        let store = SessionStore::new(None);
        let session = session("fallback-round-trip");

        store.put(&session, SESSION_TTL).await.unwrap();

        let by_key = store.get("fallback-round-trip").await.unwrap();
        assert_eq!(by_key.file_id, session.file_id);
        assert_eq!(by_key.status, UploadStatus::Uploading);

        let by_file_id = store.get_by_file_id(session.file_id).await.unwrap();
        assert_eq!(by_file_id.idempotency_key, "fallback-round-trip");
    }

    #[tokio::test]
    async fn test_missing_keys_return_none() {
        let store = SessionStore::new(None);
        assert!(store.get("never-stored-key").await.is_none());
        assert!(store.get_by_file_id(Uuid::new_v4()).await.is_none());
    }

    #[tokio::test]
    async fn test_put_overwrites_with_latest_progress() {
        let store = SessionStore::new(None);
        let mut session = session("fallback-progress");
        store.put(&session, SESSION_TTL).await.unwrap();

        session.chunks_received.extend([0, 1, 2]);
        session.chunks_uploaded_to_ledger = 3;
        session.status = UploadStatus::Completed;
        session.completed = true;
        store.put(&session, SESSION_TTL).await.unwrap();

        let read = store.get("fallback-progress").await.unwrap();
        assert_eq!(read.chunks_uploaded_to_ledger, 3);
        assert_eq!(read.status, UploadStatus::Completed);
        assert_eq!(read.chunks_received.len(), 3);
    }

    #[tokio::test]
    async fn test_expired_entries_are_not_returned() {
        let store = SessionStore::new(None);
        let session = session("fallback-expired");
        store.put(&session, Duration::from_millis(0)).await.unwrap();

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(store.get("fallback-expired").await.is_none());
        assert!(store.get_by_file_id(session.file_id).await.is_none());
    }

    #[tokio::test]
    async fn test_delete_removes_both_key_families() {
        let store = SessionStore::new(None);
        let session = session("fallback-delete");
        store.put(&session, SESSION_TTL).await.unwrap();

        store.delete("fallback-delete").await;
        assert!(store.get("fallback-delete").await.is_none());
        assert!(store.get_by_file_id(session.file_id).await.is_none());
    }

    #[tokio::test]
    async fn test_scan_lists_live_sessions() {
        let store = SessionStore::new(None);
        store.put(&session("scan-first"), SESSION_TTL).await.unwrap();
        store.put(&session("scan-second"), SESSION_TTL).await.unwrap();
        store
            .put(&session("scan-expired"), Duration::from_millis(0))
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(10)).await;
        let mut keys: Vec<String> = store
            .scan_sessions()
            .await
            .into_iter()
            .map(|s| s.idempotency_key)
            .collect();
        keys.sort();

        assert_eq!(keys, vec!["scan-first", "scan-second"]);
    }
}
