use std::time::Duration;

use uuid::Uuid;

use blockvault::error::AppError;
use blockvault::models::session::UploadStatus;
use blockvault::services::ingestion::{self, UploadRequest};
use blockvault::services::{health, query, retrieval};
use blockvault::{AppState, Config};

struct TestContext {
    state: AppState,
}

impl TestContext {
    async fn new() -> Self {
        let mut config = Config::for_memory_mode();
        config.chunk_size = 64;
        Self {
            state: AppState::new(&config).await.unwrap(),
        }
    }

    async fn upload(&self, key: &str, filename: &str, content_type: &str, payload: &[u8]) -> Uuid {
        let accepted = ingestion::initiate_upload(
            &self.state,
            UploadRequest {
                payload: payload.to_vec(),
                filename: filename.to_string(),
                content_type: content_type.to_string(),
                owner: Some("owner-nine".to_string()),
                idempotency_key: key.to_string(),
                btl_days: Some(7),
                bypass_key: None,
                user_id: "user-nine".to_string(),
            },
        )
        .await
        .unwrap();

        for _ in 0..500 {
            let status = ingestion::upload_status(&self.state, accepted.file_id)
                .await
                .unwrap();
            match status.status {
                UploadStatus::Completed => return accepted.file_id,
                UploadStatus::Failed => panic!("upload failed: {:?}", status.error),
                UploadStatus::Uploading => {
                    tokio::time::sleep(Duration::from_millis(10)).await;
                }
            }
        }
        panic!("upload did not complete");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_multi_chunk_file_round_trips() {
        let context = TestContext::new().await;
        let payload: Vec<u8> = (0..1000u32).map(|i| (i % 251) as u8).collect();

        let file_id = context
            .upload("retrieval-key-1", "data.bin", "application/octet-stream", &payload)
            .await;

        let (bytes, metadata) = retrieval::get_file(&context.state, file_id).await.unwrap();
        assert_eq!(bytes, payload);
        assert_eq!(metadata.total_size, 1000);
        assert_eq!(metadata.chunk_count, 16);
    }

    #[tokio::test]
    async fn test_unknown_file_is_not_found() {
        let context = TestContext::new().await;
        let result = retrieval::get_file(&context.state, Uuid::new_v4()).await;
        assert!(matches!(result, Err(AppError::NotFound)));

        let info = retrieval::get_file_info(&context.state, Uuid::new_v4()).await;
        assert!(matches!(info, Err(AppError::NotFound)));
    }

    #[tokio::test]
    async fn test_file_info_reports_keys_and_expiry() {
        let context = TestContext::new().await;
        let file_id = context
            .upload("retrieval-key-2", "notes.txt", "text/plain", &[9u8; 300])
            .await;

        let info = retrieval::get_file_info(&context.state, file_id).await.unwrap();
        assert_eq!(info.file_id, file_id);
        assert_eq!(info.chunk_count, 5);
        assert_eq!(info.chunk_entity_keys.len(), 5);
        assert!(info.metadata_entity_key.is_some());
        assert_eq!(info.total_blockchain_entities, 6);
        assert!(info.expires_at > info.created_at);
        assert_eq!(info.owner.as_deref(), Some("owner-nine"));
    }

    #[tokio::test]
    async fn test_entity_keys_endpoint_matches_chunk_count() {
        let context = TestContext::new().await;
        let file_id = context
            .upload("retrieval-key-3", "photo.png", "image/png", &[3u8; 200])
            .await;

        let keys = retrieval::get_entity_keys(&context.state, file_id).await.unwrap();
        assert_eq!(keys.chunk_entity_keys.len(), 4);
        assert_eq!(keys.total_entities, 5);
    }

    #[tokio::test]
    async fn test_listings_by_owner_extension_and_type() {
        let context = TestContext::new().await;
        let older = context
            .upload("listing-key-4a", "first.txt", "text/plain", b"first file")
            .await;
        let newer = context
            .upload("listing-key-4b", "second.txt", "text/plain", b"second file")
            .await;
        context
            .upload("listing-key-4c", "image.png", "image/png", &[1u8; 32])
            .await;

        let by_owner = query::list_by_owner(&context.state, "owner-nine").await.unwrap();
        assert_eq!(by_owner.count, 3);
        let txt_positions: Vec<Uuid> = by_owner.files.iter().map(|f| f.file_id).collect();
        let older_pos = txt_positions.iter().position(|id| *id == older).unwrap();
        let newer_pos = txt_positions.iter().position(|id| *id == newer).unwrap();
        assert!(newer_pos < older_pos, "owner listing must be newest first");

        let by_extension = query::list_by_extension(&context.state, "txt").await.unwrap();
        assert!(by_extension.count >= 2);
        assert!(by_extension.files.iter().all(|f| f.file_extension == "txt"));
        assert!(by_extension.files.iter().any(|f| f.file_id == older));

        // Leading dots and case are normalized away.
        let dotted = query::list_by_extension(&context.state, ".TXT").await.unwrap();
        assert_eq!(dotted.count, by_extension.count);

        let by_type = query::list_by_content_type(&context.state, "image/png").await.unwrap();
        assert_eq!(by_type.count, 1);
        assert_eq!(by_type.files[0].content_type, "image/png");
    }

    #[tokio::test]
    async fn test_health_reports_components() {
        let context = TestContext::new().await;
        let report = health::health(&context.state).await;

        assert_eq!(report.services.database, "up");
        // No Redis in the test configuration; disabled is not degraded.
        assert_eq!(report.services.redis, "disabled");
        assert_eq!(report.status, "ok");
    }

    #[tokio::test]
    async fn test_shutdown_turns_health_degraded() {
        let context = TestContext::new().await;
        context.state.shutdown();

        let report = health::health(&context.state).await;
        assert_eq!(report.services.database, "down");
        assert_eq!(report.status, "degraded");
    }
}
