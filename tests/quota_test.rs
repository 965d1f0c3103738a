use blockvault::error::AppError;
use blockvault::services::ingestion::{self, UploadRequest};
use blockvault::{AppState, Config};

struct TestContext {
    state: AppState,
}

impl TestContext {
    async fn with_config(config: Config) -> Self {
        Self {
            state: AppState::new(&config).await.unwrap(),
        }
    }

    fn request(key: &str, payload: &[u8], bypass: Option<&str>) -> UploadRequest {
        UploadRequest {
            payload: payload.to_vec(),
            filename: "quota.txt".to_string(),
            content_type: "text/plain".to_string(),
            owner: None,
            idempotency_key: key.to_string(),
            btl_days: Some(1),
            bypass_key: bypass.map(|s| s.to_string()),
            user_id: "user-quota".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_byte_ceiling_denies_and_leaves_usage_unchanged() {
        let mut config = Config::for_memory_mode();
        config.free_tier_max_bytes = 1024;
        let context = TestContext::with_config(config).await;

        // 900 of 1024 bytes used.
        ingestion::initiate_upload(
            &context.state,
            TestContext::request("quota-key-1a", &vec![0u8; 900], None),
        )
        .await
        .unwrap();

        let before = context.state.quota.status("user-quota").await;
        assert_eq!(before.used_bytes, 900);
        assert_eq!(before.uploads_today, 1);

        // 200 more would cross the ceiling.
        let denied = ingestion::initiate_upload(
            &context.state,
            TestContext::request("quota-key-1b", &vec![0u8; 200], None),
        )
        .await;
        match denied {
            Err(e @ AppError::QuotaExceeded(_)) => assert_eq!(e.code(), "QUOTA_EXCEEDED"),
            other => panic!("expected QuotaExceeded, got {:?}", other.map(|_| ())),
        }

        let after = context.state.quota.status("user-quota").await;
        assert_eq!(after.used_bytes, 900);
        assert_eq!(after.uploads_today, 1);
    }

    #[tokio::test]
    async fn test_usage_accumulates_monotonically() {
        let context = TestContext::with_config(Config::for_memory_mode()).await;

        ingestion::initiate_upload(
            &context.state,
            TestContext::request("quota-key-2a", &vec![0u8; 100], None),
        )
        .await
        .unwrap();
        let first = context.state.quota.status("user-quota").await;

        ingestion::initiate_upload(
            &context.state,
            TestContext::request("quota-key-2b", &vec![0u8; 150], None),
        )
        .await
        .unwrap();
        let second = context.state.quota.status("user-quota").await;

        assert_eq!(first.used_bytes, 100);
        assert_eq!(second.used_bytes, 250);
        assert!(second.uploads_today > first.uploads_today);
        assert_eq!(second.uploads_today, 2);
    }

    #[tokio::test]
    async fn test_daily_upload_count_ceiling() {
        let mut config = Config::for_memory_mode();
        config.free_tier_max_uploads_per_day = 1;
        let context = TestContext::with_config(config).await;

        ingestion::initiate_upload(
            &context.state,
            TestContext::request("quota-key-3a", b"first upload", None),
        )
        .await
        .unwrap();

        let denied = ingestion::initiate_upload(
            &context.state,
            TestContext::request("quota-key-3b", b"second upload", None),
        )
        .await;
        assert!(matches!(denied, Err(AppError::QuotaExceeded(_))));
    }

    #[tokio::test]
    async fn test_bypass_key_skips_quota() {
        let mut config = Config::for_memory_mode();
        config.free_tier_max_uploads_per_day = 0;
        config.unlimited_bypass_key = Some("trusted-bypass-secret".to_string());
        let context = TestContext::with_config(config).await;

        // Without the key nothing gets through at all.
        let denied = ingestion::initiate_upload(
            &context.state,
            TestContext::request("quota-key-4a", b"blocked", None),
        )
        .await;
        assert!(matches!(denied, Err(AppError::QuotaExceeded(_))));

        // A wrong key does not bypass.
        let denied = ingestion::initiate_upload(
            &context.state,
            TestContext::request("quota-key-4b", b"blocked", Some("wrong-secret")),
        )
        .await;
        assert!(matches!(denied, Err(AppError::QuotaExceeded(_))));

        let allowed = ingestion::initiate_upload(
            &context.state,
            TestContext::request("quota-key-4c", b"waved through", Some("trusted-bypass-secret")),
        )
        .await;
        assert!(allowed.is_ok());
    }

    #[tokio::test]
    async fn test_usage_percentage() {
        let mut config = Config::for_memory_mode();
        config.free_tier_max_bytes = 1000;
        let context = TestContext::with_config(config).await;

        ingestion::initiate_upload(
            &context.state,
            TestContext::request("quota-key-5", &vec![0u8; 250], None),
        )
        .await
        .unwrap();

        let status = context.state.quota.status("user-quota").await;
        assert_eq!(status.max_bytes, 1000);
        assert!((status.usage_percentage - 25.0).abs() < f64::EPSILON);
    }
}
