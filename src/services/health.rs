use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::time::timeout;

use crate::state::AppState;

/// Deadline for each component probe.
const PROBE_DEADLINE: Duration = Duration::from_secs(3);

/// Per-component availability.
#[derive(Debug, Clone, Serialize)]
pub struct ServiceHealth {
    pub database: &'static str,
    pub redis: &'static str,
}

/// The health document. Reachability and correctness are reported
/// separately: the operation itself never fails, degradation lives in the
/// body.
#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub status: &'static str,
    pub timestamp: DateTime<Utc>,
    pub services: ServiceHealth,
}

/// Probes the ledger and Redis and reports component status.
pub async fn health(state: &AppState) -> HealthReport {
    let database = match timeout(PROBE_DEADLINE, state.pools.current_block()).await {
        Ok(Ok(_)) => "up",
        Ok(Err(e)) => {
            tracing::warn!("Health probe: ledger down: {}", e);
            "down"
        }
        Err(_) => {
            tracing::warn!("Health probe: ledger timed out");
            "down"
        }
    };

    let redis = match &state.redis {
        Some(redis) => {
            let probe = async {
                let mut conn = redis.clone();
                let pong: String = redis::cmd("PING").query_async(&mut conn).await?;
                Ok::<_, redis::RedisError>(pong)
            };
            match timeout(PROBE_DEADLINE, probe).await {
                Ok(Ok(_)) => "up",
                _ => "down",
            }
        }
        None => "disabled",
    };

    let status = if database == "up" && redis != "down" {
        "ok"
    } else {
        "degraded"
    };

    HealthReport {
        status,
        timestamp: Utc::now(),
        services: ServiceHealth { database, redis },
    }
}
