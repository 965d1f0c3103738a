use serde::{Deserialize, Serialize};

/// Per-user, per-day usage counters.
///
/// `uploads_today` resets when `date` changes; `used_bytes` is date-scoped
/// and monotonically non-decreasing within a day.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuotaRecord {
    pub user_id: String,
    pub used_bytes: u64,
    pub uploads_today: u32,
    /// ISO calendar date, `YYYY-MM-DD`.
    pub date: String,
}

impl QuotaRecord {
    /// Creates an empty record for the given user and date.
    pub fn empty(user_id: &str, date: &str) -> Self {
        Self {
            user_id: user_id.to_string(),
            used_bytes: 0,
            uploads_today: 0,
            date: date.to_string(),
        }
    }
}

/// The usage document returned by the quota status operation.
#[derive(Debug, Clone, Serialize)]
pub struct QuotaStatus {
    pub used_bytes: u64,
    pub max_bytes: u64,
    pub uploads_today: u32,
    pub max_uploads_per_day: u32,
    pub usage_percentage: f64,
}
