use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttemptTimeResponse {
    pub attempt_id: Uuid,
    pub status: String,
    pub server_time: DateTime<Utc>,
    pub time_remaining_seconds: i64,
    pub elapsed_seconds: i64,
    pub is_expired: bool,
}
