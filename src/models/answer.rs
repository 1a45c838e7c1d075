use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use sqlx::FromRow;
use uuid::Uuid;

/// Latest saved state for one question of one attempt. Unique on
/// (attempt_id, question_id); the answer payload is opaque to the core.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct AttemptAnswer {
    pub id: Uuid,
    pub attempt_id: Uuid,
    pub question_id: i32,
    pub answer: Option<JsonValue>,
    pub is_flagged: bool,
    pub time_spent_seconds: i32,
    pub sequence: i32,
    pub client_sequence: i32,
    pub first_answered_at: Option<DateTime<Utc>>,
    pub last_updated_at: Option<DateTime<Utc>>,
    pub created_at: Option<DateTime<Utc>>,
}
