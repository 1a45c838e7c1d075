use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// A supervised workstation transfer for an in-progress attempt.
///
/// Lifecycle: pending -> approved -> completed | failed, or
/// pending -> rejected. Terminal rows are never mutated again.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Transfer {
    pub id: Uuid,
    pub attempt_id: Uuid,
    pub from_workstation: String,
    pub to_workstation: String,
    pub requested_by: Uuid,
    pub approved_by: Option<Uuid>,
    pub status: String,
    pub reason: String,
    pub migration_checksum: Option<String>,
    pub answers_transferred: i32,
    pub error_message: Option<String>,
    pub created_at: Option<DateTime<Utc>>,
    pub approved_at: Option<DateTime<Utc>>,
    pub rejected_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Transfer {
    pub fn is_terminal(&self) -> bool {
        matches!(self.status.as_str(), "completed" | "rejected" | "failed")
    }
}
