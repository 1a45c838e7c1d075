use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use sqlx::FromRow;
use uuid::Uuid;

/// One student's timed instance of taking one exam. The realtime core
/// never creates or deletes attempts; it reads status and timing and
/// mutates the workstation binding and flagged-question set.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Attempt {
    pub id: Uuid,
    pub student_id: Uuid,
    pub exam_id: Uuid,
    pub status: String,
    pub started_at: Option<DateTime<Utc>>,
    pub submitted_at: Option<DateTime<Utc>>,
    pub duration_minutes: i32,
    pub workstation_id: Option<String>,
    pub initial_workstation_id: Option<String>,
    pub transfer_count: i32,
    pub current_question_id: Option<i32>,
    pub questions_answered: i32,
    pub questions_flagged: JsonValue,
    pub last_activity_at: Option<DateTime<Utc>>,
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
}

impl Attempt {
    pub fn is_in_progress(&self) -> bool {
        self.status == "in_progress"
    }

    /// An attempt is expired once its wall-clock duration has run out
    /// while it was still open.
    pub fn is_expired(&self) -> bool {
        if self.status != "in_progress" && self.status != "not_started" {
            return false;
        }
        let Some(started_at) = self.started_at else {
            return false;
        };
        let elapsed = Utc::now() - started_at;
        elapsed.num_seconds() > i64::from(self.duration_minutes) * 60
    }

    /// Remaining time is always derived from the start timestamp so the
    /// clock keeps running through workstation transfers.
    pub fn remaining_seconds(&self) -> i64 {
        if self.status == "submitted" || self.status == "graded" {
            return 0;
        }
        let total = i64::from(self.duration_minutes) * 60;
        let Some(started_at) = self.started_at else {
            return total;
        };
        let elapsed = (Utc::now() - started_at).num_seconds();
        (total - elapsed).max(0)
    }

    pub fn elapsed_seconds(&self) -> i64 {
        i64::from(self.duration_minutes) * 60 - self.remaining_seconds()
    }

    pub fn flagged_questions(&self) -> Vec<i32> {
        serde_json::from_value(self.questions_flagged.clone()).unwrap_or_default()
    }
}
