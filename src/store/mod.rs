use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::Result;
use crate::models::answer::AttemptAnswer;
use crate::models::attempt::Attempt;
use crate::models::audit_log::NewAuditEvent;
use crate::models::transfer::Transfer;
use crate::ws::messages::CheckpointRequest;

pub mod memory;
pub mod postgres;

pub use memory::MemoryStore;
pub use postgres::PgSessionStore;

/// Result of an answer upsert. `retried` marks a resubmission of an
/// already-committed checkpoint (same client sequence and payload),
/// which leaves the row untouched so client retries after a dropped
/// acknowledgment never double-count time or sequence.
#[derive(Debug, Clone)]
pub struct AnswerWrite {
    pub sequence: i32,
    pub saved_at: DateTime<Utc>,
    pub inserted: bool,
    pub retried: bool,
}

#[derive(Debug, Clone)]
pub struct NewTransfer {
    pub attempt_id: Uuid,
    pub from_workstation: String,
    pub to_workstation: String,
    pub requested_by: Uuid,
    pub reason: String,
}

/// Durable-store operations the realtime core depends on. The service
/// runs against Postgres; tests run against the in-memory
/// implementation.
#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn get_attempt(&self, attempt_id: Uuid) -> Result<Option<Attempt>>;

    async fn question_in_exam(&self, exam_id: Uuid, question_id: i32) -> Result<bool>;

    /// Insert-or-update the answer row for (attempt, question) and fold
    /// the side effects into the attempt: answered count on insert,
    /// current question, flagged set, last activity. One atomic unit.
    async fn upsert_answer(
        &self,
        attempt_id: Uuid,
        request: &CheckpointRequest,
    ) -> Result<AnswerWrite>;

    async fn list_answers(&self, attempt_id: Uuid) -> Result<Vec<AttemptAnswer>>;

    async fn set_question_flag(
        &self,
        attempt_id: Uuid,
        question_id: i32,
        is_flagged: bool,
    ) -> Result<()>;

    async fn insert_transfer(&self, transfer: NewTransfer) -> Result<Transfer>;

    async fn get_transfer(&self, transfer_id: Uuid) -> Result<Option<Transfer>>;

    /// The pending or approved transfer for an attempt, if any. At most
    /// one such row may exist per attempt.
    async fn find_active_transfer(&self, attempt_id: Uuid) -> Result<Option<Transfer>>;

    async fn mark_transfer_approved(&self, transfer_id: Uuid, approver: Uuid)
        -> Result<Transfer>;

    async fn mark_transfer_rejected(
        &self,
        transfer_id: Uuid,
        approver: Uuid,
        reason: Option<String>,
    ) -> Result<Transfer>;

    async fn mark_transfer_failed(&self, transfer_id: Uuid, error: &str) -> Result<()>;

    /// Commit a migration: rebind the attempt's workstation, bump its
    /// transfer counter, and record checksum + answer count on the
    /// transfer, all-or-nothing. Requires the transfer to still be
    /// `approved`; a conflicting writer gets an error and no mutation.
    async fn complete_migration(
        &self,
        transfer_id: Uuid,
        attempt_id: Uuid,
        to_workstation: &str,
        checksum: &str,
        answers_transferred: i32,
    ) -> Result<Transfer>;

    async fn list_transfers(
        &self,
        attempt_id: Option<Uuid>,
        owner: Option<Uuid>,
    ) -> Result<Vec<Transfer>>;

    /// Flip overrun in-progress attempts to `expired`, returning the
    /// ids that changed.
    async fn expire_overdue_attempts(&self) -> Result<Vec<Uuid>>;

    async fn insert_audit(&self, event: NewAuditEvent) -> Result<()>;
}
