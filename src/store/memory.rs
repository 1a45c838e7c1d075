use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::Utc;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::models::answer::AttemptAnswer;
use crate::models::attempt::Attempt;
use crate::models::audit_log::{AuditLog, NewAuditEvent};
use crate::models::transfer::Transfer;
use crate::store::{AnswerWrite, NewTransfer, SessionStore};
use crate::ws::messages::CheckpointRequest;

/// In-memory store for single-process deployments and tests. Mirrors
/// the Postgres implementation's semantics, including the
/// check-then-commit rule on migration completion.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
    fail_migrations: AtomicBool,
}

#[derive(Default)]
struct Inner {
    attempts: HashMap<Uuid, Attempt>,
    answers: HashMap<(Uuid, i32), AttemptAnswer>,
    exam_questions: HashMap<Uuid, HashSet<i32>>,
    transfers: HashMap<Uuid, Transfer>,
    audits: Vec<AuditLog>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_attempt(&self, attempt: Attempt) {
        let mut inner = self.inner.lock().expect("memory store mutex poisoned");
        inner.attempts.insert(attempt.id, attempt);
    }

    pub fn set_exam_questions(&self, exam_id: Uuid, question_ids: impl IntoIterator<Item = i32>) {
        let mut inner = self.inner.lock().expect("memory store mutex poisoned");
        inner
            .exam_questions
            .insert(exam_id, question_ids.into_iter().collect());
    }

    pub fn attempt(&self, attempt_id: Uuid) -> Option<Attempt> {
        let inner = self.inner.lock().expect("memory store mutex poisoned");
        inner.attempts.get(&attempt_id).cloned()
    }

    pub fn answer(&self, attempt_id: Uuid, question_id: i32) -> Option<AttemptAnswer> {
        let inner = self.inner.lock().expect("memory store mutex poisoned");
        inner.answers.get(&(attempt_id, question_id)).cloned()
    }

    pub fn audit_events(&self) -> Vec<AuditLog> {
        let inner = self.inner.lock().expect("memory store mutex poisoned");
        inner.audits.clone()
    }

    /// Fault injection: make the next migration commits fail, for
    /// exercising the transfer failure path.
    pub fn fail_migrations(&self, fail: bool) {
        self.fail_migrations.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl SessionStore for MemoryStore {
    async fn get_attempt(&self, attempt_id: Uuid) -> Result<Option<Attempt>> {
        let inner = self.inner.lock().expect("memory store mutex poisoned");
        Ok(inner.attempts.get(&attempt_id).cloned())
    }

    async fn question_in_exam(&self, exam_id: Uuid, question_id: i32) -> Result<bool> {
        let inner = self.inner.lock().expect("memory store mutex poisoned");
        Ok(inner
            .exam_questions
            .get(&exam_id)
            .is_some_and(|qs| qs.contains(&question_id)))
    }

    async fn upsert_answer(
        &self,
        attempt_id: Uuid,
        request: &CheckpointRequest,
    ) -> Result<AnswerWrite> {
        let mut inner = self.inner.lock().expect("memory store mutex poisoned");
        let now = Utc::now();
        let key = (attempt_id, request.question_id);

        let write = match inner.answers.get_mut(&key) {
            Some(existing)
                if existing.client_sequence == request.sequence
                    && existing.answer.as_ref() == Some(&request.answer)
                    && existing.is_flagged == request.is_flagged =>
            {
                AnswerWrite {
                    sequence: existing.sequence,
                    saved_at: existing.last_updated_at.unwrap_or(now),
                    inserted: false,
                    retried: true,
                }
            }
            Some(existing) => {
                existing.answer = Some(request.answer.clone());
                existing.is_flagged = request.is_flagged;
                existing.time_spent_seconds += request.time_spent_seconds;
                existing.sequence += 1;
                existing.client_sequence = request.sequence;
                existing.last_updated_at = Some(now);
                AnswerWrite {
                    sequence: existing.sequence,
                    saved_at: now,
                    inserted: false,
                    retried: false,
                }
            }
            None => {
                inner.answers.insert(
                    key,
                    AttemptAnswer {
                        id: Uuid::new_v4(),
                        attempt_id,
                        question_id: request.question_id,
                        answer: Some(request.answer.clone()),
                        is_flagged: request.is_flagged,
                        time_spent_seconds: request.time_spent_seconds,
                        sequence: 1,
                        client_sequence: request.sequence,
                        first_answered_at: Some(now),
                        last_updated_at: Some(now),
                        created_at: Some(now),
                    },
                );
                AnswerWrite {
                    sequence: 1,
                    saved_at: now,
                    inserted: true,
                    retried: false,
                }
            }
        };

        if !write.retried {
            let attempt = inner
                .attempts
                .get_mut(&attempt_id)
                .ok_or_else(|| Error::NotFound("Attempt not found".to_string()))?;
            if write.inserted {
                attempt.questions_answered += 1;
            }
            attempt.current_question_id = Some(request.question_id);
            attempt.last_activity_at = Some(now);

            let mut flagged = attempt.flagged_questions();
            if request.is_flagged {
                if !flagged.contains(&request.question_id) {
                    flagged.push(request.question_id);
                }
            } else {
                flagged.retain(|q| *q != request.question_id);
            }
            attempt.questions_flagged = serde_json::to_value(&flagged)?;
        }

        Ok(write)
    }

    async fn list_answers(&self, attempt_id: Uuid) -> Result<Vec<AttemptAnswer>> {
        let inner = self.inner.lock().expect("memory store mutex poisoned");
        let mut answers: Vec<AttemptAnswer> = inner
            .answers
            .values()
            .filter(|a| a.attempt_id == attempt_id)
            .cloned()
            .collect();
        answers.sort_by_key(|a| a.question_id);
        Ok(answers)
    }

    async fn set_question_flag(
        &self,
        attempt_id: Uuid,
        question_id: i32,
        is_flagged: bool,
    ) -> Result<()> {
        let mut inner = self.inner.lock().expect("memory store mutex poisoned");
        let now = Utc::now();

        let attempt = inner
            .attempts
            .get_mut(&attempt_id)
            .ok_or_else(|| Error::NotFound("Attempt not found".to_string()))?;

        let mut flagged = attempt.flagged_questions();
        if is_flagged {
            if !flagged.contains(&question_id) {
                flagged.push(question_id);
            }
        } else {
            flagged.retain(|q| *q != question_id);
        }
        attempt.questions_flagged = serde_json::to_value(&flagged)?;
        attempt.last_activity_at = Some(now);

        if let Some(answer) = inner.answers.get_mut(&(attempt_id, question_id)) {
            answer.is_flagged = is_flagged;
            answer.last_updated_at = Some(now);
        }

        Ok(())
    }

    async fn insert_transfer(&self, transfer: NewTransfer) -> Result<Transfer> {
        let mut inner = self.inner.lock().expect("memory store mutex poisoned");
        let row = Transfer {
            id: Uuid::new_v4(),
            attempt_id: transfer.attempt_id,
            from_workstation: transfer.from_workstation,
            to_workstation: transfer.to_workstation,
            requested_by: transfer.requested_by,
            approved_by: None,
            status: "pending".to_string(),
            reason: transfer.reason,
            migration_checksum: None,
            answers_transferred: 0,
            error_message: None,
            created_at: Some(Utc::now()),
            approved_at: None,
            rejected_at: None,
            completed_at: None,
        };
        inner.transfers.insert(row.id, row.clone());
        Ok(row)
    }

    async fn get_transfer(&self, transfer_id: Uuid) -> Result<Option<Transfer>> {
        let inner = self.inner.lock().expect("memory store mutex poisoned");
        Ok(inner.transfers.get(&transfer_id).cloned())
    }

    async fn find_active_transfer(&self, attempt_id: Uuid) -> Result<Option<Transfer>> {
        let inner = self.inner.lock().expect("memory store mutex poisoned");
        Ok(inner
            .transfers
            .values()
            .find(|t| {
                t.attempt_id == attempt_id
                    && (t.status == "pending" || t.status == "approved")
            })
            .cloned())
    }

    async fn mark_transfer_approved(
        &self,
        transfer_id: Uuid,
        approver: Uuid,
    ) -> Result<Transfer> {
        let mut inner = self.inner.lock().expect("memory store mutex poisoned");
        let transfer = inner
            .transfers
            .get_mut(&transfer_id)
            .ok_or_else(|| Error::NotFound("Transfer not found".to_string()))?;
        if transfer.status != "pending" {
            return Err(Error::Conflict("Transfer is no longer pending".to_string()));
        }
        transfer.status = "approved".to_string();
        transfer.approved_by = Some(approver);
        transfer.approved_at = Some(Utc::now());
        Ok(transfer.clone())
    }

    async fn mark_transfer_rejected(
        &self,
        transfer_id: Uuid,
        approver: Uuid,
        reason: Option<String>,
    ) -> Result<Transfer> {
        let mut inner = self.inner.lock().expect("memory store mutex poisoned");
        let transfer = inner
            .transfers
            .get_mut(&transfer_id)
            .ok_or_else(|| Error::NotFound("Transfer not found".to_string()))?;
        if transfer.status != "pending" {
            return Err(Error::Conflict("Transfer is no longer pending".to_string()));
        }
        transfer.status = "rejected".to_string();
        transfer.approved_by = Some(approver);
        transfer.rejected_at = Some(Utc::now());
        transfer.error_message = reason;
        Ok(transfer.clone())
    }

    async fn mark_transfer_failed(&self, transfer_id: Uuid, error: &str) -> Result<()> {
        let mut inner = self.inner.lock().expect("memory store mutex poisoned");
        if let Some(transfer) = inner.transfers.get_mut(&transfer_id) {
            transfer.status = "failed".to_string();
            transfer.error_message = Some(error.to_string());
        }
        Ok(())
    }

    async fn complete_migration(
        &self,
        transfer_id: Uuid,
        attempt_id: Uuid,
        to_workstation: &str,
        checksum: &str,
        answers_transferred: i32,
    ) -> Result<Transfer> {
        if self.fail_migrations.load(Ordering::SeqCst) {
            return Err(Error::Internal("migration write failed".to_string()));
        }

        let mut inner = self.inner.lock().expect("memory store mutex poisoned");
        let now = Utc::now();

        let completed = {
            let transfer = inner
                .transfers
                .get_mut(&transfer_id)
                .ok_or_else(|| Error::NotFound("Transfer not found".to_string()))?;
            if transfer.status != "approved" {
                return Err(Error::Conflict(
                    "Transfer is no longer approved".to_string(),
                ));
            }
            transfer.status = "completed".to_string();
            transfer.migration_checksum = Some(checksum.to_string());
            transfer.answers_transferred = answers_transferred;
            transfer.completed_at = Some(now);
            transfer.clone()
        };

        let attempt = inner
            .attempts
            .get_mut(&attempt_id)
            .ok_or_else(|| Error::NotFound("Attempt not found".to_string()))?;
        attempt.workstation_id = Some(to_workstation.to_string());
        attempt.transfer_count += 1;
        attempt.last_activity_at = Some(now);

        Ok(completed)
    }

    async fn list_transfers(
        &self,
        attempt_id: Option<Uuid>,
        owner: Option<Uuid>,
    ) -> Result<Vec<Transfer>> {
        let inner = self.inner.lock().expect("memory store mutex poisoned");
        let mut transfers: Vec<Transfer> = inner
            .transfers
            .values()
            .filter(|t| attempt_id.map_or(true, |id| t.attempt_id == id))
            .filter(|t| {
                owner.map_or(true, |owner_id| {
                    inner
                        .attempts
                        .get(&t.attempt_id)
                        .is_some_and(|a| a.student_id == owner_id)
                })
            })
            .cloned()
            .collect();
        transfers.sort_by_key(|t| std::cmp::Reverse(t.created_at));
        Ok(transfers)
    }

    async fn expire_overdue_attempts(&self) -> Result<Vec<Uuid>> {
        let mut inner = self.inner.lock().expect("memory store mutex poisoned");
        let mut expired = Vec::new();
        for attempt in inner.attempts.values_mut() {
            if attempt.status == "in_progress" && attempt.is_expired() {
                attempt.status = "expired".to_string();
                expired.push(attempt.id);
            }
        }
        Ok(expired)
    }

    async fn insert_audit(&self, event: NewAuditEvent) -> Result<()> {
        let mut inner = self.inner.lock().expect("memory store mutex poisoned");
        inner.audits.push(AuditLog {
            id: Uuid::new_v4(),
            event_type: event.event_type,
            event_category: event.event_category,
            user_id: event.user_id,
            username: event.username,
            attempt_id: event.attempt_id,
            transfer_id: event.transfer_id,
            description: event.description,
            details: event.details,
            success: event.success,
            error_message: event.error_message,
            created_at: Some(Utc::now()),
        });
        Ok(())
    }
}
