use async_trait::async_trait;
use chrono::Utc;
use sqlx::PgPool;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::models::answer::AttemptAnswer;
use crate::models::attempt::Attempt;
use crate::models::audit_log::NewAuditEvent;
use crate::models::transfer::Transfer;
use crate::store::{AnswerWrite, NewTransfer, SessionStore};
use crate::ws::messages::CheckpointRequest;

#[derive(Clone)]
pub struct PgSessionStore {
    pool: PgPool,
}

impl PgSessionStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl SessionStore for PgSessionStore {
    async fn get_attempt(&self, attempt_id: Uuid) -> Result<Option<Attempt>> {
        let attempt = sqlx::query_as::<_, Attempt>(r#"SELECT * FROM attempts WHERE id = $1"#)
            .bind(attempt_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(attempt)
    }

    async fn question_in_exam(&self, exam_id: Uuid, question_id: i32) -> Result<bool> {
        let exists: bool = sqlx::query_scalar(
            r#"SELECT EXISTS(SELECT 1 FROM exam_questions WHERE exam_id = $1 AND question_id = $2)"#,
        )
        .bind(exam_id)
        .bind(question_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(exists)
    }

    async fn upsert_answer(
        &self,
        attempt_id: Uuid,
        request: &CheckpointRequest,
    ) -> Result<AnswerWrite> {
        let mut tx = self.pool.begin().await?;

        // Attempt row first, answer row second; all writers take locks
        // in this order.
        let attempt =
            sqlx::query_as::<_, Attempt>(r#"SELECT * FROM attempts WHERE id = $1 FOR UPDATE"#)
                .bind(attempt_id)
                .fetch_one(&mut *tx)
                .await?;

        let existing = sqlx::query_as::<_, AttemptAnswer>(
            r#"SELECT * FROM attempt_answers WHERE attempt_id = $1 AND question_id = $2 FOR UPDATE"#,
        )
        .bind(attempt_id)
        .bind(request.question_id)
        .fetch_optional(&mut *tx)
        .await?;

        let now = Utc::now();
        let write = match existing {
            Some(existing)
                if existing.client_sequence == request.sequence
                    && existing.answer.as_ref() == Some(&request.answer)
                    && existing.is_flagged == request.is_flagged =>
            {
                // Client retry after a dropped ack; the commit already
                // happened.
                AnswerWrite {
                    sequence: existing.sequence,
                    saved_at: existing.last_updated_at.unwrap_or(now),
                    inserted: false,
                    retried: true,
                }
            }
            Some(existing) => {
                let sequence = existing.sequence + 1;
                sqlx::query(
                    r#"
                    UPDATE attempt_answers
                    SET answer = $1,
                        is_flagged = $2,
                        time_spent_seconds = time_spent_seconds + $3,
                        sequence = $4,
                        client_sequence = $5,
                        last_updated_at = $6
                    WHERE id = $7
                    "#,
                )
                .bind(&request.answer)
                .bind(request.is_flagged)
                .bind(request.time_spent_seconds)
                .bind(sequence)
                .bind(request.sequence)
                .bind(now)
                .bind(existing.id)
                .execute(&mut *tx)
                .await?;

                AnswerWrite {
                    sequence,
                    saved_at: now,
                    inserted: false,
                    retried: false,
                }
            }
            None => {
                sqlx::query(
                    r#"
                    INSERT INTO attempt_answers (
                        attempt_id, question_id, answer, is_flagged,
                        time_spent_seconds, sequence, client_sequence,
                        first_answered_at, last_updated_at
                    ) VALUES ($1, $2, $3, $4, $5, 1, $6, $7, $7)
                    "#,
                )
                .bind(attempt_id)
                .bind(request.question_id)
                .bind(&request.answer)
                .bind(request.is_flagged)
                .bind(request.time_spent_seconds)
                .bind(request.sequence)
                .bind(now)
                .execute(&mut *tx)
                .await?;

                AnswerWrite {
                    sequence: 1,
                    saved_at: now,
                    inserted: true,
                    retried: false,
                }
            }
        };

        if !write.retried {
            let mut flagged = attempt.flagged_questions();
            if request.is_flagged {
                if !flagged.contains(&request.question_id) {
                    flagged.push(request.question_id);
                }
            } else {
                flagged.retain(|q| *q != request.question_id);
            }

            let answered_delta = if write.inserted { 1 } else { 0 };
            sqlx::query(
                r#"
                UPDATE attempts
                SET questions_answered = questions_answered + $1,
                    current_question_id = $2,
                    questions_flagged = $3,
                    last_activity_at = $4,
                    updated_at = $4
                WHERE id = $5
                "#,
            )
            .bind(answered_delta)
            .bind(request.question_id)
            .bind(serde_json::to_value(&flagged)?)
            .bind(now)
            .bind(attempt_id)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(write)
    }

    async fn list_answers(&self, attempt_id: Uuid) -> Result<Vec<AttemptAnswer>> {
        let answers = sqlx::query_as::<_, AttemptAnswer>(
            r#"SELECT * FROM attempt_answers WHERE attempt_id = $1 ORDER BY question_id"#,
        )
        .bind(attempt_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(answers)
    }

    async fn set_question_flag(
        &self,
        attempt_id: Uuid,
        question_id: i32,
        is_flagged: bool,
    ) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        let attempt =
            sqlx::query_as::<_, Attempt>(r#"SELECT * FROM attempts WHERE id = $1 FOR UPDATE"#)
                .bind(attempt_id)
                .fetch_one(&mut *tx)
                .await?;

        let mut flagged = attempt.flagged_questions();
        if is_flagged {
            if !flagged.contains(&question_id) {
                flagged.push(question_id);
            }
        } else {
            flagged.retain(|q| *q != question_id);
        }

        sqlx::query(
            r#"UPDATE attempts SET questions_flagged = $1, last_activity_at = $2, updated_at = $2 WHERE id = $3"#,
        )
        .bind(serde_json::to_value(&flagged)?)
        .bind(Utc::now())
        .bind(attempt_id)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"UPDATE attempt_answers SET is_flagged = $1, last_updated_at = $2 WHERE attempt_id = $3 AND question_id = $4"#,
        )
        .bind(is_flagged)
        .bind(Utc::now())
        .bind(attempt_id)
        .bind(question_id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn insert_transfer(&self, transfer: NewTransfer) -> Result<Transfer> {
        let row = sqlx::query_as::<_, Transfer>(
            r#"
            INSERT INTO transfers (attempt_id, from_workstation, to_workstation, requested_by, status, reason)
            VALUES ($1, $2, $3, $4, 'pending', $5)
            RETURNING *
            "#,
        )
        .bind(transfer.attempt_id)
        .bind(&transfer.from_workstation)
        .bind(&transfer.to_workstation)
        .bind(transfer.requested_by)
        .bind(&transfer.reason)
        .fetch_one(&self.pool)
        .await?;
        Ok(row)
    }

    async fn get_transfer(&self, transfer_id: Uuid) -> Result<Option<Transfer>> {
        let transfer = sqlx::query_as::<_, Transfer>(r#"SELECT * FROM transfers WHERE id = $1"#)
            .bind(transfer_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(transfer)
    }

    async fn find_active_transfer(&self, attempt_id: Uuid) -> Result<Option<Transfer>> {
        let transfer = sqlx::query_as::<_, Transfer>(
            r#"
            SELECT * FROM transfers
            WHERE attempt_id = $1 AND status IN ('pending', 'approved')
            ORDER BY created_at DESC
            LIMIT 1
            "#,
        )
        .bind(attempt_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(transfer)
    }

    async fn mark_transfer_approved(
        &self,
        transfer_id: Uuid,
        approver: Uuid,
    ) -> Result<Transfer> {
        let row = sqlx::query_as::<_, Transfer>(
            r#"
            UPDATE transfers
            SET status = 'approved', approved_by = $1, approved_at = $2
            WHERE id = $3 AND status = 'pending'
            RETURNING *
            "#,
        )
        .bind(approver)
        .bind(Utc::now())
        .bind(transfer_id)
        .fetch_optional(&self.pool)
        .await?;

        row.ok_or_else(|| Error::Conflict("Transfer is no longer pending".to_string()))
    }

    async fn mark_transfer_rejected(
        &self,
        transfer_id: Uuid,
        approver: Uuid,
        reason: Option<String>,
    ) -> Result<Transfer> {
        let row = sqlx::query_as::<_, Transfer>(
            r#"
            UPDATE transfers
            SET status = 'rejected', approved_by = $1, rejected_at = $2, error_message = $3
            WHERE id = $4 AND status = 'pending'
            RETURNING *
            "#,
        )
        .bind(approver)
        .bind(Utc::now())
        .bind(reason)
        .bind(transfer_id)
        .fetch_optional(&self.pool)
        .await?;

        row.ok_or_else(|| Error::Conflict("Transfer is no longer pending".to_string()))
    }

    async fn mark_transfer_failed(&self, transfer_id: Uuid, error: &str) -> Result<()> {
        sqlx::query(r#"UPDATE transfers SET status = 'failed', error_message = $1 WHERE id = $2"#)
            .bind(error)
            .bind(transfer_id)
            .execute(&self.pool)
            .await?;
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
        let mut tx = self.pool.begin().await?;
        let now = Utc::now();

        // Check-then-commit: the completion write requires the row to
        // still be approved, so a racing writer rolls back cleanly.
        let row = sqlx::query_as::<_, Transfer>(
            r#"
            UPDATE transfers
            SET status = 'completed', migration_checksum = $1, answers_transferred = $2, completed_at = $3
            WHERE id = $4 AND status = 'approved'
            RETURNING *
            "#,
        )
        .bind(checksum)
        .bind(answers_transferred)
        .bind(now)
        .bind(transfer_id)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(transfer) = row else {
            return Err(Error::Conflict(
                "Transfer is no longer approved".to_string(),
            ));
        };

        sqlx::query(
            r#"
            UPDATE attempts
            SET workstation_id = $1,
                transfer_count = transfer_count + 1,
                last_activity_at = $2,
                updated_at = $2
            WHERE id = $3
            "#,
        )
        .bind(to_workstation)
        .bind(now)
        .bind(attempt_id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(transfer)
    }

    async fn list_transfers(
        &self,
        attempt_id: Option<Uuid>,
        owner: Option<Uuid>,
    ) -> Result<Vec<Transfer>> {
        let transfers = sqlx::query_as::<_, Transfer>(
            r#"
            SELECT t.* FROM transfers t
            JOIN attempts a ON t.attempt_id = a.id
            WHERE ($1::uuid IS NULL OR t.attempt_id = $1)
              AND ($2::uuid IS NULL OR a.student_id = $2)
            ORDER BY t.created_at DESC
            "#,
        )
        .bind(attempt_id)
        .bind(owner)
        .fetch_all(&self.pool)
        .await?;
        Ok(transfers)
    }

    async fn expire_overdue_attempts(&self) -> Result<Vec<Uuid>> {
        let ids: Vec<Uuid> = sqlx::query_scalar(
            r#"
            UPDATE attempts
            SET status = 'expired', updated_at = NOW()
            WHERE status = 'in_progress'
              AND started_at IS NOT NULL
              AND started_at + make_interval(mins => duration_minutes) < NOW()
            RETURNING id
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(ids)
    }

    async fn insert_audit(&self, event: NewAuditEvent) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO audit_logs (
                event_type, event_category, user_id, username,
                attempt_id, transfer_id, description, details,
                success, error_message
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            "#,
        )
        .bind(&event.event_type)
        .bind(&event.event_category)
        .bind(event.user_id)
        .bind(&event.username)
        .bind(event.attempt_id)
        .bind(event.transfer_id)
        .bind(&event.description)
        .bind(&event.details)
        .bind(event.success)
        .bind(&event.error_message)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
