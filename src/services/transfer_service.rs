use std::sync::Arc;

use serde::Serialize;
use serde_json::{json, Value as JsonValue};
use sha2::{Digest, Sha256};
use tracing::{error, info};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::middleware::auth::Actor;
use crate::models::answer::AttemptAnswer;
use crate::models::attempt::Attempt;
use crate::models::transfer::Transfer;
use crate::services::audit_service::AuditService;
use crate::services::broadcast::{attempt_topic, BroadcastBridge};
use crate::store::{NewTransfer, SessionStore};
use crate::ws::messages::ServerMessage;

/// Canonical snapshot of everything a transfer migrates. The checksum
/// over its serialized form proves post-transfer integrity.
#[derive(Serialize)]
struct MigrationSnapshot<'a> {
    attempt_id: Uuid,
    from_workstation: &'a str,
    to_workstation: &'a str,
    current_question_id: Option<i32>,
    questions_answered: i32,
    questions_flagged: Vec<i32>,
    time_remaining_seconds: i64,
    answers: Vec<MigratedAnswer<'a>>,
}

#[derive(Serialize)]
struct MigratedAnswer<'a> {
    question_id: i32,
    answer: Option<&'a JsonValue>,
    is_flagged: bool,
    time_spent_seconds: i32,
    sequence: i32,
}

/// Supervised movement of a live attempt between workstations.
///
/// Lifecycle: pending -(approve)-> approved -(migrate ok)-> completed,
/// approved -(migrate fails)-> failed, pending -(reject)-> rejected.
#[derive(Clone)]
pub struct TransferService {
    store: Arc<dyn SessionStore>,
    audit: AuditService,
    bridge: Arc<dyn BroadcastBridge>,
    min_remaining_minutes: i64,
}

impl TransferService {
    pub fn new(
        store: Arc<dyn SessionStore>,
        audit: AuditService,
        bridge: Arc<dyn BroadcastBridge>,
        min_remaining_minutes: i64,
    ) -> Self {
        Self {
            store,
            audit,
            bridge,
            min_remaining_minutes,
        }
    }

    /// Validate and record a transfer request. Nothing is persisted
    /// unless every check holds.
    pub async fn create_request(
        &self,
        actor: &Actor,
        attempt_id: Uuid,
        to_workstation: &str,
        reason: &str,
    ) -> Result<Transfer> {
        let attempt = self
            .store
            .get_attempt(attempt_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("Attempt {} not found", attempt_id)))?;

        if !attempt.is_in_progress() {
            return Err(Error::Conflict(format!(
                "Attempt must be in_progress, current status: {}",
                attempt.status
            )));
        }
        if attempt.is_expired() {
            return Err(Error::Conflict("Attempt has expired".to_string()));
        }

        let remaining = attempt.remaining_seconds();
        if remaining < self.min_remaining_minutes * 60 {
            return Err(Error::Conflict(format!(
                "Insufficient time remaining for transfer. Minimum {} minutes required.",
                self.min_remaining_minutes
            )));
        }

        let is_owner = attempt.student_id == actor.id;
        if !is_owner && !actor.is_staff() {
            return Err(Error::Forbidden(
                "User not authorized to request transfer for this attempt".to_string(),
            ));
        }

        if let Some(existing) = self.store.find_active_transfer(attempt_id).await? {
            return Err(Error::Conflict(format!(
                "Transfer already {} (Transfer ID: {})",
                if existing.status == "pending" {
                    "pending"
                } else {
                    "in progress"
                },
                existing.id
            )));
        }

        let from_workstation = attempt
            .workstation_id
            .clone()
            .unwrap_or_else(|| "UNKNOWN".to_string());
        if from_workstation == to_workstation {
            return Err(Error::BadRequest(
                "Target workstation must be different from current workstation".to_string(),
            ));
        }

        let transfer = self
            .store
            .insert_transfer(NewTransfer {
                attempt_id,
                from_workstation: from_workstation.clone(),
                to_workstation: to_workstation.to_string(),
                requested_by: actor.id,
                reason: reason.to_string(),
            })
            .await?;

        self.audit
            .log(
                "transfer_requested",
                "transfer",
                Some(actor.id),
                Some(actor.username.clone()),
                Some(attempt_id),
                Some(transfer.id),
                format!(
                    "Transfer requested from {} to {}",
                    from_workstation, to_workstation
                ),
                Some(json!({
                    "from_workstation": from_workstation,
                    "to_workstation": to_workstation,
                    "reason": reason,
                    "time_remaining_seconds": remaining,
                })),
            )
            .await?;

        self.publish(
            attempt_id,
            ServerMessage::TransferRequested {
                transfer_id: transfer.id,
                attempt_id,
                from_workstation: transfer.from_workstation.clone(),
                to_workstation: transfer.to_workstation.clone(),
                reason: transfer.reason.clone(),
                requested_by: actor.username.clone(),
            },
        )
        .await;

        info!(transfer_id = %transfer.id, %attempt_id, "transfer requested");
        Ok(transfer)
    }

    /// Approve a pending transfer and run the state migration. On
    /// migration failure the transfer ends `failed` and the attempt's
    /// workstation binding is left untouched.
    pub async fn approve(&self, actor: &Actor, transfer_id: Uuid) -> Result<Transfer> {
        let transfer = self
            .store
            .get_transfer(transfer_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("Transfer {} not found", transfer_id)))?;

        if transfer.status != "pending" {
            return Err(Error::Conflict(format!(
                "Transfer must be pending, current status: {}",
                transfer.status
            )));
        }
        if !actor.is_supervisor() {
            return Err(Error::Forbidden(
                "Only the hall in-charge can approve transfers".to_string(),
            ));
        }
        if transfer.requested_by == actor.id {
            return Err(Error::Forbidden(
                "Transfer approval requires a supervisor distinct from the requester".to_string(),
            ));
        }

        let transfer = self
            .store
            .mark_transfer_approved(transfer_id, actor.id)
            .await?;

        self.audit
            .log(
                "transfer_approved",
                "transfer",
                Some(actor.id),
                Some(actor.username.clone()),
                Some(transfer.attempt_id),
                Some(transfer.id),
                format!("Transfer approved by {}", actor.username),
                Some(json!({
                    "from_workstation": transfer.from_workstation,
                    "to_workstation": transfer.to_workstation,
                })),
            )
            .await?;

        // Source UI locks input on this event before migration runs.
        self.publish(
            transfer.attempt_id,
            ServerMessage::TransferApproved {
                transfer_id: transfer.id,
                attempt_id: transfer.attempt_id,
                from_workstation: transfer.from_workstation.clone(),
                to_workstation: transfer.to_workstation.clone(),
                approved_by: actor.username.clone(),
            },
        )
        .await;

        match self.migrate(&transfer).await {
            Ok(completed) => {
                self.audit
                    .log(
                        "transfer_completed",
                        "transfer",
                        Some(actor.id),
                        Some(actor.username.clone()),
                        Some(completed.attempt_id),
                        Some(completed.id),
                        format!(
                            "Attempt state migrated from {} to {}",
                            completed.from_workstation, completed.to_workstation
                        ),
                        Some(json!({
                            "from_workstation": completed.from_workstation,
                            "to_workstation": completed.to_workstation,
                            "migration_checksum": completed.migration_checksum,
                            "answers_transferred": completed.answers_transferred,
                        })),
                    )
                    .await?;

                self.publish(
                    completed.attempt_id,
                    ServerMessage::TransferCompleted {
                        transfer_id: completed.id,
                        attempt_id: completed.attempt_id,
                        to_workstation: completed.to_workstation.clone(),
                        migration_checksum: completed
                            .migration_checksum
                            .clone()
                            .unwrap_or_default(),
                        answers_transferred: completed.answers_transferred,
                    },
                )
                .await;

                info!(
                    transfer_id = %completed.id,
                    attempt_id = %completed.attempt_id,
                    answers = completed.answers_transferred,
                    "transfer completed"
                );
                Ok(completed)
            }
            Err(e) => {
                let message = e.to_string();
                error!(transfer_id = %transfer.id, error = %message, "transfer migration failed");

                self.store
                    .mark_transfer_failed(transfer.id, &message)
                    .await?;
                if let Err(audit_err) = self
                    .audit
                    .log_failure(
                        "transfer_failed",
                        "transfer",
                        Some(actor.id),
                        Some(actor.username.clone()),
                        Some(transfer.attempt_id),
                        Some(transfer.id),
                        "Transfer state migration failed".to_string(),
                        message.clone(),
                    )
                    .await
                {
                    error!(error = %audit_err, "failed to audit transfer failure");
                }

                Err(Error::Internal(format!("State migration failed: {}", message)))
            }
        }
    }

    /// Reject a pending transfer. Terminal; the attempt is never
    /// touched.
    pub async fn reject(
        &self,
        actor: &Actor,
        transfer_id: Uuid,
        reason: Option<String>,
    ) -> Result<Transfer> {
        let transfer = self
            .store
            .get_transfer(transfer_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("Transfer {} not found", transfer_id)))?;

        if transfer.status != "pending" {
            return Err(Error::Conflict(format!(
                "Transfer must be pending, current status: {}",
                transfer.status
            )));
        }
        if !actor.is_supervisor() {
            return Err(Error::Forbidden(
                "Only the hall in-charge can reject transfers".to_string(),
            ));
        }

        let transfer = self
            .store
            .mark_transfer_rejected(transfer_id, actor.id, reason.clone())
            .await?;

        self.audit
            .log(
                "transfer_rejected",
                "transfer",
                Some(actor.id),
                Some(actor.username.clone()),
                Some(transfer.attempt_id),
                Some(transfer.id),
                format!("Transfer rejected by {}", actor.username),
                Some(json!({
                    "from_workstation": transfer.from_workstation,
                    "to_workstation": transfer.to_workstation,
                    "reason": reason,
                })),
            )
            .await?;

        self.publish(
            transfer.attempt_id,
            ServerMessage::TransferRejected {
                transfer_id: transfer.id,
                attempt_id: transfer.attempt_id,
                reason,
            },
        )
        .await;

        Ok(transfer)
    }

    pub async fn get(&self, actor: &Actor, transfer_id: Uuid) -> Result<Transfer> {
        let transfer = self
            .store
            .get_transfer(transfer_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("Transfer {} not found", transfer_id)))?;

        if actor.is_staff() || transfer.requested_by == actor.id {
            return Ok(transfer);
        }
        let owns_attempt = self
            .store
            .get_attempt(transfer.attempt_id)
            .await?
            .is_some_and(|a| a.student_id == actor.id);
        if owns_attempt {
            Ok(transfer)
        } else {
            Err(Error::Forbidden(
                "Not authorized to view this transfer".to_string(),
            ))
        }
    }

    /// Owners see their own transfers; staff see everything.
    pub async fn list(&self, actor: &Actor, attempt_id: Option<Uuid>) -> Result<Vec<Transfer>> {
        if actor.is_staff() {
            self.store.list_transfers(attempt_id, None).await
        } else {
            self.store.list_transfers(attempt_id, Some(actor.id)).await
        }
    }

    /// Snapshot answers, checksum the canonical form, then commit the
    /// rebind and the transfer completion as one unit.
    async fn migrate(&self, transfer: &Transfer) -> Result<Transfer> {
        let attempt = self
            .store
            .get_attempt(transfer.attempt_id)
            .await?
            .ok_or_else(|| {
                Error::NotFound(format!("Attempt {} not found", transfer.attempt_id))
            })?;

        let answers = self.store.list_answers(transfer.attempt_id).await?;
        let checksum = migration_checksum(&attempt, transfer, &answers)?;

        self.store
            .complete_migration(
                transfer.id,
                transfer.attempt_id,
                &transfer.to_workstation,
                &checksum,
                answers.len() as i32,
            )
            .await
    }

    async fn publish(&self, attempt_id: Uuid, message: ServerMessage) {
        if let Err(e) = self
            .bridge
            .publish(&attempt_topic(attempt_id), &message)
            .await
        {
            // Delivery is best-effort; the durable record is already
            // written.
            error!(%attempt_id, error = %e, "failed to publish transfer event");
        }
    }
}

/// SHA-256 hex digest over the canonical migration snapshot. Answers
/// and flags are ordered by question id so the digest is stable.
fn migration_checksum(
    attempt: &Attempt,
    transfer: &Transfer,
    answers: &[AttemptAnswer],
) -> Result<String> {
    let mut flagged = attempt.flagged_questions();
    flagged.sort_unstable();

    let mut migrated: Vec<MigratedAnswer> = answers
        .iter()
        .map(|a| MigratedAnswer {
            question_id: a.question_id,
            answer: a.answer.as_ref(),
            is_flagged: a.is_flagged,
            time_spent_seconds: a.time_spent_seconds,
            sequence: a.sequence,
        })
        .collect();
    migrated.sort_by_key(|a| a.question_id);

    let snapshot = MigrationSnapshot {
        attempt_id: attempt.id,
        from_workstation: &transfer.from_workstation,
        to_workstation: &transfer.to_workstation,
        current_question_id: attempt.current_question_id,
        questions_answered: attempt.questions_answered,
        questions_flagged: flagged,
        time_remaining_seconds: attempt.remaining_seconds(),
        answers: migrated,
    };

    let canonical = serde_json::to_vec(&snapshot)?;
    Ok(hex::encode(Sha256::digest(canonical)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::broadcast::InMemoryBridge;
    use crate::store::MemoryStore;
    use crate::ws::messages::CheckpointRequest;
    use chrono::{Duration as ChronoDuration, Utc};
    use serde_json::json;

    fn actor(role: &str) -> Actor {
        Actor {
            id: Uuid::new_v4(),
            username: format!("{}-user", role),
            role: role.to_string(),
        }
    }

    fn attempt_on_ws1(student_id: Uuid) -> Attempt {
        Attempt {
            id: Uuid::new_v4(),
            student_id,
            exam_id: Uuid::new_v4(),
            status: "in_progress".to_string(),
            started_at: Some(Utc::now() - ChronoDuration::minutes(10)),
            submitted_at: None,
            duration_minutes: 60,
            workstation_id: Some("WS-1".to_string()),
            initial_workstation_id: Some("WS-1".to_string()),
            transfer_count: 0,
            current_question_id: None,
            questions_answered: 0,
            questions_flagged: json!([]),
            last_activity_at: None,
            created_at: Some(Utc::now()),
            updated_at: Some(Utc::now()),
        }
    }

    fn service(store: Arc<MemoryStore>, bridge: Arc<InMemoryBridge>) -> TransferService {
        let audit = AuditService::new(store.clone());
        TransferService::new(store, audit, bridge, 5)
    }

    async fn seed_answers(store: &Arc<MemoryStore>, attempt: &Attempt, questions: &[i32]) {
        store.set_exam_questions(attempt.exam_id, questions.iter().copied());
        for q in questions {
            store
                .upsert_answer(
                    attempt.id,
                    &CheckpointRequest {
                        question_id: *q,
                        answer: json!(["B"]),
                        is_flagged: false,
                        time_spent_seconds: 30,
                        sequence: 1,
                    },
                )
                .await
                .unwrap();
        }
    }

    #[tokio::test]
    async fn approved_transfer_migrates_state_and_rebinds_the_workstation() {
        let store = Arc::new(MemoryStore::new());
        let bridge = Arc::new(InMemoryBridge::new());
        let student = actor("student");
        let attempt = attempt_on_ws1(student.id);
        store.insert_attempt(attempt.clone());
        seed_answers(&store, &attempt, &[1, 2, 3]).await;

        let service = service(store.clone(), bridge.clone());
        let mut events = bridge.subscribe(&attempt_topic(attempt.id)).await.unwrap();

        let transfer = service
            .create_request(&student, attempt.id, "WS-2", "keyboard failure")
            .await
            .unwrap();
        assert_eq!(transfer.status, "pending");

        let supervisor = actor("hall_in_charge");
        let completed = service.approve(&supervisor, transfer.id).await.unwrap();

        assert_eq!(completed.status, "completed");
        assert_eq!(completed.answers_transferred, 3);
        let checksum = completed.migration_checksum.as_deref().unwrap();
        assert_eq!(checksum.len(), 64);
        assert!(checksum.chars().all(|c| c.is_ascii_hexdigit()));

        let attempt = store.attempt(attempt.id).unwrap();
        assert_eq!(attempt.workstation_id.as_deref(), Some("WS-2"));
        assert_eq!(attempt.transfer_count, 1);

        // Full lifecycle on the wire: requested, approved, completed.
        assert!(matches!(
            events.recv().await.unwrap(),
            ServerMessage::TransferRequested { .. }
        ));
        assert!(matches!(
            events.recv().await.unwrap(),
            ServerMessage::TransferApproved { .. }
        ));
        match events.recv().await.unwrap() {
            ServerMessage::TransferCompleted {
                to_workstation,
                answers_transferred,
                ..
            } => {
                assert_eq!(to_workstation, "WS-2");
                assert_eq!(answers_transferred, 3);
            }
            other => panic!("expected transfer_completed, got {:?}", other),
        }

        let events: Vec<String> = store
            .audit_events()
            .into_iter()
            .map(|e| e.event_type)
            .collect();
        assert_eq!(
            events,
            vec![
                "transfer_requested",
                "transfer_approved",
                "transfer_completed"
            ]
        );
    }

    #[tokio::test]
    async fn second_concurrent_request_is_rejected_naming_the_first() {
        let store = Arc::new(MemoryStore::new());
        let student = actor("student");
        let attempt = attempt_on_ws1(student.id);
        store.insert_attempt(attempt.clone());
        let service = service(store.clone(), Arc::new(InMemoryBridge::new()));

        let first = service
            .create_request(&student, attempt.id, "WS-2", "glare on screen")
            .await
            .unwrap();

        let err = service
            .create_request(&student, attempt.id, "WS-3", "second thoughts")
            .await
            .unwrap_err();
        match err {
            Error::Conflict(message) => {
                assert!(message.contains(&first.id.to_string()));
            }
            other => panic!("expected conflict, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn requests_too_close_to_the_deadline_are_refused_without_side_effects() {
        let store = Arc::new(MemoryStore::new());
        let student = actor("student");
        let mut attempt = attempt_on_ws1(student.id);
        attempt.started_at = Some(Utc::now() - ChronoDuration::minutes(58));
        store.insert_attempt(attempt.clone());
        let service = service(store.clone(), Arc::new(InMemoryBridge::new()));

        let err = service
            .create_request(&student, attempt.id, "WS-2", "too late")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Conflict(_)));

        assert!(store
            .list_transfers(Some(attempt.id), None)
            .await
            .unwrap()
            .is_empty());
        assert!(store.audit_events().is_empty());
    }

    #[tokio::test]
    async fn validation_refuses_same_workstation_and_foreign_requesters() {
        let store = Arc::new(MemoryStore::new());
        let student = actor("student");
        let attempt = attempt_on_ws1(student.id);
        store.insert_attempt(attempt.clone());
        let service = service(store.clone(), Arc::new(InMemoryBridge::new()));

        let err = service
            .create_request(&student, attempt.id, "WS-1", "same seat")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::BadRequest(_)));

        let stranger = actor("student");
        let err = service
            .create_request(&stranger, attempt.id, "WS-2", "not mine")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Forbidden(_)));

        // Hall staff may request on the student's behalf.
        let technician = actor("technician");
        service
            .create_request(&technician, attempt.id, "WS-2", "hardware fault")
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn approval_requires_a_distinct_supervisor() {
        let store = Arc::new(MemoryStore::new());
        let supervisor = actor("hall_in_charge");
        let attempt = attempt_on_ws1(supervisor.id);
        store.insert_attempt(attempt.clone());
        store.set_exam_questions(attempt.exam_id, [1]);
        let service = service(store.clone(), Arc::new(InMemoryBridge::new()));

        let transfer = service
            .create_request(&supervisor, attempt.id, "WS-2", "own request")
            .await
            .unwrap();

        // Self-approval refused even for a supervisor.
        let err = service.approve(&supervisor, transfer.id).await.unwrap_err();
        assert!(matches!(err, Error::Forbidden(_)));

        // Non-supervisory staff refused.
        let technician = actor("technician");
        let err = service.approve(&technician, transfer.id).await.unwrap_err();
        assert!(matches!(err, Error::Forbidden(_)));

        let other_supervisor = actor("hall_in_charge");
        let completed = service
            .approve(&other_supervisor, transfer.id)
            .await
            .unwrap();
        assert_eq!(completed.status, "completed");
    }

    #[tokio::test]
    async fn rejection_is_terminal_and_never_touches_the_attempt() {
        let store = Arc::new(MemoryStore::new());
        let student = actor("student");
        let attempt = attempt_on_ws1(student.id);
        store.insert_attempt(attempt.clone());
        let service = service(store.clone(), Arc::new(InMemoryBridge::new()));

        let transfer = service
            .create_request(&student, attempt.id, "WS-2", "wobbly desk")
            .await
            .unwrap();

        let supervisor = actor("hall_in_charge");
        let rejected = service
            .reject(&supervisor, transfer.id, Some("move the desk instead".to_string()))
            .await
            .unwrap();
        assert_eq!(rejected.status, "rejected");

        let attempt = store.attempt(attempt.id).unwrap();
        assert_eq!(attempt.workstation_id.as_deref(), Some("WS-1"));
        assert_eq!(attempt.transfer_count, 0);

        // Terminal: cannot approve afterwards.
        let err = service.approve(&supervisor, transfer.id).await.unwrap_err();
        assert!(matches!(err, Error::Conflict(_)));
    }

    #[tokio::test]
    async fn failed_migration_leaves_the_binding_intact() {
        let store = Arc::new(MemoryStore::new());
        let student = actor("student");
        let attempt = attempt_on_ws1(student.id);
        store.insert_attempt(attempt.clone());
        seed_answers(&store, &attempt, &[1, 2]).await;
        let service = service(store.clone(), Arc::new(InMemoryBridge::new()));

        let transfer = service
            .create_request(&student, attempt.id, "WS-2", "flicker")
            .await
            .unwrap();

        store.fail_migrations(true);
        let supervisor = actor("hall_in_charge");
        let err = service.approve(&supervisor, transfer.id).await.unwrap_err();
        assert!(matches!(err, Error::Internal(_)));

        let transfer = store.get_transfer(transfer.id).await.unwrap().unwrap();
        assert_eq!(transfer.status, "failed");
        assert!(transfer.error_message.is_some());

        let attempt = store.attempt(attempt.id).unwrap();
        assert_eq!(attempt.workstation_id.as_deref(), Some("WS-1"));
        assert_eq!(attempt.transfer_count, 0);

        let last = store.audit_events().pop().unwrap();
        assert_eq!(last.event_type, "transfer_failed");
        assert!(!last.success);
    }

    #[tokio::test]
    async fn listing_is_role_scoped() {
        let store = Arc::new(MemoryStore::new());
        let alice = actor("student");
        let bob = actor("student");
        let attempt_a = attempt_on_ws1(alice.id);
        let attempt_b = attempt_on_ws1(bob.id);
        store.insert_attempt(attempt_a.clone());
        store.insert_attempt(attempt_b.clone());
        let service = service(store.clone(), Arc::new(InMemoryBridge::new()));

        service
            .create_request(&alice, attempt_a.id, "WS-2", "a")
            .await
            .unwrap();
        service
            .create_request(&bob, attempt_b.id, "WS-3", "b")
            .await
            .unwrap();

        assert_eq!(service.list(&alice, None).await.unwrap().len(), 1);
        let staff = actor("hall_in_charge");
        assert_eq!(service.list(&staff, None).await.unwrap().len(), 2);
    }
}
