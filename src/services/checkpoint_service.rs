use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::store::SessionStore;
use crate::ws::manager::ConnectionManager;
use crate::ws::messages::{CheckpointRequest, ServerMessage};

type DebounceKey = (Uuid, i32);

#[derive(Debug, Clone)]
pub enum CheckpointOutcome {
    Saved {
        sequence: i32,
        saved_at: DateTime<Utc>,
        time_remaining_seconds: i64,
    },
    Debounced {
        delay: Duration,
    },
    Rejected {
        error: String,
        error_code: &'static str,
    },
}

struct PendingSave {
    generation: u64,
    handle: JoinHandle<()>,
}

#[derive(Default)]
struct DebounceState {
    last_commit: HashMap<DebounceKey, Instant>,
    pending: HashMap<DebounceKey, PendingSave>,
}

/// Turns bursty per-question saves into rate-limited durable writes.
///
/// Requests that land within the debounce window of the last commit for
/// the same (attempt, question) key replace any still-pending write
/// with a timer carrying the newest payload; the burst resolves to one
/// commit holding the final value.
#[derive(Clone)]
pub struct CheckpointService {
    store: Arc<dyn SessionStore>,
    manager: ConnectionManager,
    debounce: Duration,
    state: Arc<Mutex<DebounceState>>,
    generation: Arc<AtomicU64>,
}

impl CheckpointService {
    pub fn new(
        store: Arc<dyn SessionStore>,
        manager: ConnectionManager,
        debounce: Duration,
    ) -> Self {
        Self {
            store,
            manager,
            debounce,
            state: Arc::new(Mutex::new(DebounceState::default())),
            generation: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Entry point for one checkpoint request. `connection_id` is the
    /// session that sent it; acknowledgments and errors are delivered
    /// there, and sibling connections get a save notification.
    pub async fn process_checkpoint(
        &self,
        attempt_id: Uuid,
        connection_id: Option<Uuid>,
        request: CheckpointRequest,
    ) -> CheckpointOutcome {
        let key = (attempt_id, request.question_id);

        let delay = {
            let state = self.state.lock().expect("debounce state poisoned");
            state.last_commit.get(&key).and_then(|last| {
                let since = last.elapsed();
                (since < self.debounce).then(|| self.debounce - since)
            })
        };

        if let Some(delay) = delay {
            let generation = self.generation.fetch_add(1, Ordering::SeqCst);
            let service = self.clone();
            let deferred = request.clone();
            let handle = tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                service
                    .commit(attempt_id, connection_id, &deferred)
                    .await;
                let mut state = service.state.lock().expect("debounce state poisoned");
                if state
                    .pending
                    .get(&(attempt_id, deferred.question_id))
                    .is_some_and(|p| p.generation == generation)
                {
                    state.pending.remove(&(attempt_id, deferred.question_id));
                }
            });

            let mut state = self.state.lock().expect("debounce state poisoned");
            if let Some(superseded) = state
                .pending
                .insert(key, PendingSave { generation, handle })
            {
                // Last write wins: the older burst entry never commits.
                superseded.handle.abort();
            }

            debug!(
                %attempt_id,
                question_id = request.question_id,
                delay_ms = delay.as_millis() as u64,
                "checkpoint debounced"
            );
            return CheckpointOutcome::Debounced { delay };
        }

        self.commit(attempt_id, connection_id, &request).await
    }

    pub fn pending_count(&self) -> usize {
        let state = self.state.lock().expect("debounce state poisoned");
        state.pending.len()
    }

    async fn commit(
        &self,
        attempt_id: Uuid,
        connection_id: Option<Uuid>,
        request: &CheckpointRequest,
    ) -> CheckpointOutcome {
        let key = (attempt_id, request.question_id);
        let outcome = self.try_commit(attempt_id, request).await;

        {
            let mut state = self.state.lock().expect("debounce state poisoned");
            match &outcome {
                CheckpointOutcome::Saved { .. } => {
                    state.last_commit.insert(key, Instant::now());
                }
                CheckpointOutcome::Rejected { .. } => {
                    // A rejected key must not poison future requests
                    // with a stale window.
                    state.last_commit.remove(&key);
                }
                CheckpointOutcome::Debounced { .. } => {}
            }
        }

        match &outcome {
            CheckpointOutcome::Saved {
                sequence,
                saved_at,
                time_remaining_seconds,
            } => {
                if let Some(connection_id) = connection_id {
                    self.manager.send_to_one(
                        connection_id,
                        ServerMessage::CheckpointAck {
                            question_id: request.question_id,
                            sequence: *sequence,
                            saved_at: *saved_at,
                            time_remaining_seconds: *time_remaining_seconds,
                        },
                    );
                }
                self.manager.broadcast_to_attempt(
                    attempt_id,
                    ServerMessage::notification(
                        "Answer Saved",
                        format!("Question {} saved", request.question_id),
                        "success",
                    ),
                    connection_id,
                );
            }
            CheckpointOutcome::Rejected { error, error_code } => {
                warn!(
                    %attempt_id,
                    question_id = request.question_id,
                    error_code,
                    "checkpoint rejected: {}",
                    error
                );
                if let Some(connection_id) = connection_id {
                    self.manager.send_to_one(
                        connection_id,
                        ServerMessage::CheckpointError {
                            question_id: request.question_id,
                            error: error.clone(),
                            error_code: error_code.to_string(),
                        },
                    );
                }
            }
            CheckpointOutcome::Debounced { .. } => {}
        }

        outcome
    }

    /// Validate then upsert. Validation order: attempt exists and is
    /// in progress, clock has not run out, question belongs to the
    /// attempt's exam.
    async fn try_commit(
        &self,
        attempt_id: Uuid,
        request: &CheckpointRequest,
    ) -> CheckpointOutcome {
        let attempt = match self.store.get_attempt(attempt_id).await {
            Ok(Some(attempt)) => attempt,
            Ok(None) => {
                return CheckpointOutcome::Rejected {
                    error: "Attempt not found".to_string(),
                    error_code: "ATTEMPT_NOT_FOUND",
                }
            }
            Err(e) => {
                return CheckpointOutcome::Rejected {
                    error: e.to_string(),
                    error_code: "CHECKPOINT_SAVE_ERROR",
                }
            }
        };

        if !attempt.is_in_progress() {
            return CheckpointOutcome::Rejected {
                error: format!("Attempt is {}, cannot save checkpoint", attempt.status),
                error_code: "ATTEMPT_NOT_ACTIVE",
            };
        }

        if attempt.is_expired() {
            return CheckpointOutcome::Rejected {
                error: "Attempt time expired".to_string(),
                error_code: "TIME_EXPIRED",
            };
        }

        match self
            .store
            .question_in_exam(attempt.exam_id, request.question_id)
            .await
        {
            Ok(true) => {}
            Ok(false) => {
                return CheckpointOutcome::Rejected {
                    error: "Question not found in this exam".to_string(),
                    error_code: "INVALID_QUESTION",
                }
            }
            Err(e) => {
                return CheckpointOutcome::Rejected {
                    error: e.to_string(),
                    error_code: "CHECKPOINT_SAVE_ERROR",
                }
            }
        }

        match self.store.upsert_answer(attempt_id, request).await {
            Ok(write) => CheckpointOutcome::Saved {
                sequence: write.sequence,
                saved_at: write.saved_at,
                time_remaining_seconds: attempt.remaining_seconds(),
            },
            Err(e) => CheckpointOutcome::Rejected {
                error: e.to_string(),
                error_code: "CHECKPOINT_SAVE_ERROR",
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::attempt::Attempt;
    use crate::store::MemoryStore;
    use chrono::Duration as ChronoDuration;
    use serde_json::json;
    use tokio::sync::mpsc;

    fn in_progress_attempt(exam_id: Uuid) -> Attempt {
        Attempt {
            id: Uuid::new_v4(),
            student_id: Uuid::new_v4(),
            exam_id,
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

    fn service(store: Arc<MemoryStore>) -> CheckpointService {
        let manager = ConnectionManager::new(Duration::from_secs(30), Duration::from_secs(60), 3);
        CheckpointService::new(store, manager, Duration::from_secs(2))
    }

    fn checkpoint(question_id: i32, answer: serde_json::Value, sequence: i32) -> CheckpointRequest {
        CheckpointRequest {
            question_id,
            answer,
            is_flagged: false,
            time_spent_seconds: 10,
            sequence,
        }
    }

    fn seeded(store: &Arc<MemoryStore>) -> Attempt {
        let exam_id = Uuid::new_v4();
        let attempt = in_progress_attempt(exam_id);
        store.insert_attempt(attempt.clone());
        store.set_exam_questions(exam_id, [1, 2, 3, 7]);
        attempt
    }

    #[tokio::test(start_paused = true)]
    async fn rapid_burst_coalesces_into_one_commit_with_latest_payload() {
        let store = Arc::new(MemoryStore::new());
        let attempt = seeded(&store);
        let service = service(store.clone());

        // Outside any window: commits immediately.
        let first = service
            .process_checkpoint(attempt.id, None, checkpoint(7, json!(["A"]), 1))
            .await;
        assert!(matches!(first, CheckpointOutcome::Saved { sequence: 1, .. }));

        // Burst inside the window: every request defers, each
        // superseding the last.
        for (answer, sequence) in [(json!(["B"]), 2), (json!(["C"]), 3), (json!(["D"]), 4)] {
            let outcome = service
                .process_checkpoint(attempt.id, None, checkpoint(7, answer, sequence))
                .await;
            assert!(matches!(outcome, CheckpointOutcome::Debounced { .. }));
        }
        assert_eq!(service.pending_count(), 1);

        tokio::time::sleep(Duration::from_secs(3)).await;

        let answer = store.answer(attempt.id, 7).expect("answer committed");
        assert_eq!(answer.answer, Some(json!(["D"])));
        // One immediate commit plus one coalesced commit.
        assert_eq!(answer.sequence, 2);
        assert_eq!(answer.client_sequence, 4);
        assert_eq!(service.pending_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn spaced_requests_commit_independently_with_increasing_sequences() {
        let store = Arc::new(MemoryStore::new());
        let attempt = seeded(&store);
        let service = service(store.clone());

        for (i, answer) in [json!("x"), json!("y"), json!("z")].into_iter().enumerate() {
            let outcome = service
                .process_checkpoint(attempt.id, None, checkpoint(1, answer, i as i32 + 1))
                .await;
            match outcome {
                CheckpointOutcome::Saved { sequence, .. } => {
                    assert_eq!(sequence, i as i32 + 1)
                }
                other => panic!("expected immediate save, got {:?}", other),
            }
            tokio::time::sleep(Duration::from_secs(3)).await;
        }

        let answer = store.answer(attempt.id, 1).unwrap();
        assert_eq!(answer.sequence, 3);
        assert_eq!(answer.time_spent_seconds, 30);
    }

    #[tokio::test(start_paused = true)]
    async fn retry_after_dropped_ack_does_not_double_count() {
        let store = Arc::new(MemoryStore::new());
        let attempt = seeded(&store);
        let service = service(store.clone());

        let request = checkpoint(2, json!({"text": "essay draft"}), 9);
        let first = service
            .process_checkpoint(attempt.id, None, request.clone())
            .await;
        assert!(matches!(first, CheckpointOutcome::Saved { sequence: 1, .. }));

        tokio::time::sleep(Duration::from_secs(3)).await;

        // Client never saw the ack and resends the identical request.
        let retry = service.process_checkpoint(attempt.id, None, request).await;
        match retry {
            CheckpointOutcome::Saved { sequence, .. } => assert_eq!(sequence, 1),
            other => panic!("expected saved, got {:?}", other),
        }

        let answer = store.answer(attempt.id, 2).unwrap();
        assert_eq!(answer.sequence, 1);
        assert_eq!(answer.time_spent_seconds, 10);
        assert_eq!(store.attempt(attempt.id).unwrap().questions_answered, 1);
    }

    #[tokio::test]
    async fn rejects_checkpoints_for_inactive_or_foreign_questions() {
        let store = Arc::new(MemoryStore::new());
        let exam_id = Uuid::new_v4();
        let mut attempt = in_progress_attempt(exam_id);
        attempt.status = "submitted".to_string();
        store.insert_attempt(attempt.clone());
        store.set_exam_questions(exam_id, [1]);
        let service = service(store.clone());

        let outcome = service
            .process_checkpoint(attempt.id, None, checkpoint(1, json!("a"), 1))
            .await;
        match outcome {
            CheckpointOutcome::Rejected { error_code, .. } => {
                assert_eq!(error_code, "ATTEMPT_NOT_ACTIVE")
            }
            other => panic!("expected rejection, got {:?}", other),
        }

        // Question outside the exam on a live attempt.
        let live = seeded(&store);
        let outcome = service
            .process_checkpoint(live.id, None, checkpoint(99, json!("a"), 1))
            .await;
        match outcome {
            CheckpointOutcome::Rejected { error_code, .. } => {
                assert_eq!(error_code, "INVALID_QUESTION")
            }
            other => panic!("expected rejection, got {:?}", other),
        }
        assert!(store.answer(live.id, 99).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn expired_attempt_rejects_with_time_expired() {
        let store = Arc::new(MemoryStore::new());
        let exam_id = Uuid::new_v4();
        let mut attempt = in_progress_attempt(exam_id);
        attempt.started_at = Some(Utc::now() - ChronoDuration::minutes(61));
        store.insert_attempt(attempt.clone());
        store.set_exam_questions(exam_id, [1]);
        let service = service(store.clone());

        let outcome = service
            .process_checkpoint(attempt.id, None, checkpoint(1, json!("late"), 1))
            .await;
        match outcome {
            CheckpointOutcome::Rejected { error_code, .. } => {
                assert_eq!(error_code, "TIME_EXPIRED")
            }
            other => panic!("expected rejection, got {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn acks_reach_the_sender_and_siblings_get_notified() {
        let store = Arc::new(MemoryStore::new());
        let attempt = seeded(&store);

        let manager = ConnectionManager::new(Duration::from_secs(30), Duration::from_secs(60), 3);
        let service =
            CheckpointService::new(store.clone(), manager.clone(), Duration::from_secs(2));

        let (tx1, mut rx1) = mpsc::unbounded_channel();
        let (tx2, mut rx2) = mpsc::unbounded_channel();
        let sender = manager.connect(attempt.id, attempt.student_id, tx1).unwrap();
        manager.connect(attempt.id, attempt.student_id, tx2).unwrap();

        service
            .process_checkpoint(attempt.id, Some(sender), checkpoint(3, json!(["B"]), 1))
            .await;

        match rx1.try_recv().unwrap() {
            ServerMessage::CheckpointAck {
                question_id,
                sequence,
                ..
            } => {
                assert_eq!(question_id, 3);
                assert_eq!(sequence, 1);
            }
            other => panic!("expected ack, got {:?}", other),
        }
        assert!(matches!(
            rx2.try_recv().unwrap(),
            ServerMessage::Notification { .. }
        ));
        // The sender's own ack is not echoed back as a notification.
        assert!(rx1.try_recv().is_err());
    }
}
