use axum::{
    extract::{
        ws::{close_code, CloseFrame, Message, WebSocket},
        Path, Query, State, WebSocketUpgrade,
    },
    response::IntoResponse,
};
use chrono::Utc;
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::json;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::middleware::auth::decode_token;
use crate::services::broadcast::attempt_topic;
use crate::ws::messages::{ClientMessage, ServerMessage};
use crate::AppState;

#[derive(Debug, Deserialize)]
pub struct SessionQuery {
    pub token: String,
}

/// Upgrade handler for `/api/session/attempts/:id`. The bearer token
/// travels as a query parameter because browsers cannot set headers on
/// a WebSocket handshake.
pub async fn attempt_session(
    ws: WebSocketUpgrade,
    Path(attempt_id): Path<Uuid>,
    Query(query): Query<SessionQuery>,
    State(state): State<AppState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_session(socket, state, attempt_id, query.token))
}

async fn close_with_policy(mut socket: WebSocket, reason: String) {
    let _ = socket
        .send(Message::Close(Some(CloseFrame {
            code: close_code::POLICY,
            reason: reason.into(),
        })))
        .await;
}

async fn handle_session(socket: WebSocket, state: AppState, attempt_id: Uuid, token: String) {
    let claims = match decode_token(&token) {
        Ok(claims) => claims,
        Err(_) => {
            close_with_policy(socket, "authentication_failed".to_string()).await;
            return;
        }
    };
    let Ok(user_id) = claims.sub.parse::<Uuid>() else {
        close_with_policy(socket, "authentication_failed".to_string()).await;
        return;
    };

    let attempt = match state.store.get_attempt(attempt_id).await {
        Ok(Some(attempt)) => attempt,
        Ok(None) => {
            close_with_policy(socket, "attempt_not_found".to_string()).await;
            return;
        }
        Err(e) => {
            error!(%attempt_id, error = %e, "failed to load attempt for session");
            close_with_policy(socket, "internal_error".to_string()).await;
            return;
        }
    };

    if attempt.student_id != user_id {
        close_with_policy(socket, "unauthorized".to_string()).await;
        return;
    }
    if attempt.status != "not_started" && attempt.status != "in_progress" {
        close_with_policy(socket, format!("attempt_is_{}", attempt.status)).await;
        return;
    }

    let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<ServerMessage>();
    let connection_id = match state.manager.connect(attempt_id, user_id, outbound_tx) {
        Ok(connection_id) => connection_id,
        Err(rejection) => {
            close_with_policy(socket, rejection.close_reason().to_string()).await;
            return;
        }
    };

    let (mut ws_tx, mut ws_rx) = socket.split();

    // Writer task owns the sink; everything outbound funnels through
    // the manager's channel.
    let writer = tokio::spawn(async move {
        while let Some(message) = outbound_rx.recv().await {
            match serde_json::to_string(&message) {
                Ok(text) => {
                    if ws_tx.send(Message::Text(text)).await.is_err() {
                        break;
                    }
                }
                Err(e) => {
                    error!(error = %e, "failed to serialize outbound message");
                }
            }
        }
        let _ = ws_tx.close().await;
    });

    // Events published from any process against this attempt land here
    // and are relayed to this connection.
    let forward = match state.bridge.subscribe(&attempt_topic(attempt_id)).await {
        Ok(mut subscription) => {
            let manager = state.manager.clone();
            tokio::spawn(async move {
                while let Some(message) = subscription.recv().await {
                    if !manager.send_to_one(connection_id, message) {
                        break;
                    }
                }
            })
        }
        Err(e) => {
            error!(%attempt_id, error = %e, "failed to subscribe to attempt topic");
            state.manager.disconnect(connection_id);
            writer.abort();
            return;
        }
    };

    state.manager.send_to_one(
        connection_id,
        ServerMessage::Connected {
            connection_id,
            attempt_id,
            server_time: Utc::now(),
            time_remaining_seconds: attempt.remaining_seconds(),
            heartbeat_interval: state.heartbeat_interval_secs,
            checkpoint_debounce: state.checkpoint_debounce_secs,
        },
    );
    info!(%connection_id, %attempt_id, %user_id, "session established");

    while let Some(frame) = ws_rx.next().await {
        match frame {
            Ok(Message::Text(text)) => {
                state.manager.record_activity(connection_id);
                match serde_json::from_str::<ClientMessage>(&text) {
                    Ok(message) => {
                        dispatch_message(&state, attempt_id, connection_id, message).await
                    }
                    Err(e) => {
                        state.manager.send_to_one(
                            connection_id,
                            parse_error_message(&text, &e.to_string()),
                        );
                    }
                }
            }
            Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => {
                state.manager.record_activity(connection_id);
            }
            Ok(Message::Close(_)) => {
                debug!(%connection_id, "client sent close frame");
                break;
            }
            Ok(_) => {}
            Err(e) => {
                warn!(%connection_id, error = %e, "session transport error");
                break;
            }
        }

        // The heartbeat monitor may have evicted us mid-loop.
        if !state.manager.is_connected(connection_id) {
            break;
        }
    }

    state.manager.disconnect(connection_id);
    forward.abort();
    writer.abort();
    info!(%connection_id, %attempt_id, "session closed");
}

/// Unrecognized `type` values get their own code so clients can tell a
/// protocol mismatch from a malformed payload.
fn parse_error_message(raw: &str, parse_error: &str) -> ServerMessage {
    let message_type = serde_json::from_str::<serde_json::Value>(raw)
        .ok()
        .and_then(|v| v.get("type").and_then(|t| t.as_str().map(String::from)));
    match message_type {
        Some(message_type) if parse_error.contains("unknown variant") => ServerMessage::error(
            format!("Unknown message type: {}", message_type),
            "UNKNOWN_MESSAGE_TYPE",
        ),
        _ => ServerMessage::error(
            format!("Malformed message: {}", parse_error),
            "MALFORMED_MESSAGE",
        ),
    }
}

pub(crate) async fn dispatch_message(
    state: &AppState,
    attempt_id: Uuid,
    connection_id: Uuid,
    message: ClientMessage,
) {
    match message {
        // Liveness was already recorded when the frame arrived.
        ClientMessage::Pong => {}

        ClientMessage::Checkpoint(request) => {
            state
                .checkpoint_service
                .process_checkpoint(attempt_id, Some(connection_id), request)
                .await;
        }

        ClientMessage::TimeSync { .. } => match state.store.get_attempt(attempt_id).await {
            Ok(Some(attempt)) => {
                let is_expired = attempt.is_expired();
                state.manager.send_to_one(
                    connection_id,
                    ServerMessage::TimeUpdate {
                        server_time: Utc::now(),
                        time_remaining_seconds: attempt.remaining_seconds(),
                        elapsed_seconds: attempt.elapsed_seconds(),
                        is_expired,
                    },
                );
                if is_expired {
                    state.manager.send_to_one(
                        connection_id,
                        ServerMessage::exam_event(
                            "time_expired",
                            json!({"message": "Exam time has expired. Please submit your exam."}),
                        ),
                    );
                }
            }
            Ok(None) => {
                state.manager.send_to_one(
                    connection_id,
                    ServerMessage::error("Attempt not found".to_string(), "ATTEMPT_NOT_FOUND"),
                );
            }
            Err(e) => {
                state.manager.send_to_one(
                    connection_id,
                    ServerMessage::error(e.to_string(), "TIME_SYNC_ERROR"),
                );
            }
        },

        ClientMessage::Flag {
            question_id,
            is_flagged,
        } => match state
            .store
            .set_question_flag(attempt_id, question_id, is_flagged)
            .await
        {
            Ok(()) => {
                let (title, detail) = if is_flagged {
                    ("Question Flagged", "flagged for review")
                } else {
                    ("Flag Removed", "unflagged")
                };
                state.manager.send_to_one(
                    connection_id,
                    ServerMessage::notification(
                        title,
                        format!("Question {} {}", question_id, detail),
                        "info",
                    ),
                );
            }
            Err(e) => {
                state.manager.send_to_one(
                    connection_id,
                    ServerMessage::error(e.to_string(), "FLAG_ERROR"),
                );
            }
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::attempt::Attempt;
    use crate::services::broadcast::InMemoryBridge;
    use crate::store::MemoryStore;
    use chrono::Duration as ChronoDuration;
    use std::sync::Arc;

    fn app_state(store: Arc<MemoryStore>) -> AppState {
        AppState::with_store(store, Arc::new(InMemoryBridge::new()))
    }

    fn live_attempt() -> Attempt {
        Attempt {
            id: Uuid::new_v4(),
            student_id: Uuid::new_v4(),
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

    #[tokio::test]
    async fn time_sync_reports_the_running_clock() {
        let store = Arc::new(MemoryStore::new());
        let attempt = live_attempt();
        store.insert_attempt(attempt.clone());
        let state = app_state(store);

        let (tx, mut rx) = mpsc::unbounded_channel();
        let connection_id = state
            .manager
            .connect(attempt.id, attempt.student_id, tx)
            .unwrap();

        dispatch_message(
            &state,
            attempt.id,
            connection_id,
            ClientMessage::TimeSync {
                client_timestamp: Some(Utc::now()),
            },
        )
        .await;

        match rx.try_recv().unwrap() {
            ServerMessage::TimeUpdate {
                time_remaining_seconds,
                elapsed_seconds,
                is_expired,
                ..
            } => {
                assert!((2990..=3000).contains(&time_remaining_seconds));
                assert!((600..=610).contains(&elapsed_seconds));
                assert!(!is_expired);
            }
            other => panic!("expected time_update, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn flag_round_trip_updates_the_attempt() {
        let store = Arc::new(MemoryStore::new());
        let attempt = live_attempt();
        store.insert_attempt(attempt.clone());
        let state = app_state(store.clone());

        let (tx, mut rx) = mpsc::unbounded_channel();
        let connection_id = state
            .manager
            .connect(attempt.id, attempt.student_id, tx)
            .unwrap();

        dispatch_message(
            &state,
            attempt.id,
            connection_id,
            ClientMessage::Flag {
                question_id: 4,
                is_flagged: true,
            },
        )
        .await;

        assert!(matches!(
            rx.try_recv().unwrap(),
            ServerMessage::Notification { .. }
        ));
        assert_eq!(store.attempt(attempt.id).unwrap().flagged_questions(), vec![4]);

        dispatch_message(
            &state,
            attempt.id,
            connection_id,
            ClientMessage::Flag {
                question_id: 4,
                is_flagged: false,
            },
        )
        .await;
        assert!(store
            .attempt(attempt.id)
            .unwrap()
            .flagged_questions()
            .is_empty());
    }

    #[tokio::test]
    async fn expired_attempt_gets_an_explicit_event_on_time_sync() {
        let store = Arc::new(MemoryStore::new());
        let mut attempt = live_attempt();
        attempt.started_at = Some(Utc::now() - ChronoDuration::minutes(61));
        store.insert_attempt(attempt.clone());
        let state = app_state(store);

        let (tx, mut rx) = mpsc::unbounded_channel();
        let connection_id = state
            .manager
            .connect(attempt.id, attempt.student_id, tx)
            .unwrap();

        dispatch_message(
            &state,
            attempt.id,
            connection_id,
            ClientMessage::TimeSync {
                client_timestamp: None,
            },
        )
        .await;

        match rx.try_recv().unwrap() {
            ServerMessage::TimeUpdate {
                is_expired,
                time_remaining_seconds,
                ..
            } => {
                assert!(is_expired);
                assert_eq!(time_remaining_seconds, 0);
            }
            other => panic!("expected time_update, got {:?}", other),
        }
        match rx.try_recv().unwrap() {
            ServerMessage::ExamEvent { event, .. } => assert_eq!(event, "time_expired"),
            other => panic!("expected exam_event, got {:?}", other),
        }
    }

    #[test]
    fn unknown_message_types_get_their_own_error_code() {
        let raw = r#"{"type": "teleport"}"#;
        let err = serde_json::from_str::<ClientMessage>(raw).unwrap_err();
        let message = parse_error_message(raw, &err.to_string());
        match message {
            ServerMessage::Error { error_code, .. } => {
                assert_eq!(error_code, "UNKNOWN_MESSAGE_TYPE")
            }
            other => panic!("expected error, got {:?}", other),
        }

        let raw = r#"{"type": "checkpoint", "question_id": "seven"}"#;
        let err = serde_json::from_str::<ClientMessage>(raw).unwrap_err();
        let message = parse_error_message(raw, &err.to_string());
        match message {
            ServerMessage::Error { error_code, .. } => {
                assert_eq!(error_code, "MALFORMED_MESSAGE")
            }
            other => panic!("expected error, got {:?}", other),
        }
    }
}
