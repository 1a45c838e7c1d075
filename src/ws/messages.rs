use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use uuid::Uuid;

/// Answer checkpoint as sent by a client. The sequence number is the
/// client's own ordering hint; the server-side sequence on the stored
/// answer is authoritative.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CheckpointRequest {
    pub question_id: i32,
    pub answer: JsonValue,
    #[serde(default)]
    pub is_flagged: bool,
    #[serde(default)]
    pub time_spent_seconds: i32,
    #[serde(default)]
    pub sequence: i32,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Pong,
    Checkpoint(CheckpointRequest),
    TimeSync {
        #[serde(default)]
        client_timestamp: Option<DateTime<Utc>>,
    },
    Flag {
        question_id: i32,
        #[serde(default = "default_true")]
        is_flagged: bool,
    },
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    Connected {
        connection_id: Uuid,
        attempt_id: Uuid,
        server_time: DateTime<Utc>,
        time_remaining_seconds: i64,
        heartbeat_interval: u64,
        checkpoint_debounce: u64,
    },
    Ping {
        timestamp: DateTime<Utc>,
    },
    CheckpointAck {
        question_id: i32,
        sequence: i32,
        saved_at: DateTime<Utc>,
        time_remaining_seconds: i64,
    },
    CheckpointError {
        question_id: i32,
        error: String,
        error_code: String,
    },
    TimeUpdate {
        server_time: DateTime<Utc>,
        time_remaining_seconds: i64,
        elapsed_seconds: i64,
        is_expired: bool,
    },
    Notification {
        title: String,
        message: String,
        severity: String,
    },
    Error {
        message: String,
        error_code: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        details: Option<JsonValue>,
    },
    ExamEvent {
        event: String,
        data: JsonValue,
    },
    TransferRequested {
        transfer_id: Uuid,
        attempt_id: Uuid,
        from_workstation: String,
        to_workstation: String,
        reason: String,
        requested_by: String,
    },
    TransferApproved {
        transfer_id: Uuid,
        attempt_id: Uuid,
        from_workstation: String,
        to_workstation: String,
        approved_by: String,
    },
    TransferCompleted {
        transfer_id: Uuid,
        attempt_id: Uuid,
        to_workstation: String,
        migration_checksum: String,
        answers_transferred: i32,
    },
    TransferRejected {
        transfer_id: Uuid,
        attempt_id: Uuid,
        #[serde(skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
}

impl ServerMessage {
    pub fn notification(title: &str, message: String, severity: &str) -> Self {
        ServerMessage::Notification {
            title: title.to_string(),
            message,
            severity: severity.to_string(),
        }
    }

    pub fn error(message: String, error_code: &str) -> Self {
        ServerMessage::Error {
            message,
            error_code: error_code.to_string(),
            details: None,
        }
    }

    pub fn exam_event(event: &str, data: JsonValue) -> Self {
        ServerMessage::ExamEvent {
            event: event.to_string(),
            data,
        }
    }
}
