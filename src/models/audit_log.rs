use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use sqlx::FromRow;
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct AuditLog {
    pub id: Uuid,
    pub event_type: String,
    pub event_category: String,
    pub user_id: Option<Uuid>,
    pub username: Option<String>,
    pub attempt_id: Option<Uuid>,
    pub transfer_id: Option<Uuid>,
    pub description: String,
    pub details: Option<JsonValue>,
    pub success: bool,
    pub error_message: Option<String>,
    pub created_at: Option<DateTime<Utc>>,
}

/// Audit event as written by the services; ids and timestamps are
/// assigned by the store.
#[derive(Debug, Clone)]
pub struct NewAuditEvent {
    pub event_type: String,
    pub event_category: String,
    pub user_id: Option<Uuid>,
    pub username: Option<String>,
    pub attempt_id: Option<Uuid>,
    pub transfer_id: Option<Uuid>,
    pub description: String,
    pub details: Option<JsonValue>,
    pub success: bool,
    pub error_message: Option<String>,
}
