use std::sync::Arc;

use serde_json::Value as JsonValue;
use uuid::Uuid;

use crate::error::Result;
use crate::models::audit_log::NewAuditEvent;
use crate::store::SessionStore;

/// Compliance trail writer. Every transfer transition goes through
/// here, including failures.
#[derive(Clone)]
pub struct AuditService {
    store: Arc<dyn SessionStore>,
}

impl AuditService {
    pub fn new(store: Arc<dyn SessionStore>) -> Self {
        Self { store }
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn log(
        &self,
        event_type: &str,
        event_category: &str,
        user_id: Option<Uuid>,
        username: Option<String>,
        attempt_id: Option<Uuid>,
        transfer_id: Option<Uuid>,
        description: String,
        details: Option<JsonValue>,
    ) -> Result<()> {
        self.store
            .insert_audit(NewAuditEvent {
                event_type: event_type.to_string(),
                event_category: event_category.to_string(),
                user_id,
                username,
                attempt_id,
                transfer_id,
                description,
                details,
                success: true,
                error_message: None,
            })
            .await
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn log_failure(
        &self,
        event_type: &str,
        event_category: &str,
        user_id: Option<Uuid>,
        username: Option<String>,
        attempt_id: Option<Uuid>,
        transfer_id: Option<Uuid>,
        description: String,
        error_message: String,
    ) -> Result<()> {
        self.store
            .insert_audit(NewAuditEvent {
                event_type: event_type.to_string(),
                event_category: event_category.to_string(),
                user_id,
                username,
                attempt_id,
                transfer_id,
                description,
                details: Some(serde_json::json!({ "error": error_message })),
                success: false,
                error_message: Some(error_message),
            })
            .await
    }
}
