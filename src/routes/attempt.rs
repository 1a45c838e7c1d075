use axum::{
    extract::{Path, State},
    response::IntoResponse,
    Extension, Json,
};
use chrono::Utc;
use uuid::Uuid;

use crate::dto::attempt_dto::AttemptTimeResponse;
use crate::error::{Error, Result};
use crate::middleware::auth::{Actor, Claims};
use crate::AppState;

/// REST companion to the WebSocket `time_sync` message, for staff
/// tooling and reconnecting clients.
pub async fn get_attempt_time(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Path(attempt_id): Path<Uuid>,
) -> Result<impl IntoResponse> {
    let actor = Actor::from_claims(&claims)?;
    let attempt = state
        .store
        .get_attempt(attempt_id)
        .await?
        .ok_or_else(|| Error::NotFound(format!("Attempt {} not found", attempt_id)))?;

    if attempt.student_id != actor.id && !actor.is_staff() {
        return Err(Error::Forbidden(
            "Not authorized to view this attempt".to_string(),
        ));
    }

    Ok(Json(AttemptTimeResponse {
        attempt_id: attempt.id,
        status: attempt.status.clone(),
        server_time: Utc::now(),
        time_remaining_seconds: attempt.remaining_seconds(),
        elapsed_seconds: attempt.elapsed_seconds(),
        is_expired: attempt.is_expired(),
    }))
}
