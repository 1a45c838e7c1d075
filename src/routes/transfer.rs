use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    Extension, Json,
};
use uuid::Uuid;
use validator::Validate;

use crate::dto::transfer_dto::{CreateTransferRequest, ListTransfersQuery, RejectTransferRequest};
use crate::error::Result;
use crate::middleware::auth::{Actor, Claims};
use crate::AppState;

pub async fn create_transfer(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Json(payload): Json<CreateTransferRequest>,
) -> Result<impl IntoResponse> {
    payload.validate()?;
    let actor = Actor::from_claims(&claims)?;
    let transfer = state
        .transfer_service
        .create_request(
            &actor,
            payload.attempt_id,
            &payload.to_workstation,
            &payload.reason,
        )
        .await?;
    Ok((StatusCode::CREATED, Json(transfer)))
}

pub async fn approve_transfer(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Path(transfer_id): Path<Uuid>,
) -> Result<impl IntoResponse> {
    let actor = Actor::from_claims(&claims)?;
    let transfer = state.transfer_service.approve(&actor, transfer_id).await?;
    Ok(Json(transfer))
}

pub async fn reject_transfer(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Path(transfer_id): Path<Uuid>,
    Json(payload): Json<RejectTransferRequest>,
) -> Result<impl IntoResponse> {
    payload.validate()?;
    let actor = Actor::from_claims(&claims)?;
    let transfer = state
        .transfer_service
        .reject(&actor, transfer_id, payload.reason)
        .await?;
    Ok(Json(transfer))
}

pub async fn get_transfer(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Path(transfer_id): Path<Uuid>,
) -> Result<impl IntoResponse> {
    let actor = Actor::from_claims(&claims)?;
    let transfer = state.transfer_service.get(&actor, transfer_id).await?;
    Ok(Json(transfer))
}

pub async fn list_transfers(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Query(query): Query<ListTransfersQuery>,
) -> Result<impl IntoResponse> {
    let actor = Actor::from_claims(&claims)?;
    let transfers = state
        .transfer_service
        .list(&actor, query.attempt_id)
        .await?;
    Ok(Json(transfers))
}
