use serde::{Deserialize, Serialize};
use uuid::Uuid;
use validator::Validate;

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct CreateTransferRequest {
    pub attempt_id: Uuid,
    #[validate(length(min = 1, max = 50))]
    pub to_workstation: String,
    #[validate(length(min = 1, max = 500))]
    pub reason: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct RejectTransferRequest {
    #[validate(length(max = 500))]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ListTransfersQuery {
    pub attempt_id: Option<Uuid>,
}
