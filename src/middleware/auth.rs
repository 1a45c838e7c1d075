use axum::{
    extract::Request,
    http::StatusCode,
    middleware::Next,
    response::{IntoResponse, Json, Response},
};
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};
use serde_json::json;
use uuid::Uuid;

use crate::error::{Error, Result};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    pub exp: usize,
    pub role: Option<String>,
    pub name: Option<String>,
}

/// Authenticated caller as seen by the services: identity plus the
/// single role the exam hall hierarchy assigns.
#[derive(Debug, Clone)]
pub struct Actor {
    pub id: Uuid,
    pub username: String,
    pub role: String,
}

impl Actor {
    pub fn from_claims(claims: &Claims) -> Result<Self> {
        let id = claims
            .sub
            .parse::<Uuid>()
            .map_err(|_| Error::Unauthorized("Invalid subject claim".to_string()))?;
        Ok(Self {
            id,
            username: claims.name.clone().unwrap_or_else(|| claims.sub.clone()),
            role: claims.role.clone().unwrap_or_else(|| "student".to_string()),
        })
    }

    /// Hall staff may act on attempts they do not own.
    pub fn is_staff(&self) -> bool {
        matches!(self.role.as_str(), "technician" | "hall_in_charge")
    }

    /// The supervisory role that decides transfers.
    pub fn is_supervisor(&self) -> bool {
        self.role == "hall_in_charge"
    }
}

pub fn decode_token(token: &str) -> Result<Claims> {
    let config = crate::config::get_config();
    let mut validation = Validation::new(Algorithm::HS256);
    validation.validate_exp = true;
    let data = decode::<Claims>(
        token,
        &DecodingKey::from_secret(config.jwt_secret.as_bytes()),
        &validation,
    )
    .map_err(|_| Error::Unauthorized("Invalid token".to_string()))?;
    Ok(data.claims)
}

pub async fn require_bearer_auth(mut req: Request, next: Next) -> Response {
    let Some(auth_header) = req.headers().get(axum::http::header::AUTHORIZATION) else {
        return (
            StatusCode::UNAUTHORIZED,
            Json(json!({"error":"missing_authorization"})),
        )
            .into_response();
    };
    let Ok(auth_str) = auth_header.to_str() else {
        return (
            StatusCode::UNAUTHORIZED,
            Json(json!({"error":"bad_authorization"})),
        )
            .into_response();
    };
    let Some(token) = auth_str.strip_prefix("Bearer ") else {
        return (
            StatusCode::UNAUTHORIZED,
            Json(json!({"error":"unsupported_scheme"})),
        )
            .into_response();
    };

    match decode_token(token) {
        Ok(claims) => {
            req.extensions_mut().insert(claims);
            next.run(req).await
        }
        Err(_) => (
            StatusCode::UNAUTHORIZED,
            Json(json!({"error":"invalid_token"})),
        )
            .into_response(),
    }
}
