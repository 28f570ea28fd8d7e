//! API error responses.
//!
//! All non-2xx responses use the uniform `{"error": string}` shape.
//! Internal failures never leak stack traces or raw gateway payloads.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use ledgerly_billing::BillingError;
use serde_json::json;

pub type ApiResult<T> = Result<T, ApiError>;

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("Authentication required")]
    Unauthorized,
    #[error("{0}")]
    BadRequest(String),
    #[error("{0}")]
    NotFound(String),
    #[error("Insufficient tokens")]
    InsufficientTokens { requested: i64, available: i64 },
    #[error("Service temporarily unavailable")]
    Unavailable,
    #[error("Internal error")]
    Internal,
}

impl From<BillingError> for ApiError {
    fn from(e: BillingError) -> Self {
        match e {
            BillingError::InsufficientTokens {
                requested,
                available,
            } => ApiError::InsufficientTokens {
                requested,
                available,
            },
            BillingError::CatalogMissing(key) => {
                ApiError::BadRequest(format!("Unknown plan: {key}"))
            }
            BillingError::UserDeleted(_) => {
                ApiError::BadRequest("Account is deactivated".into())
            }
            BillingError::Gateway(_) | BillingError::Deadline => ApiError::Unavailable,
            other => {
                tracing::error!(error = %other, "Internal billing error");
                ApiError::Internal
            }
        }
    }
}

impl From<sqlx::Error> for ApiError {
    fn from(e: sqlx::Error) -> Self {
        ApiError::from(BillingError::Storage(e))
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, body) = match &self {
            ApiError::Unauthorized => (
                StatusCode::UNAUTHORIZED,
                json!({ "error": "Authentication required" }),
            ),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, json!({ "error": msg })),
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, json!({ "error": msg })),
            ApiError::InsufficientTokens {
                requested,
                available,
            } => (
                StatusCode::CONFLICT,
                json!({
                    "error": "Insufficient tokens",
                    "requested": requested,
                    "available": available,
                }),
            ),
            ApiError::Unavailable => (
                StatusCode::SERVICE_UNAVAILABLE,
                json!({ "error": "Service temporarily unavailable" }),
            ),
            ApiError::Internal => (
                StatusCode::INTERNAL_SERVER_ERROR,
                json!({ "error": "Internal server error" }),
            ),
        };
        (status, Json(body)).into_response()
    }
}
