//! Gateway webhook endpoint.
//!
//! The body must reach the dispatcher byte-for-byte for signature
//! verification, so the handler takes the raw body and never re-encodes
//! it. Response contract: 200 on success or known-duplicate, 400 on
//! signature failure, 5xx on transient failure so the gateway retries.

use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use ledgerly_billing::{BillingError, BillingResult, DispatchOutcome};
use serde_json::json;

use crate::state::AppState;

/// Header carrying the gateway-computed signature of the raw body.
pub const SIGNATURE_HEADER: &str = "stripe-signature";

/// Map a dispatch result onto the webhook response contract.
///
/// Duplicates and unresolved-user skips come back as `Ok` outcomes, so a
/// 200 tells the gateway to stop retrying them.
fn status_for(result: &BillingResult<DispatchOutcome>) -> StatusCode {
    match result {
        Ok(_) => StatusCode::OK,
        Err(BillingError::BadSignature) | Err(BillingError::MalformedEvent(_)) => {
            StatusCode::BAD_REQUEST
        }
        Err(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

pub async fn handle_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: String,
) -> Response {
    let Some(signature) = headers.get(SIGNATURE_HEADER).and_then(|v| v.to_str().ok())
    else {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": "Bad signature" })),
        )
            .into_response();
    };

    let result = state.dispatcher.dispatch(&body, signature).await;

    if let Ok(DispatchOutcome::Skipped(reason)) = &result {
        state.alerts.notify(
            "Webhook event skipped",
            json!({ "reason": reason }),
        );
    }

    let status = status_for(&result);
    match result {
        Ok(outcome) => {
            (status, Json(json!({ "received": true, "outcome": format!("{outcome:?}") })))
                .into_response()
        }
        Err(BillingError::BadSignature) => (
            status,
            Json(json!({ "error": "Bad signature" })),
        )
            .into_response(),
        Err(BillingError::MalformedEvent(_)) => (
            status,
            Json(json!({ "error": "Malformed payload" })),
        )
            .into_response(),
        Err(e) => {
            tracing::error!(error = %e, "Webhook processing failed, gateway will retry");
            (
                status,
                Json(json!({ "error": "Internal server error" })),
            )
                .into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn success_and_duplicates_are_ok() {
        assert_eq!(
            status_for(&Ok(DispatchOutcome::Processed)),
            StatusCode::OK
        );
        assert_eq!(
            status_for(&Ok(DispatchOutcome::Duplicate)),
            StatusCode::OK
        );
        assert_eq!(
            status_for(&Ok(DispatchOutcome::Skipped("unresolved user"))),
            StatusCode::OK
        );
        assert_eq!(status_for(&Ok(DispatchOutcome::Ignored)), StatusCode::OK);
    }

    #[test]
    fn signature_failures_are_client_errors() {
        assert_eq!(
            status_for(&Err(BillingError::BadSignature)),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            status_for(&Err(BillingError::MalformedEvent("bad json".into()))),
            StatusCode::BAD_REQUEST
        );
    }

    #[test]
    fn transient_failures_ask_for_retry() {
        assert_eq!(
            status_for(&Err(BillingError::Gateway("down".into()))),
            StatusCode::INTERNAL_SERVER_ERROR
        );
        assert_eq!(
            status_for(&Err(BillingError::CatalogMissing("price_x".into()))),
            StatusCode::INTERNAL_SERVER_ERROR
        );
        assert_eq!(
            status_for(&Err(BillingError::Deadline)),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
