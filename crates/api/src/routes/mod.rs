//! HTTP routing.

use axum::http::Method;
use axum::routing::{get, post};
use axum::{middleware, Json, Router};
use serde_json::json;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::auth::require_auth;
use crate::state::AppState;

pub mod billing;
pub mod webhooks;

async fn health_check() -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "service": "ledgerly-api",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

/// Build the application router.
pub fn create_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST])
        .allow_headers(Any)
        .allow_origin(Any);

    let authenticated = Router::new()
        .route("/billing/purchase", post(billing::create_purchase))
        .route(
            "/billing/subscription/cancel",
            post(billing::cancel_subscription),
        )
        .route("/billing/balance", get(billing::get_balance))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            require_auth,
        ));

    Router::new()
        .route("/health", get(health_check))
        .route("/webhooks/stripe", post(webhooks::handle_webhook))
        .merge(authenticated)
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}
