//! Authentication middleware for Axum

use axum::extract::{Request, State};
use axum::http::header;
use axum::middleware::Next;
use axum::response::Response;

use crate::error::ApiError;
use crate::state::AppState;

/// Authenticated caller, injected into request extensions.
#[derive(Debug, Clone)]
pub struct AuthUser {
    /// External identity (the token's `sub` claim).
    pub external_id: String,
    pub email: Option<String>,
    /// External id of the referring user, if this account was referred.
    pub referred_by: Option<String>,
}

/// Require a valid bearer token and inject [`AuthUser`].
pub async fn require_auth(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let token = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .ok_or(ApiError::Unauthorized)?;

    let claims = state.jwt.verify(token)?;

    request.extensions_mut().insert(AuthUser {
        external_id: claims.sub,
        email: claims.email,
        referred_by: claims.referred_by,
    });

    Ok(next.run(request).await)
}
