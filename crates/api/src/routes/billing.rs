//! Authenticated billing endpoints: one-time purchases, cancellation,
//! and the balance query.

use std::collections::HashMap;

use axum::extract::State;
use axum::{Extension, Json};
use ledgerly_billing::CheckoutParams;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::auth::AuthUser;
use crate::error::{ApiError, ApiResult};
use crate::state::AppState;

/// Request to start a checkout.
#[derive(Debug, Deserialize)]
pub struct PurchaseRequest {
    /// "tokens" for a one-time pack, "subscription" for a recurring plan.
    pub plan_type: String,
    /// Token tier (e.g. "tier1") or subscription plan key.
    pub plan_option: String,
}

/// Response carrying the hosted checkout URL.
#[derive(Debug, Serialize)]
pub struct CheckoutResponse {
    pub url: String,
}

#[derive(Debug, Serialize)]
pub struct MessageResponse {
    pub message: String,
}

#[derive(Debug, Serialize)]
pub struct BalanceResponse {
    pub balance: i64,
}

/// Resolve (or create, on first contact) the local user row for the
/// authenticated caller.
///
/// First contact also records referral attribution when the token carries
/// a `referred_by` claim; the reward itself is granted later, when the
/// referred user's first revenue event lands.
async fn ensure_user(state: &AppState, auth: &AuthUser) -> ApiResult<Uuid> {
    let mut tx = state.store.begin().await?;

    if let Some(user) = state
        .store
        .find_user_by_external_id(&mut tx, &auth.external_id)
        .await?
    {
        tx.commit().await?;
        if user.is_deleted {
            return Err(ApiError::BadRequest("Account is deactivated".into()));
        }
        return Ok(user.id);
    }

    let Some(email) = auth.email.as_deref() else {
        return Err(ApiError::BadRequest(
            "Account has no email on record".into(),
        ));
    };
    let id = state
        .store
        .upsert_user_by_external_id(&mut tx, &auth.external_id, email)
        .await?;

    if let Some(referrer_external_id) = auth.referred_by.as_deref() {
        match state
            .store
            .find_user_by_external_id(&mut tx, referrer_external_id)
            .await?
        {
            Some(referrer) if referrer.id != id => {
                let recorded = state.referrals.record(&mut tx, referrer.id, id).await?;
                if recorded {
                    tracing::info!(
                        referrer = %referrer_external_id,
                        referred = %auth.external_id,
                        "Referral recorded"
                    );
                }
            }
            Some(_) => {
                tracing::warn!(user = %auth.external_id, "Ignoring self-referral");
            }
            None => {
                tracing::warn!(
                    referrer = %referrer_external_id,
                    referred = %auth.external_id,
                    "Referral attribution names an unknown referrer"
                );
            }
        }
    }

    tx.commit().await?;

    tracing::info!(user = %auth.external_id, "User created on first contact");
    Ok(id)
}

/// Create a hosted checkout session and return its URL.
pub async fn create_purchase(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Json(req): Json<PurchaseRequest>,
) -> ApiResult<Json<CheckoutResponse>> {
    ensure_user(&state, &auth_user).await?;

    let (price_key, one_time) = match req.plan_type.as_str() {
        "tokens" => {
            let price = state.catalog.token_price_by_tier(&req.plan_option).await?;
            (price.plan_key, true)
        }
        "subscription" => {
            let price = state.catalog.subscription_price(&req.plan_option).await?;
            (price.plan_key, false)
        }
        other => {
            return Err(ApiError::BadRequest(format!("Unknown plan_type: {other}")));
        }
    };

    let site = &state.config.billing.site_domain;
    let mut metadata = HashMap::new();
    metadata.insert("user_id".to_string(), auth_user.external_id.clone());
    metadata.insert("plan_option".to_string(), req.plan_option.clone());

    let session = state
        .gateway
        .create_checkout_session(CheckoutParams {
            price_key,
            one_time,
            customer_email: auth_user.email.clone(),
            success_url: format!("{site}/billing/success"),
            cancel_url: format!("{site}/billing/cancelled"),
            metadata,
        })
        .await?;

    let url = session.url.ok_or_else(|| {
        tracing::error!(session_id = %session.id, "Checkout session created without a URL");
        ApiError::Unavailable
    })?;

    tracing::info!(
        user = %auth_user.external_id,
        plan_type = %req.plan_type,
        plan_option = %req.plan_option,
        "Checkout session created"
    );
    Ok(Json(CheckoutResponse { url }))
}

/// Ask the gateway to cancel the caller's subscription at period end.
/// Local state is unchanged until `subscription.deleted` arrives.
pub async fn cancel_subscription(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
) -> ApiResult<Json<MessageResponse>> {
    let user_id = ensure_user(&state, &auth_user).await?;

    let mut tx = state.store.begin().await?;
    let subscription = state
        .store
        .latest_active_subscription(&mut tx, user_id)
        .await?;
    tx.commit().await?;

    let Some(subscription) = subscription else {
        return Err(ApiError::NotFound("No active subscription".into()));
    };

    state
        .gateway
        .cancel_at_period_end(&subscription.pg_subscription_id)
        .await?;

    Ok(Json(MessageResponse {
        message: "Subscription will be cancelled at the end of the current billing period"
            .to_string(),
    }))
}

/// Current spendable token balance.
pub async fn get_balance(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
) -> ApiResult<Json<BalanceResponse>> {
    let user_id = ensure_user(&state, &auth_user).await?;
    let balance = state.ledger.balance(user_id).await?;
    Ok(Json(BalanceResponse { balance }))
}
