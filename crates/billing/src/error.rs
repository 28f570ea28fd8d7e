//! Error types for the billing core.

use thiserror::Error;

/// Result alias used throughout the billing crate.
pub type BillingResult<T> = Result<T, BillingError>;

/// Errors surfaced by the billing core.
///
/// The API layer maps these onto the webhook contract: signature failures
/// are client errors and transient failures are surfaced as 5xx so the
/// gateway retries. Conditions that are recovered locally and acknowledged
/// (duplicate event, already-credited invoice, unresolved user) are not
/// errors at all: they come back as [`crate::webhooks::DispatchOutcome`]
/// values and `GrantOutcome::already_credited`.
#[derive(Debug, Error)]
pub enum BillingError {
    #[error("webhook signature verification failed")]
    BadSignature,

    #[error("insufficient tokens: requested {requested}, available {available}")]
    InsufficientTokens { requested: i64, available: i64 },

    #[error("plan key {0} not found in catalog")]
    CatalogMissing(String),

    #[error("no local subscription for gateway subscription {0}")]
    MissingSubscription(String),

    #[error("user {0} is deleted; ledger mutations are blocked")]
    UserDeleted(String),

    #[error("malformed event payload: {0}")]
    MalformedEvent(String),

    #[error("handler deadline exceeded")]
    Deadline,

    #[error("storage error: {0}")]
    Storage(#[from] sqlx::Error),

    #[error("payment gateway error: {0}")]
    Gateway(String),

    #[error("configuration error: {0}")]
    Config(String),
}

impl BillingError {
    /// Whether the gateway should retry delivery of the triggering event.
    ///
    /// Signature and payload problems are client errors; everything
    /// touching storage or the gateway is worth retrying. `CatalogMissing`
    /// is retriable on purpose: operators fix the catalog and the next
    /// delivery succeeds.
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            BillingError::Storage(_)
                | BillingError::Gateway(_)
                | BillingError::Deadline
                | BillingError::CatalogMissing(_)
                | BillingError::MissingSubscription(_)
        )
    }
}

impl From<stripe::StripeError> for BillingError {
    fn from(e: stripe::StripeError) -> Self {
        BillingError::Gateway(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retriable_classification() {
        assert!(BillingError::Gateway("timeout".into()).is_retriable());
        assert!(BillingError::CatalogMissing("price_x".into()).is_retriable());
        assert!(BillingError::Deadline.is_retriable());
        assert!(!BillingError::BadSignature.is_retriable());
        assert!(!BillingError::MalformedEvent("bad json".into()).is_retriable());
    }
}
