//! Environment-driven configuration for the billing core.

use std::time::Duration;

use sqlx::postgres::{PgConnectOptions, PgPoolOptions};
use sqlx::PgPool;

use crate::error::{BillingError, BillingResult};

/// Configuration shared by the API server and the worker.
///
/// All required variables are validated up front so a misconfigured
/// process fails at startup instead of on the first webhook.
#[derive(Debug, Clone)]
pub struct BillingConfig {
    /// Credential used for outbound payment-gateway calls.
    pub pg_secret_key: String,
    /// Signing secret for inbound webhook verification.
    pub pg_webhook_secret: String,
    /// Ledger store connection URL.
    pub storage_url: String,
    /// Service credential for the ledger store; applied as the connection
    /// password on top of `storage_url`.
    pub storage_service_key: String,
    /// Base URL for checkout success/cancel redirects.
    pub site_domain: String,
    /// Tokens granted per successful referral; 0 disables referrals.
    pub referral_token_amount: i64,
    /// Optional out-of-band alert webhook.
    pub alert_channel_webhook_url: Option<String>,
}

impl BillingConfig {
    pub fn from_env() -> BillingResult<Self> {
        Ok(Self {
            pg_secret_key: require("PG_SECRET_KEY")?,
            pg_webhook_secret: require("PG_WEBHOOK_SECRET")?,
            storage_url: require("STORAGE_URL")?,
            storage_service_key: require("STORAGE_SERVICE_KEY")?,
            site_domain: require("SITE_DOMAIN")?,
            referral_token_amount: optional_int("REFERRAL_TOKEN_AMOUNT", 0)?,
            alert_channel_webhook_url: std::env::var("ALERT_CHANNEL_WEBHOOK_URL").ok(),
        })
    }

    /// Whether referral rewards are enabled.
    pub fn referrals_enabled(&self) -> bool {
        self.referral_token_amount > 0
    }

    /// Build the ledger-store connection pool.
    pub async fn create_pool(&self) -> BillingResult<PgPool> {
        let options: PgConnectOptions = self
            .storage_url
            .parse()
            .map_err(|e| BillingError::Config(format!("invalid STORAGE_URL: {e}")))?;
        let options = options.password(&self.storage_service_key);

        let pool = PgPoolOptions::new()
            .max_connections(10)
            .acquire_timeout(Duration::from_secs(5))
            .connect_with(options)
            .await?;

        Ok(pool)
    }
}

fn require(name: &str) -> BillingResult<String> {
    match std::env::var(name) {
        Ok(v) if !v.trim().is_empty() => Ok(v),
        _ => Err(BillingError::Config(format!("{name} must be set"))),
    }
}

fn optional_int(name: &str, default: i64) -> BillingResult<i64> {
    match std::env::var(name) {
        Ok(v) => v
            .trim()
            .parse()
            .map_err(|_| BillingError::Config(format!("{name} must be an integer, got {v:?}"))),
        Err(_) => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Env-var tests mutate process state; keep each key unique per test.

    #[test]
    fn missing_required_is_config_error() {
        std::env::remove_var("PG_SECRET_KEY");
        let err = require("PG_SECRET_KEY").unwrap_err();
        assert!(matches!(err, BillingError::Config(_)));
    }

    #[test]
    fn blank_required_is_config_error() {
        std::env::set_var("LEDGERLY_TEST_BLANK", "   ");
        assert!(require("LEDGERLY_TEST_BLANK").is_err());
    }

    #[test]
    fn referral_amount_defaults_to_disabled() {
        std::env::remove_var("LEDGERLY_TEST_REFERRAL");
        assert_eq!(optional_int("LEDGERLY_TEST_REFERRAL", 0).unwrap(), 0);
    }

    #[test]
    fn referral_amount_parses() {
        std::env::set_var("LEDGERLY_TEST_REFERRAL_SET", "250");
        assert_eq!(optional_int("LEDGERLY_TEST_REFERRAL_SET", 0).unwrap(), 250);
    }

    #[test]
    fn referral_amount_rejects_garbage() {
        std::env::set_var("LEDGERLY_TEST_REFERRAL_BAD", "lots");
        assert!(optional_int("LEDGERLY_TEST_REFERRAL_BAD", 0).is_err());
    }
}
