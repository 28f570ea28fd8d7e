//! API server configuration.

use ledgerly_billing::{BillingConfig, BillingError, BillingResult};

/// Configuration for the API binary: the shared billing configuration
/// plus the HTTP-surface specifics.
#[derive(Debug, Clone)]
pub struct ApiConfig {
    pub billing: BillingConfig,
    /// Listen address, default `0.0.0.0:8080`.
    pub bind_addr: String,
    /// HS256 secret for verifying bearer tokens issued by the auth
    /// provider; the `sub` claim is the external user id.
    pub auth_jwt_secret: String,
}

impl ApiConfig {
    pub fn from_env() -> BillingResult<Self> {
        let billing = BillingConfig::from_env()?;
        let bind_addr =
            std::env::var("BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:8080".to_string());
        let auth_jwt_secret = std::env::var("AUTH_JWT_SECRET")
            .ok()
            .filter(|v| !v.trim().is_empty())
            .ok_or_else(|| BillingError::Config("AUTH_JWT_SECRET must be set".into()))?;
        Ok(Self {
            billing,
            bind_addr,
            auth_jwt_secret,
        })
    }
}
