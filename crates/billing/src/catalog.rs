//! Plan catalog lookups.
//!
//! The catalog tables are the authoritative answer to "how many tokens does
//! this plan grant". They are read-only for the service and populated
//! out-of-band.

use sqlx::{FromRow, PgPool};

use crate::error::{BillingError, BillingResult};

/// A recurring plan as priced by the payment gateway.
#[derive(Debug, Clone, FromRow)]
pub struct SubscriptionPrice {
    pub plan_key: String,
    pub plan_tier: String,
    pub billing_cycle: String,
    pub tokens_per_cycle: i64,
    pub monthly_refill_tokens: Option<i64>,
    pub price_cents: i32,
}

impl SubscriptionPrice {
    /// Tokens per amortized monthly grant for yearly plans.
    ///
    /// Falls back to a twelfth of the cycle grant when the catalog row
    /// predates the explicit refill column.
    pub fn monthly_refill(&self) -> i64 {
        self.monthly_refill_tokens
            .unwrap_or(self.tokens_per_cycle / 12)
    }
}

/// A one-time token pack.
#[derive(Debug, Clone, FromRow)]
pub struct TokenPrice {
    pub plan_key: String,
    pub tier: String,
    pub tokens: i64,
    pub price_cents: i32,
}

/// Read-only access to the price catalog.
#[derive(Clone)]
pub struct Catalog {
    pool: PgPool,
}

impl Catalog {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Look up a recurring plan by its gateway price id.
    pub async fn subscription_price(&self, plan_key: &str) -> BillingResult<SubscriptionPrice> {
        sqlx::query_as(
            r#"
            SELECT plan_key, plan_tier, billing_cycle, tokens_per_cycle,
                   monthly_refill_tokens, price_cents
            FROM subscription_prices
            WHERE plan_key = $1
            "#,
        )
        .bind(plan_key)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| BillingError::CatalogMissing(plan_key.to_string()))
    }

    /// Look up a one-time token pack by its tier name (e.g. "tier1").
    pub async fn token_price_by_tier(&self, tier: &str) -> BillingResult<TokenPrice> {
        sqlx::query_as(
            r#"
            SELECT plan_key, tier, tokens, price_cents
            FROM token_prices
            WHERE tier = $1
            "#,
        )
        .bind(tier)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| BillingError::CatalogMissing(tier.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn monthly_refill_prefers_explicit_column() {
        let price = SubscriptionPrice {
            plan_key: "price_yearly".into(),
            plan_tier: "premium".into(),
            billing_cycle: "yearly".into(),
            tokens_per_cycle: 12_000,
            monthly_refill_tokens: Some(1_000),
            price_cents: 99_00,
        };
        assert_eq!(price.monthly_refill(), 1_000);
    }

    #[test]
    fn monthly_refill_falls_back_to_twelfth() {
        let price = SubscriptionPrice {
            plan_key: "price_yearly".into(),
            plan_tier: "premium".into(),
            billing_cycle: "yearly".into(),
            tokens_per_cycle: 12_010,
            monthly_refill_tokens: None,
            price_cents: 99_00,
        };
        // Integer floor, not rounding.
        assert_eq!(price.monthly_refill(), 1_000);
    }
}
