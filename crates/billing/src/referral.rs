//! Referral rewards.
//!
//! A referral is rewarded at most once, when the referred user's first
//! revenue event lands (first paid `subscription_create` invoice or first
//! completed one-time purchase). Renewals never trigger rewards.

use time::{Duration, OffsetDateTime};
use uuid::Uuid;

use crate::error::BillingResult;
use crate::ledger::TokenLedger;
use crate::store::{LedgerStore, StoreTx};
use crate::types::{BatchOrigin, ReferralRow, TokenEventReason, PURCHASE_EXPIRY_DAYS};

#[derive(Clone)]
pub struct ReferralService {
    store: LedgerStore,
    /// Tokens granted per successful referral; 0 disables rewards.
    reward_amount: i64,
}

impl ReferralService {
    pub fn new(store: LedgerStore, reward_amount: i64) -> Self {
        Self {
            store,
            reward_amount,
        }
    }

    pub fn enabled(&self) -> bool {
        self.reward_amount > 0
    }

    /// Record that `referred` signed up via `referrer`. Idempotent: a user
    /// can only ever be referred once.
    pub async fn record(
        &self,
        tx: &mut StoreTx<'_>,
        referrer_user_id: Uuid,
        referred_user_id: Uuid,
    ) -> BillingResult<bool> {
        let row: Option<(Uuid,)> = sqlx::query_as(
            r#"
            INSERT INTO referrals (referrer_user_id, referred_user_id)
            VALUES ($1, $2)
            ON CONFLICT (referred_user_id) DO NOTHING
            RETURNING id
            "#,
        )
        .bind(referrer_user_id)
        .bind(referred_user_id)
        .fetch_optional(&mut **tx)
        .await?;
        Ok(row.is_some())
    }

    /// Grant the pending reward for a referred user, if any.
    ///
    /// Runs inside the caller's event transaction; the `is_rewarded` flag
    /// is flipped under the same row lock that reads it, so concurrent
    /// events for the same referred user cannot double-pay.
    pub async fn apply_pending_reward(
        &self,
        tx: &mut StoreTx<'_>,
        ledger: &TokenLedger,
        referred_user_id: Uuid,
    ) -> BillingResult<Option<i64>> {
        if !self.enabled() {
            return Ok(None);
        }

        let pending: Option<ReferralRow> = sqlx::query_as(
            r#"
            SELECT id, referrer_user_id, referred_user_id, is_rewarded
            FROM referrals
            WHERE referred_user_id = $1 AND NOT is_rewarded
            FOR UPDATE
            "#,
        )
        .bind(referred_user_id)
        .fetch_optional(&mut **tx)
        .await?;

        let Some(referral) = pending else {
            return Ok(None);
        };

        let expires_at = OffsetDateTime::now_utc() + Duration::days(PURCHASE_EXPIRY_DAYS);
        let grant = ledger
            .grant_batch(
                tx,
                referral.referrer_user_id,
                BatchOrigin::Referral(referral.referrer_user_id),
                self.reward_amount,
                expires_at,
                None,
                "referral-reward",
                TokenEventReason::ReferralReward,
            )
            .await?;

        sqlx::query("UPDATE referrals SET is_rewarded = TRUE WHERE id = $1")
            .bind(referral.id)
            .execute(&mut **tx)
            .await?;

        tracing::info!(
            referrer = %referral.referrer_user_id,
            referred = %referred_user_id,
            amount = self.reward_amount,
            batch_id = grant.batch_id,
            "Referral reward granted"
        );
        Ok(Some(grant.batch_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::postgres::PgPoolOptions;

    #[tokio::test]
    async fn zero_amount_disables_rewards() {
        let pool = PgPoolOptions::new().connect_lazy("postgres://localhost/x").unwrap();
        let service = ReferralService::new(LedgerStore::new(pool), 0);
        assert!(!service.enabled());
    }
}
