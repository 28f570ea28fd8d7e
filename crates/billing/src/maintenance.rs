//! Daily maintenance sweep.
//!
//! Expires stale batches, deactivates subscriptions whose billing period
//! ended, and performs the yearly-plan monthly refill safety net. Each
//! subscription is processed in its own transaction; a per-subscription
//! failure is logged and does not abort the pass. Re-runs in the same
//! calendar month are no-ops for the refill step.

use time::OffsetDateTime;
use uuid::Uuid;

use crate::catalog::Catalog;
use crate::error::BillingResult;
use crate::ledger::TokenLedger;
use crate::store::LedgerStore;
use crate::subscription::SubscriptionService;
use crate::types::{add_one_month, same_calendar_month, BatchOrigin, TokenEventReason};

/// Counters for one pass, for the summary log line.
#[derive(Debug, Default, Clone, Copy)]
pub struct MaintenanceSummary {
    pub batches_expired: u64,
    pub subscriptions_deactivated: u64,
    pub refills_granted: u64,
    pub errors: u64,
}

/// Whether a yearly subscription is owed a refill this calendar month.
pub fn needs_monthly_refill(last_refill: Option<OffsetDateTime>, now: OffsetDateTime) -> bool {
    match last_refill {
        None => true,
        Some(last) => !same_calendar_month(last, now),
    }
}

pub struct MaintenanceWorker {
    store: LedgerStore,
    ledger: TokenLedger,
    subscriptions: SubscriptionService,
    catalog: Catalog,
}

impl MaintenanceWorker {
    pub fn new(store: LedgerStore) -> Self {
        let ledger = TokenLedger::new(store.clone());
        let subscriptions = SubscriptionService::new(store.clone());
        let catalog = Catalog::new(store.pool().clone());
        Self {
            store,
            ledger,
            subscriptions,
            catalog,
        }
    }

    /// Run one full pass.
    pub async fn run_pass(&self, now: OffsetDateTime) -> BillingResult<MaintenanceSummary> {
        let mut summary = MaintenanceSummary::default();

        summary.batches_expired = self.ledger.expire_due(now).await?;

        self.deactivate_ended_subscriptions(now, &mut summary).await?;
        self.run_yearly_refills(now, &mut summary).await?;

        tracing::info!(
            batches_expired = summary.batches_expired,
            subscriptions_deactivated = summary.subscriptions_deactivated,
            refills_granted = summary.refills_granted,
            errors = summary.errors,
            "Maintenance pass complete"
        );
        Ok(summary)
    }

    /// Deactivate every active subscription whose period ended.
    async fn deactivate_ended_subscriptions(
        &self,
        now: OffsetDateTime,
        summary: &mut MaintenanceSummary,
    ) -> BillingResult<()> {
        let ended: Vec<(Uuid, String)> = sqlx::query_as(
            r#"
            SELECT id, pg_subscription_id
            FROM subscriptions
            WHERE is_active AND current_period_end IS NOT NULL AND current_period_end < $1
            "#,
        )
        .bind(now)
        .fetch_all(self.store.pool())
        .await?;

        for (id, pg_subscription_id) in ended {
            let result = async {
                let mut tx = self.store.begin().await?;
                // Re-check under lock; a renewal may have landed since the scan.
                if let Some(row) = self
                    .store
                    .lock_subscription_by_pg_id(&mut tx, &pg_subscription_id)
                    .await?
                {
                    let still_ended = row.is_active
                        && row.current_period_end.map(|end| end < now).unwrap_or(false);
                    if still_ended {
                        self.subscriptions.on_period_ended(&mut tx, &row).await?;
                        tx.commit().await?;
                        return Ok(true);
                    }
                }
                tx.rollback().await?;
                Ok::<bool, crate::error::BillingError>(false)
            }
            .await;

            match result {
                Ok(true) => summary.subscriptions_deactivated += 1,
                Ok(false) => {}
                Err(e) => {
                    summary.errors += 1;
                    tracing::error!(subscription_id = %id, error = %e, "Failed to deactivate ended subscription");
                }
            }
        }
        Ok(())
    }

    /// Grant this month's amortized batch to every active yearly
    /// subscription that has not been refilled this calendar month.
    async fn run_yearly_refills(
        &self,
        now: OffsetDateTime,
        summary: &mut MaintenanceSummary,
    ) -> BillingResult<()> {
        let candidates: Vec<(Uuid, String)> = sqlx::query_as(
            r#"
            SELECT id, pg_subscription_id
            FROM subscriptions
            WHERE is_active AND billing_cycle = 'yearly'
            "#,
        )
        .fetch_all(self.store.pool())
        .await?;

        for (id, pg_subscription_id) in candidates {
            let result = self.refill_one(&pg_subscription_id, now).await;
            match result {
                Ok(true) => summary.refills_granted += 1,
                Ok(false) => {}
                Err(e) => {
                    summary.errors += 1;
                    tracing::error!(subscription_id = %id, error = %e, "Yearly refill failed");
                }
            }
        }
        Ok(())
    }

    async fn refill_one(
        &self,
        pg_subscription_id: &str,
        now: OffsetDateTime,
    ) -> BillingResult<bool> {
        let mut tx = self.store.begin().await?;

        let Some(row) = self
            .store
            .lock_subscription_by_pg_id(&mut tx, pg_subscription_id)
            .await?
        else {
            tx.rollback().await?;
            return Ok(false);
        };

        // The same-month check under the row lock is what makes re-runs safe.
        if !row.is_active || !needs_monthly_refill(row.last_monthly_refill, now) {
            tx.rollback().await?;
            return Ok(false);
        }

        let amount = match self.catalog.subscription_price(&row.plan_key).await {
            Ok(price) => price.monthly_refill(),
            Err(_) => row.tokens_per_cycle / 12,
        };
        if amount <= 0 {
            tx.rollback().await?;
            return Ok(false);
        }

        self.ledger
            .grant_batch(
                &mut tx,
                row.user_id,
                BatchOrigin::Subscription(row.id),
                amount,
                add_one_month(now),
                None,
                "yearly-monthly-refill (cron)",
                TokenEventReason::SubscriptionRefill,
            )
            .await?;
        self.store.stamp_monthly_refill(&mut tx, row.id, now).await?;

        tx.commit().await?;

        tracing::info!(
            user_id = %row.user_id,
            subscription_id = %row.id,
            amount = amount,
            "Yearly-monthly refill granted"
        );
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    #[test]
    fn never_refilled_is_due() {
        assert!(needs_monthly_refill(None, datetime!(2025-06-15 00:00 UTC)));
    }

    #[test]
    fn same_month_is_not_due() {
        let last = datetime!(2025-06-01 08:00 UTC);
        let now = datetime!(2025-06-30 23:59 UTC);
        assert!(!needs_monthly_refill(Some(last), now));
    }

    #[test]
    fn next_month_is_due() {
        let last = datetime!(2025-06-30 23:59 UTC);
        let now = datetime!(2025-07-01 00:00 UTC);
        assert!(needs_monthly_refill(Some(last), now));
    }

    #[test]
    fn same_month_next_year_is_due() {
        let last = datetime!(2025-06-15 00:00 UTC);
        let now = datetime!(2026-06-15 00:00 UTC);
        assert!(needs_monthly_refill(Some(last), now));
    }
}
