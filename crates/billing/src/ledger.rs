//! Token ledger: grants, FIFO-by-expiry consumption, expiry, balance.
//!
//! Every balance-affecting operation writes a signed-delta journal entry
//! with a stable reason, so debugging a user is a single scan of
//! `token_events`.

use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};
use crate::store::{BatchInsert, LedgerStore, StoreTx};
use crate::types::{BatchOrigin, BatchRow, TokenEventReason};

/// How `consume` behaves when the balance cannot cover the request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConsumeMode {
    /// Abort and report `InsufficientTokens` (the default).
    #[default]
    AllOrNothing,
    /// Take what is available and report the partial amount.
    BestEffort,
}

/// Outcome of a grant.
#[derive(Debug, Clone, Copy)]
pub struct GrantOutcome {
    pub batch_id: i64,
    /// True when the invoice-id idempotency anchor fired and no new
    /// credit was created.
    pub already_credited: bool,
}

/// One step of a computed consumption plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConsumptionStep {
    pub batch_id: i64,
    pub take: i64,
}

/// Compute the FIFO consumption plan over already-ordered batches.
///
/// Batches must arrive in spend order (`expires_at ASC, id ASC`). Returns
/// the per-batch takes plus the total taken; the caller decides whether a
/// partial fill is acceptable.
pub fn plan_consumption(batches: &[BatchRow], amount: i64) -> (Vec<ConsumptionStep>, i64) {
    let mut steps = Vec::new();
    let mut taken = 0;
    for batch in batches {
        if taken >= amount {
            break;
        }
        let take = (amount - taken).min(batch.remaining());
        if take > 0 {
            steps.push(ConsumptionStep {
                batch_id: batch.id,
                take,
            });
            taken += take;
        }
    }
    (steps, taken)
}

/// The token ledger.
#[derive(Clone)]
pub struct TokenLedger {
    store: LedgerStore,
}

impl TokenLedger {
    pub fn new(store: LedgerStore) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &LedgerStore {
        &self.store
    }

    /// Grant a credit batch and its positive journal entry inside the
    /// caller's transaction.
    ///
    /// When `invoice_id` collides with an existing batch the grant is a
    /// no-op success carrying the existing batch id.
    #[allow(clippy::too_many_arguments)]
    pub async fn grant_batch(
        &self,
        tx: &mut StoreTx<'_>,
        user_id: Uuid,
        origin: BatchOrigin,
        amount: i64,
        expires_at: OffsetDateTime,
        invoice_id: Option<&str>,
        note: &str,
        reason: TokenEventReason,
    ) -> BillingResult<GrantOutcome> {
        self.store.ensure_user_mutable(tx, user_id).await?;

        let insert = self
            .store
            .insert_batch(tx, user_id, origin, amount, expires_at, invoice_id, note)
            .await?;

        match insert {
            BatchInsert::Inserted(batch_id) => {
                self.store
                    .append_token_event(tx, user_id, batch_id, amount, reason)
                    .await?;
                tracing::info!(
                    user_id = %user_id,
                    batch_id = batch_id,
                    amount = amount,
                    source = origin.source_tag(),
                    reason = %reason,
                    "Granted token batch"
                );
                Ok(GrantOutcome {
                    batch_id,
                    already_credited: false,
                })
            }
            BatchInsert::AlreadyCredited(batch_id) => {
                tracing::info!(
                    user_id = %user_id,
                    batch_id = batch_id,
                    invoice_id = ?invoice_id,
                    "Invoice already credited, grant is a no-op"
                );
                Ok(GrantOutcome {
                    batch_id,
                    already_credited: true,
                })
            }
        }
    }

    /// Consume tokens FIFO by earliest expiry, tie-broken by batch id,
    /// across all active non-expired batches regardless of source.
    ///
    /// Runs in its own transaction; concurrent consumes for the same user
    /// serialize on the batch row locks. Callers may bound the call with
    /// `tokio::time::timeout`; dropping the future aborts the transaction
    /// and nothing is debited.
    pub async fn consume(
        &self,
        user_id: Uuid,
        amount: i64,
        reason: TokenEventReason,
        mode: ConsumeMode,
    ) -> BillingResult<i64> {
        if amount <= 0 {
            return Ok(0);
        }

        let mut tx = self.store.begin().await?;
        self.store.ensure_user_mutable(&mut tx, user_id).await?;

        let now = OffsetDateTime::now_utc();
        let batches = self
            .store
            .lock_active_batches_fifo(&mut tx, user_id, now)
            .await?;

        let (steps, taken) = plan_consumption(&batches, amount);

        if taken < amount && mode == ConsumeMode::AllOrNothing {
            // Roll back: no partial debit.
            tx.rollback().await?;
            return Err(BillingError::InsufficientTokens {
                requested: amount,
                available: taken,
            });
        }

        for step in &steps {
            self.store
                .apply_batch_consumption(&mut tx, step.batch_id, step.take)
                .await?;
            self.store
                .append_token_event(&mut tx, user_id, step.batch_id, -step.take, reason)
                .await?;
        }

        tx.commit().await?;

        tracing::debug!(
            user_id = %user_id,
            requested = amount,
            consumed = taken,
            batches = steps.len(),
            "Consumed tokens"
        );
        Ok(taken)
    }

    /// Expire every active batch with `expires_at <= now`, journaling the
    /// forfeited remainder so the per-batch journal sum stays balanced.
    ///
    /// Returns the number of batches deactivated.
    pub async fn expire_due(&self, now: OffsetDateTime) -> BillingResult<u64> {
        let mut tx = self.store.begin().await?;
        let due = self.store.lock_expired_batches(&mut tx, now).await?;
        let count = due.len() as u64;

        for batch in &due {
            self.store.deactivate_batch(&mut tx, batch.id).await?;
            let remaining = batch.remaining();
            if remaining > 0 {
                self.store
                    .append_token_event(
                        &mut tx,
                        batch.user_id,
                        batch.id,
                        -remaining,
                        TokenEventReason::Expiry,
                    )
                    .await?;
            }
        }

        tx.commit().await?;

        if count > 0 {
            tracing::info!(batches = count, "Expired stale token batches");
        }
        Ok(count)
    }

    /// Current spendable balance for a user.
    pub async fn balance(&self, user_id: Uuid) -> BillingResult<i64> {
        self.store.balance(user_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::Duration;

    fn batch(id: i64, amount: i64, consumed: i64, expires_in_secs: i64) -> BatchRow {
        BatchRow {
            id,
            user_id: Uuid::new_v4(),
            source: "purchase".into(),
            subscription_id: None,
            purchase_id: None,
            invoice_id: None,
            amount,
            consumed,
            expires_at: OffsetDateTime::now_utc() + Duration::seconds(expires_in_secs),
            is_active: true,
            note: String::new(),
        }
    }

    // Batches arrive already ordered by (expires_at, id); the planner
    // trusts that ordering.
    fn ordered(mut batches: Vec<BatchRow>) -> Vec<BatchRow> {
        batches.sort_by(|a, b| a.expires_at.cmp(&b.expires_at).then(a.id.cmp(&b.id)));
        batches
    }

    #[test]
    fn fifo_across_mixed_origins() {
        // B1 {10, T+1s}, B2 {50, T+5s}, B3 {30, T+2s}; consume 40 takes
        // 10 from B1, then 30 from B3, leaving B2 untouched.
        let b1 = batch(1, 10, 0, 1);
        let b2 = batch(2, 50, 0, 5);
        let b3 = batch(3, 30, 0, 2);
        let batches = ordered(vec![b1, b2, b3]);

        let (steps, taken) = plan_consumption(&batches, 40);
        assert_eq!(taken, 40);
        assert_eq!(
            steps,
            vec![
                ConsumptionStep { batch_id: 1, take: 10 },
                ConsumptionStep { batch_id: 3, take: 30 },
            ]
        );
    }

    #[test]
    fn partially_consumed_batches_yield_their_remainder() {
        let batches = vec![batch(1, 100, 60, 10), batch(2, 100, 0, 20)];
        let (steps, taken) = plan_consumption(&batches, 50);
        assert_eq!(taken, 50);
        assert_eq!(
            steps,
            vec![
                ConsumptionStep { batch_id: 1, take: 40 },
                ConsumptionStep { batch_id: 2, take: 10 },
            ]
        );
    }

    #[test]
    fn insufficient_balance_reports_available() {
        let batches = vec![batch(1, 10, 5, 10)];
        let (steps, taken) = plan_consumption(&batches, 100);
        assert_eq!(taken, 5);
        assert_eq!(steps.len(), 1);
    }

    #[test]
    fn exhausted_batches_are_skipped() {
        let batches = vec![batch(1, 10, 10, 1), batch(2, 20, 0, 2)];
        let (steps, taken) = plan_consumption(&batches, 15);
        assert_eq!(taken, 15);
        assert_eq!(steps, vec![ConsumptionStep { batch_id: 2, take: 15 }]);
    }

    #[test]
    fn zero_request_is_empty_plan() {
        let batches = vec![batch(1, 10, 0, 1)];
        let (steps, taken) = plan_consumption(&batches, 0);
        assert!(steps.is_empty());
        assert_eq!(taken, 0);
    }

    #[test]
    fn tie_on_expiry_breaks_by_id() {
        let ts = OffsetDateTime::now_utc() + Duration::seconds(5);
        let mut b1 = batch(7, 10, 0, 0);
        b1.expires_at = ts;
        let mut b2 = batch(3, 10, 0, 0);
        b2.expires_at = ts;
        let batches = ordered(vec![b1, b2]);

        let (steps, taken) = plan_consumption(&batches, 15);
        assert_eq!(taken, 15);
        assert_eq!(
            steps,
            vec![
                ConsumptionStep { batch_id: 3, take: 10 },
                ConsumptionStep { batch_id: 7, take: 5 },
            ]
        );
    }
}
