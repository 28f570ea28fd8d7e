//! Ledger store: durable persistence and transactional operations.
//!
//! Every externally-driven mutation is wrapped in a single transaction so
//! the data-model invariants hold. The store exposes the operations the
//! rest of the system consumes; callers own the transaction boundary.

use sqlx::{PgPool, Postgres, Transaction};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};
use crate::types::{BatchOrigin, BatchRow, SubscriptionRow, TokenEventReason, UserRow};

/// Transaction handle used by all transactional store operations.
pub type StoreTx<'a> = Transaction<'a, Postgres>;

/// Fields for `upsert_subscription_by_pg_id`.
#[derive(Debug, Clone)]
pub struct SubscriptionUpsert<'a> {
    pub user_id: Uuid,
    pub plan_key: &'a str,
    pub plan_tier: &'a str,
    pub billing_cycle: &'a str,
    pub pg_subscription_id: &'a str,
    pub current_period_start: Option<OffsetDateTime>,
    pub current_period_end: Option<OffsetDateTime>,
    pub tokens_per_cycle: i64,
    pub price_cents: i32,
}

/// Outcome of a batch insert guarded by the invoice-id unique index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchInsert {
    Inserted(i64),
    /// The invoice was already credited; carries the existing batch id.
    AlreadyCredited(i64),
}

impl BatchInsert {
    pub fn batch_id(&self) -> i64 {
        match self {
            BatchInsert::Inserted(id) | BatchInsert::AlreadyCredited(id) => *id,
        }
    }
}

/// Durable persistence for users, subscriptions, purchases, batches, the
/// event log, and the token journal.
#[derive(Clone)]
pub struct LedgerStore {
    pool: PgPool,
}

impl LedgerStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn begin(&self) -> BillingResult<StoreTx<'_>> {
        Ok(self.pool.begin().await?)
    }

    // =========================================================================
    // Users
    // =========================================================================

    /// Create or refresh a user keyed by their external identity.
    ///
    /// Called on first authenticated interaction; later calls keep the
    /// email current.
    pub async fn upsert_user_by_external_id(
        &self,
        tx: &mut StoreTx<'_>,
        external_id: &str,
        email: &str,
    ) -> BillingResult<Uuid> {
        let (id,): (Uuid,) = sqlx::query_as(
            r#"
            INSERT INTO users (user_id, email)
            VALUES ($1, $2)
            ON CONFLICT (user_id) DO UPDATE SET
                email = EXCLUDED.email,
                updated_at = NOW()
            RETURNING id
            "#,
        )
        .bind(external_id)
        .bind(email)
        .fetch_one(&mut **tx)
        .await?;
        Ok(id)
    }

    /// Record the gateway customer id on first payment event.
    pub async fn bind_pg_customer(
        &self,
        tx: &mut StoreTx<'_>,
        user_id: Uuid,
        pg_customer_id: &str,
    ) -> BillingResult<()> {
        sqlx::query(
            r#"
            UPDATE users
            SET pg_customer_id = $2, updated_at = NOW()
            WHERE id = $1 AND (pg_customer_id IS NULL OR pg_customer_id = $2)
            "#,
        )
        .bind(user_id)
        .bind(pg_customer_id)
        .execute(&mut **tx)
        .await?;
        Ok(())
    }

    pub async fn find_user_by_external_id(
        &self,
        tx: &mut StoreTx<'_>,
        external_id: &str,
    ) -> BillingResult<Option<UserRow>> {
        Ok(sqlx::query_as(
            r#"
            SELECT id, user_id, email, pg_customer_id,
                   has_active_subscription, has_payment_issue, is_deleted
            FROM users
            WHERE user_id = $1
            "#,
        )
        .bind(external_id)
        .fetch_optional(&mut **tx)
        .await?)
    }

    pub async fn find_user_by_pg_customer(
        &self,
        tx: &mut StoreTx<'_>,
        pg_customer_id: &str,
    ) -> BillingResult<Option<UserRow>> {
        Ok(sqlx::query_as(
            r#"
            SELECT id, user_id, email, pg_customer_id,
                   has_active_subscription, has_payment_issue, is_deleted
            FROM users
            WHERE pg_customer_id = $1
            "#,
        )
        .bind(pg_customer_id)
        .fetch_optional(&mut **tx)
        .await?)
    }

    pub async fn find_user_by_email(
        &self,
        tx: &mut StoreTx<'_>,
        email: &str,
    ) -> BillingResult<Option<UserRow>> {
        Ok(sqlx::query_as(
            r#"
            SELECT id, user_id, email, pg_customer_id,
                   has_active_subscription, has_payment_issue, is_deleted
            FROM users
            WHERE email = $1
            "#,
        )
        .bind(email)
        .fetch_optional(&mut **tx)
        .await?)
    }

    /// Reject mutations for soft-deleted users.
    pub async fn ensure_user_mutable(
        &self,
        tx: &mut StoreTx<'_>,
        user_id: Uuid,
    ) -> BillingResult<()> {
        let (is_deleted,): (bool,) =
            sqlx::query_as("SELECT is_deleted FROM users WHERE id = $1")
                .bind(user_id)
                .fetch_one(&mut **tx)
                .await?;
        if is_deleted {
            return Err(BillingError::UserDeleted(user_id.to_string()));
        }
        Ok(())
    }

    /// Update the denormalized access flags. `None` leaves a flag untouched.
    pub async fn update_user_flags(
        &self,
        tx: &mut StoreTx<'_>,
        user_id: Uuid,
        has_active_subscription: Option<bool>,
        has_payment_issue: Option<bool>,
    ) -> BillingResult<()> {
        sqlx::query(
            r#"
            UPDATE users
            SET has_active_subscription = COALESCE($2, has_active_subscription),
                has_payment_issue = COALESCE($3, has_payment_issue),
                updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(user_id)
        .bind(has_active_subscription)
        .bind(has_payment_issue)
        .execute(&mut **tx)
        .await?;
        Ok(())
    }

    // =========================================================================
    // Subscriptions
    // =========================================================================

    /// Upsert a subscription keyed by the gateway subscription id.
    ///
    /// Returns the local id and whether this was a fresh insert. On grant
    /// the caller deactivates any older active row for the same user so
    /// the at-most-one-active invariant holds.
    pub async fn upsert_subscription_by_pg_id(
        &self,
        tx: &mut StoreTx<'_>,
        fields: &SubscriptionUpsert<'_>,
    ) -> BillingResult<(Uuid, bool)> {
        let (id, was_insert): (Uuid, bool) = sqlx::query_as(
            r#"
            INSERT INTO subscriptions (
                user_id, plan_key, plan_tier, billing_cycle, pg_subscription_id,
                is_active, current_period_start, current_period_end,
                tokens_per_cycle, price_cents
            )
            VALUES ($1, $2, $3, $4, $5, TRUE, $6, $7, $8, $9)
            ON CONFLICT (pg_subscription_id) DO UPDATE SET
                plan_key = EXCLUDED.plan_key,
                plan_tier = EXCLUDED.plan_tier,
                billing_cycle = EXCLUDED.billing_cycle,
                current_period_start = EXCLUDED.current_period_start,
                current_period_end = EXCLUDED.current_period_end,
                tokens_per_cycle = EXCLUDED.tokens_per_cycle,
                price_cents = EXCLUDED.price_cents,
                updated_at = NOW()
            RETURNING id, (xmax = 0) AS was_insert
            "#,
        )
        .bind(fields.user_id)
        .bind(fields.plan_key)
        .bind(fields.plan_tier)
        .bind(fields.billing_cycle)
        .bind(fields.pg_subscription_id)
        .bind(fields.current_period_start)
        .bind(fields.current_period_end)
        .bind(fields.tokens_per_cycle)
        .bind(fields.price_cents)
        .fetch_one(&mut **tx)
        .await?;
        Ok((id, was_insert))
    }

    /// Deactivate every other active subscription for the user, keeping the
    /// at-most-one-active invariant when a new subscription lands.
    pub async fn deactivate_other_subscriptions(
        &self,
        tx: &mut StoreTx<'_>,
        user_id: Uuid,
        keep: Uuid,
    ) -> BillingResult<u64> {
        let result = sqlx::query(
            r#"
            UPDATE subscriptions
            SET is_active = FALSE, updated_at = NOW()
            WHERE user_id = $1 AND id != $2 AND is_active
            "#,
        )
        .bind(user_id)
        .bind(keep)
        .execute(&mut **tx)
        .await?;
        Ok(result.rows_affected())
    }

    pub async fn find_local_subscription_id(
        &self,
        tx: &mut StoreTx<'_>,
        pg_subscription_id: &str,
    ) -> BillingResult<Option<Uuid>> {
        let row: Option<(Uuid,)> =
            sqlx::query_as("SELECT id FROM subscriptions WHERE pg_subscription_id = $1")
                .bind(pg_subscription_id)
                .fetch_optional(&mut **tx)
                .await?;
        Ok(row.map(|(id,)| id))
    }

    /// Fetch-and-lock a subscription row by gateway id. Handlers for the
    /// same subscription serialize on this lock.
    pub async fn lock_subscription_by_pg_id(
        &self,
        tx: &mut StoreTx<'_>,
        pg_subscription_id: &str,
    ) -> BillingResult<Option<SubscriptionRow>> {
        Ok(sqlx::query_as(
            r#"
            SELECT id, user_id, plan_key, plan_tier, billing_cycle,
                   pg_subscription_id, is_active, current_period_start,
                   current_period_end, tokens_per_cycle, price_cents,
                   last_monthly_refill, payment_failure_reason
            FROM subscriptions
            WHERE pg_subscription_id = $1
            FOR UPDATE
            "#,
        )
        .bind(pg_subscription_id)
        .fetch_optional(&mut **tx)
        .await?)
    }

    /// Latest active subscription for a user (cancel flow, dunning lookups).
    pub async fn latest_active_subscription(
        &self,
        tx: &mut StoreTx<'_>,
        user_id: Uuid,
    ) -> BillingResult<Option<SubscriptionRow>> {
        Ok(sqlx::query_as(
            r#"
            SELECT id, user_id, plan_key, plan_tier, billing_cycle,
                   pg_subscription_id, is_active, current_period_start,
                   current_period_end, tokens_per_cycle, price_cents,
                   last_monthly_refill, payment_failure_reason
            FROM subscriptions
            WHERE user_id = $1 AND is_active
            ORDER BY created_at DESC
            LIMIT 1
            "#,
        )
        .bind(user_id)
        .fetch_optional(&mut **tx)
        .await?)
    }

    pub async fn deactivate_subscription(
        &self,
        tx: &mut StoreTx<'_>,
        id: Uuid,
    ) -> BillingResult<()> {
        sqlx::query(
            "UPDATE subscriptions SET is_active = FALSE, updated_at = NOW() WHERE id = $1",
        )
        .bind(id)
        .execute(&mut **tx)
        .await?;
        Ok(())
    }

    pub async fn set_payment_failure(
        &self,
        tx: &mut StoreTx<'_>,
        subscription_id: Uuid,
        reason: &str,
    ) -> BillingResult<()> {
        sqlx::query(
            r#"
            UPDATE subscriptions
            SET payment_failure_reason = $2, updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(subscription_id)
        .bind(reason)
        .execute(&mut **tx)
        .await?;
        Ok(())
    }

    pub async fn clear_payment_failure(
        &self,
        tx: &mut StoreTx<'_>,
        subscription_id: Uuid,
    ) -> BillingResult<()> {
        sqlx::query(
            r#"
            UPDATE subscriptions
            SET payment_failure_reason = NULL, updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(subscription_id)
        .execute(&mut **tx)
        .await?;
        Ok(())
    }

    pub async fn stamp_monthly_refill(
        &self,
        tx: &mut StoreTx<'_>,
        subscription_id: Uuid,
        at: OffsetDateTime,
    ) -> BillingResult<()> {
        sqlx::query(
            r#"
            UPDATE subscriptions
            SET last_monthly_refill = $2, updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(subscription_id)
        .bind(at)
        .execute(&mut **tx)
        .await?;
        Ok(())
    }

    // =========================================================================
    // Purchases
    // =========================================================================

    /// Insert a one-time purchase, idempotent on the gateway purchase id.
    /// Returns `None` when the purchase was recorded before.
    #[allow(clippy::too_many_arguments)]
    pub async fn insert_purchase(
        &self,
        tx: &mut StoreTx<'_>,
        user_id: Uuid,
        plan_tier: &str,
        pg_purchase_id: &str,
        amount_tokens: i64,
        discount_cents: i32,
        period_start: OffsetDateTime,
        period_end: OffsetDateTime,
    ) -> BillingResult<Option<Uuid>> {
        let row: Option<(Uuid,)> = sqlx::query_as(
            r#"
            INSERT INTO purchases (
                user_id, plan_tier, pg_purchase_id, amount_tokens,
                discount_cents, period_start, period_end
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (pg_purchase_id) DO NOTHING
            RETURNING id
            "#,
        )
        .bind(user_id)
        .bind(plan_tier)
        .bind(pg_purchase_id)
        .bind(amount_tokens)
        .bind(discount_cents)
        .bind(period_start)
        .bind(period_end)
        .fetch_optional(&mut **tx)
        .await?;
        Ok(row.map(|(id,)| id))
    }

    // =========================================================================
    // Batches & journal
    // =========================================================================

    /// Insert a credit batch. The `invoice_id` unique index is the
    /// credit-grant idempotency anchor: a conflict means the invoice was
    /// already credited and must be treated as success.
    pub async fn insert_batch(
        &self,
        tx: &mut StoreTx<'_>,
        user_id: Uuid,
        origin: BatchOrigin,
        amount: i64,
        expires_at: OffsetDateTime,
        invoice_id: Option<&str>,
        note: &str,
    ) -> BillingResult<BatchInsert> {
        let row: Option<(i64,)> = sqlx::query_as(
            r#"
            INSERT INTO batches (
                user_id, source, subscription_id, purchase_id,
                invoice_id, amount, expires_at, note
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (invoice_id) DO NOTHING
            RETURNING id
            "#,
        )
        .bind(user_id)
        .bind(origin.source_tag())
        .bind(origin.subscription_id())
        .bind(origin.purchase_id())
        .bind(invoice_id)
        .bind(amount)
        .bind(expires_at)
        .bind(note)
        .fetch_optional(&mut **tx)
        .await?;

        match row {
            Some((id,)) => Ok(BatchInsert::Inserted(id)),
            None => {
                // Conflict is only possible when invoice_id was set.
                let invoice_id = invoice_id.ok_or(BillingError::Storage(sqlx::Error::RowNotFound))?;
                let (id,): (i64,) =
                    sqlx::query_as("SELECT id FROM batches WHERE invoice_id = $1")
                        .bind(invoice_id)
                        .fetch_one(&mut **tx)
                        .await?;
                Ok(BatchInsert::AlreadyCredited(id))
            }
        }
    }

    /// Active, non-expired batches for a user in spend order
    /// (`expires_at ASC, id ASC`) with row locks held for the transaction.
    pub async fn lock_active_batches_fifo(
        &self,
        tx: &mut StoreTx<'_>,
        user_id: Uuid,
        now: OffsetDateTime,
    ) -> BillingResult<Vec<BatchRow>> {
        Ok(sqlx::query_as(
            r#"
            SELECT id, user_id, source, subscription_id, purchase_id,
                   invoice_id, amount, consumed, expires_at, is_active, note
            FROM batches
            WHERE user_id = $1 AND is_active AND expires_at > $2
            ORDER BY expires_at ASC, id ASC
            FOR UPDATE
            "#,
        )
        .bind(user_id)
        .bind(now)
        .fetch_all(&mut **tx)
        .await?)
    }

    /// Batches due for the expiry sweep, locked.
    pub async fn lock_expired_batches(
        &self,
        tx: &mut StoreTx<'_>,
        now: OffsetDateTime,
    ) -> BillingResult<Vec<BatchRow>> {
        Ok(sqlx::query_as(
            r#"
            SELECT id, user_id, source, subscription_id, purchase_id,
                   invoice_id, amount, consumed, expires_at, is_active, note
            FROM batches
            WHERE is_active AND expires_at <= $1
            ORDER BY id ASC
            FOR UPDATE
            "#,
        )
        .bind(now)
        .fetch_all(&mut **tx)
        .await?)
    }

    pub async fn apply_batch_consumption(
        &self,
        tx: &mut StoreTx<'_>,
        batch_id: i64,
        delta: i64,
    ) -> BillingResult<()> {
        sqlx::query("UPDATE batches SET consumed = consumed + $2 WHERE id = $1")
            .bind(batch_id)
            .bind(delta)
            .execute(&mut **tx)
            .await?;
        Ok(())
    }

    pub async fn deactivate_batch(&self, tx: &mut StoreTx<'_>, id: i64) -> BillingResult<()> {
        sqlx::query("UPDATE batches SET is_active = FALSE WHERE id = $1")
            .bind(id)
            .execute(&mut **tx)
            .await?;
        Ok(())
    }

    /// Append a signed-delta entry to the token journal.
    pub async fn append_token_event(
        &self,
        tx: &mut StoreTx<'_>,
        user_id: Uuid,
        batch_id: i64,
        delta: i64,
        reason: TokenEventReason,
    ) -> BillingResult<()> {
        sqlx::query(
            r#"
            INSERT INTO token_events (user_id, batch_id, delta, reason)
            VALUES ($1, $2, $3, $4)
            "#,
        )
        .bind(user_id)
        .bind(batch_id)
        .bind(delta)
        .bind(reason.as_str())
        .execute(&mut **tx)
        .await?;
        Ok(())
    }

    // =========================================================================
    // Event log
    // =========================================================================

    /// Claim an event id inside the caller's transaction.
    ///
    /// Returns `false` when the event was processed before. Because the
    /// claim commits atomically with the event's effects, a rolled-back
    /// handler leaves no row and the gateway's retry is processed fresh.
    pub async fn claim_event(
        &self,
        tx: &mut StoreTx<'_>,
        event_id: &str,
        event_type: &str,
    ) -> BillingResult<bool> {
        let row: Option<(String,)> = sqlx::query_as(
            r#"
            INSERT INTO pg_events (event_id, event_type)
            VALUES ($1, $2)
            ON CONFLICT (event_id) DO NOTHING
            RETURNING event_id
            "#,
        )
        .bind(event_id)
        .bind(event_type)
        .fetch_optional(&mut **tx)
        .await?;
        Ok(row.is_some())
    }

    // =========================================================================
    // Read path
    // =========================================================================

    /// Current spendable balance: Σ max(0, amount − consumed) over active,
    /// non-expired batches.
    pub async fn balance(&self, user_id: Uuid) -> BillingResult<i64> {
        let (balance,): (Option<i64>,) = sqlx::query_as(
            r#"
            SELECT SUM(GREATEST(amount - consumed, 0))::BIGINT
            FROM batches
            WHERE user_id = $1 AND is_active AND expires_at > NOW()
            "#,
        )
        .bind(user_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(balance.unwrap_or(0))
    }
}
