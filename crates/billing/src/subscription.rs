//! Subscription lifecycle: explicit state machine plus effect application.
//!
//! Event handlers consult the transition function instead of editing
//! fields ad hoc. Payment failure enters a dunning grace state without
//! revoking access; only `subscription.deleted` (or the maintenance sweep
//! noticing an ended period) terminates a subscription.

use uuid::Uuid;

use crate::error::BillingResult;
use crate::store::{LedgerStore, StoreTx, SubscriptionUpsert};
use crate::types::SubscriptionRow;

/// Lifecycle states of a user's subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionState {
    Absent,
    Active,
    PaymentIssue,
    /// The gateway holds a cancel-at-period-end; local state is unchanged
    /// until `subscription.deleted` arrives.
    CancelledPendingEnd,
    Ended,
}

/// Lifecycle inputs, normalized from gateway events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleEvent {
    Created,
    InvoicePaid,
    PaymentFailed,
    CancelRequested,
    Deleted,
    PeriodEnded,
}

/// The transition function. Unlisted combinations keep the current state.
pub fn transition(state: SubscriptionState, event: LifecycleEvent) -> SubscriptionState {
    use LifecycleEvent::*;
    use SubscriptionState::*;

    match (state, event) {
        (_, Deleted) => Ended,
        (_, PeriodEnded) => Ended,
        (Absent, Created) => Active,
        (Active, InvoicePaid) => Active,
        // Dunning grace: record the issue, keep access.
        (Active, PaymentFailed) => PaymentIssue,
        (PaymentIssue, PaymentFailed) => PaymentIssue,
        // A successful charge clears dunning.
        (PaymentIssue, InvoicePaid) => Active,
        (Active, CancelRequested) => CancelledPendingEnd,
        (PaymentIssue, CancelRequested) => CancelledPendingEnd,
        (CancelledPendingEnd, InvoicePaid) => CancelledPendingEnd,
        (CancelledPendingEnd, PaymentFailed) => CancelledPendingEnd,
        (s, _) => s,
    }
}

/// Derive the persisted state of a subscription row.
pub fn state_of(row: Option<&SubscriptionRow>) -> SubscriptionState {
    match row {
        None => SubscriptionState::Absent,
        Some(row) if !row.is_active => SubscriptionState::Ended,
        Some(row) if row.payment_failure_reason.is_some() => SubscriptionState::PaymentIssue,
        Some(_) => SubscriptionState::Active,
    }
}

/// Applies lifecycle effects to the store. The authority on
/// `has_active_subscription` and `has_payment_issue`.
#[derive(Clone)]
pub struct SubscriptionService {
    store: LedgerStore,
}

impl SubscriptionService {
    pub fn new(store: LedgerStore) -> Self {
        Self { store }
    }

    /// `subscription.created`: upsert the row, keep at most one active
    /// subscription per user, flip the user's access flags. Grants no
    /// credit; that is the paid invoice's job.
    pub async fn on_created(
        &self,
        tx: &mut StoreTx<'_>,
        fields: &SubscriptionUpsert<'_>,
    ) -> BillingResult<(Uuid, bool)> {
        let (id, was_insert) = self.store.upsert_subscription_by_pg_id(tx, fields).await?;
        let displaced = self
            .store
            .deactivate_other_subscriptions(tx, fields.user_id, id)
            .await?;
        if displaced > 0 {
            tracing::warn!(
                user_id = %fields.user_id,
                subscription_id = %id,
                displaced = displaced,
                "Deactivated older active subscriptions on new grant"
            );
        }
        self.store
            .update_user_flags(tx, fields.user_id, Some(true), Some(false))
            .await?;
        Ok((id, was_insert))
    }

    /// `subscription.deleted`: end the subscription and clear access.
    /// Batches are not revoked; the user spends them until natural expiry.
    pub async fn on_deleted(
        &self,
        tx: &mut StoreTx<'_>,
        row: &SubscriptionRow,
    ) -> BillingResult<()> {
        self.store.deactivate_subscription(tx, row.id).await?;
        self.store
            .update_user_flags(tx, row.user_id, Some(false), None)
            .await?;
        tracing::info!(
            user_id = %row.user_id,
            subscription_id = %row.id,
            "Subscription ended"
        );
        Ok(())
    }

    /// Payment failure: record the reason and raise the dunning flag.
    /// Never touches `is_active` or `has_active_subscription`.
    pub async fn on_payment_failed(
        &self,
        tx: &mut StoreTx<'_>,
        row: &SubscriptionRow,
        reason: &str,
    ) -> BillingResult<()> {
        self.store.set_payment_failure(tx, row.id, reason).await?;
        self.store
            .update_user_flags(tx, row.user_id, None, Some(true))
            .await?;
        tracing::warn!(
            user_id = %row.user_id,
            subscription_id = %row.id,
            reason = %reason,
            "Payment failed, entering dunning grace"
        );
        Ok(())
    }

    /// A successful payment clears any recorded failure.
    pub async fn on_payment_recovered(
        &self,
        tx: &mut StoreTx<'_>,
        row: &SubscriptionRow,
    ) -> BillingResult<()> {
        self.store.clear_payment_failure(tx, row.id).await?;
        self.store
            .update_user_flags(tx, row.user_id, None, Some(false))
            .await?;
        Ok(())
    }

    /// Maintenance sweep: the billing period ended without renewal.
    pub async fn on_period_ended(
        &self,
        tx: &mut StoreTx<'_>,
        row: &SubscriptionRow,
    ) -> BillingResult<()> {
        self.on_deleted(tx, row).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use LifecycleEvent::*;
    use SubscriptionState::*;

    #[test]
    fn creation_activates() {
        assert_eq!(transition(Absent, Created), Active);
    }

    #[test]
    fn paid_keeps_active() {
        assert_eq!(transition(Active, InvoicePaid), Active);
    }

    #[test]
    fn failure_enters_dunning_not_ended() {
        // The dunning regression this table prevents: a payment failure
        // must never end the subscription.
        assert_eq!(transition(Active, PaymentFailed), PaymentIssue);
        assert_ne!(transition(Active, PaymentFailed), Ended);
    }

    #[test]
    fn paid_recovers_from_dunning() {
        assert_eq!(transition(PaymentIssue, InvoicePaid), Active);
    }

    #[test]
    fn deleted_ends_from_any_state() {
        for state in [Absent, Active, PaymentIssue, CancelledPendingEnd, Ended] {
            assert_eq!(transition(state, Deleted), Ended);
        }
    }

    #[test]
    fn cancel_is_pending_until_deleted() {
        assert_eq!(transition(Active, CancelRequested), CancelledPendingEnd);
        assert_eq!(transition(PaymentIssue, CancelRequested), CancelledPendingEnd);
        // Renewal invoices during the pending window change nothing.
        assert_eq!(
            transition(CancelledPendingEnd, InvoicePaid),
            CancelledPendingEnd
        );
        assert_eq!(transition(CancelledPendingEnd, Deleted), Ended);
    }

    #[test]
    fn period_end_terminates() {
        assert_eq!(transition(Active, PeriodEnded), Ended);
        assert_eq!(transition(PaymentIssue, PeriodEnded), Ended);
    }

    #[test]
    fn derived_state_from_rows() {
        assert_eq!(state_of(None), Absent);

        let mut row = SubscriptionRow {
            id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            plan_key: "price_basic_m".into(),
            plan_tier: "basic".into(),
            billing_cycle: "monthly".into(),
            pg_subscription_id: "sub_1".into(),
            is_active: true,
            current_period_start: None,
            current_period_end: None,
            tokens_per_cycle: 1000,
            price_cents: 900,
            last_monthly_refill: None,
            payment_failure_reason: None,
        };
        assert_eq!(state_of(Some(&row)), Active);

        row.payment_failure_reason = Some("card_declined".into());
        assert_eq!(state_of(Some(&row)), PaymentIssue);

        row.is_active = false;
        assert_eq!(state_of(Some(&row)), Ended);
    }
}
