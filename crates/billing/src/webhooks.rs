//! Payment-gateway webhook handling.
//!
//! The dispatcher verifies the signature against the raw body, parses the
//! envelope, deduplicates on the event id, and routes each event kind to
//! its handler. All effects of one event commit in a single transaction
//! together with the event-log claim, so a rolled-back handler leaves no
//! trace and the gateway's retry is processed fresh.

use std::sync::Arc;
use std::time::Duration as StdDuration;

use hmac::{Hmac, Mac};
use sha2::Sha256;
use time::{Duration, OffsetDateTime};

use crate::catalog::{Catalog, SubscriptionPrice};
use crate::config::BillingConfig;
use crate::error::{BillingError, BillingResult};
use crate::events::{
    BillingReason, ChargeObject, CheckoutSessionObject, EventKind, InvoiceObject,
    PaymentIntentObject, PgEvent, SubscriptionObject,
};
use crate::gateway::PaymentGateway;
use crate::ledger::TokenLedger;
use crate::referral::ReferralService;
use crate::store::{LedgerStore, StoreTx, SubscriptionUpsert};
use crate::subscription::SubscriptionService;
use crate::types::{
    add_one_month, BatchOrigin, BillingCycle, TokenEventReason, UserRow, PURCHASE_EXPIRY_DAYS,
};

type HmacSha256 = Hmac<Sha256>;

/// Signature timestamp tolerance.
const SIGNATURE_TOLERANCE_SECS: i64 = 300;

/// Budget for one event end to end.
const EVENT_DEADLINE: StdDuration = StdDuration::from_secs(30);

/// What happened to a delivered event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// Effects committed.
    Processed,
    /// Seen before; nothing done.
    Duplicate,
    /// Event kind carries no effects for this system.
    Ignored,
    /// A known kind we could not attribute or apply; acknowledged so the
    /// gateway stops retrying (it has no newer information to offer).
    Skipped(&'static str),
}

// =============================================================================
// Signature verification
// =============================================================================

/// Verify the gateway signature header against the raw payload.
///
/// Header format: `t=<unix>,v1=<hex hmac>`. The signed message is
/// `"{t}.{payload}"` and the timestamp must be within tolerance of `now`.
pub fn verify_signature(
    payload: &str,
    header: &str,
    secret: &str,
    now: OffsetDateTime,
) -> BillingResult<()> {
    let mut timestamp: Option<i64> = None;
    let mut v1_signature: Option<&str> = None;

    for part in header.split(',') {
        let kv: Vec<&str> = part.splitn(2, '=').collect();
        if kv.len() == 2 {
            match kv[0] {
                "t" => timestamp = kv[1].parse().ok(),
                "v1" => v1_signature = Some(kv[1]),
                _ => {}
            }
        }
    }

    let timestamp = timestamp.ok_or(BillingError::BadSignature)?;
    let v1_signature = v1_signature.ok_or(BillingError::BadSignature)?;

    if (now.unix_timestamp() - timestamp).abs() > SIGNATURE_TOLERANCE_SECS {
        tracing::warn!(
            timestamp = timestamp,
            now = now.unix_timestamp(),
            "Webhook timestamp outside tolerance"
        );
        return Err(BillingError::BadSignature);
    }

    let secret_key = secret.strip_prefix("whsec_").unwrap_or(secret);
    let signed_payload = format!("{timestamp}.{payload}");

    let mut mac = HmacSha256::new_from_slice(secret_key.as_bytes())
        .map_err(|_| BillingError::BadSignature)?;
    mac.update(signed_payload.as_bytes());
    let computed = hex::encode(mac.finalize().into_bytes());

    if computed != v1_signature {
        return Err(BillingError::BadSignature);
    }
    Ok(())
}

// =============================================================================
// Credit policy
// =============================================================================

/// A decided subscription credit grant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CreditDecision {
    pub amount: i64,
    pub expires_at: OffsetDateTime,
    pub reason: TokenEventReason,
    /// Yearly plans stamp `last_monthly_refill` on grant.
    pub stamp_monthly_refill: bool,
}

/// Decide the token grant for a paid subscription invoice.
///
/// Non-yearly plans grant `tokens_per_cycle` with expiry from the invoice
/// line period end, falling back to the subscription period end, falling
/// back to `now` plus one cycle. Yearly plans amortize: the create/update
/// invoice grants one monthly refill (the maintenance worker performs the
/// rest), and renewal invoices grant nothing.
pub fn decide_subscription_credit(
    price: &SubscriptionPrice,
    billing_reason: BillingReason,
    line_period_end: Option<OffsetDateTime>,
    subscription_period_end: Option<OffsetDateTime>,
    now: OffsetDateTime,
) -> Option<CreditDecision> {
    let cycle = BillingCycle::from_str(&price.billing_cycle)?;

    if cycle == BillingCycle::Yearly {
        return match billing_reason {
            BillingReason::SubscriptionCreate => Some(CreditDecision {
                amount: price.monthly_refill(),
                expires_at: add_one_month(now),
                reason: TokenEventReason::SubscriptionInitialCredit,
                stamp_monthly_refill: true,
            }),
            BillingReason::SubscriptionUpdate => Some(CreditDecision {
                amount: price.monthly_refill(),
                expires_at: add_one_month(now),
                reason: TokenEventReason::SubscriptionUpgradeCredit,
                stamp_monthly_refill: true,
            }),
            // Renewals are amortized by the maintenance worker.
            BillingReason::SubscriptionCycle | BillingReason::Other => None,
        };
    }

    let expires_at = line_period_end
        .or(subscription_period_end)
        .unwrap_or_else(|| cycle.fallback_length(now));

    let reason = match billing_reason {
        BillingReason::SubscriptionCreate => TokenEventReason::SubscriptionInitialCredit,
        BillingReason::SubscriptionUpdate => TokenEventReason::SubscriptionUpgradeCredit,
        BillingReason::SubscriptionCycle | BillingReason::Other => {
            TokenEventReason::SubscriptionRefill
        }
    };

    Some(CreditDecision {
        amount: price.tokens_per_cycle,
        expires_at,
        reason,
        stamp_monthly_refill: false,
    })
}

// =============================================================================
// Failure-reason escalation
// =============================================================================

/// Everything the failed-payment event itself told us.
#[derive(Debug, Clone, Default)]
pub struct FailureContext {
    pub invoice_id: Option<String>,
    pub payment_intent_id: Option<String>,
    pub customer_id: Option<String>,
    pub subscription_id: Option<String>,
    /// `last_payment_error.message` carried on a payment-intent event.
    pub event_pi_error: Option<String>,
    /// `failure_message` carried on a charge event.
    pub event_charge_message: Option<String>,
    pub invoice_status: Option<String>,
    pub attempt_count: Option<i64>,
    pub next_payment_attempt: Option<i64>,
}

fn non_empty(s: Option<String>) -> Option<String> {
    s.filter(|s| !s.trim().is_empty())
}

/// Resolve a human-readable payment failure reason.
///
/// Traverses the escalation chain, stopping at the first non-empty
/// result; lookup failures are logged and skipped. Always returns a
/// non-empty reason.
pub async fn resolve_failure_reason(
    gateway: &dyn PaymentGateway,
    ctx: &FailureContext,
) -> String {
    let mut attempted = 0u32;
    let mut failed = 0u32;

    // (1) Re-fetch the invoice with payment intent and charge expanded.
    let mut fetched_invoice = None;
    if let Some(invoice_id) = &ctx.invoice_id {
        attempted += 1;
        match gateway.fetch_invoice(invoice_id).await {
            Ok(invoice) => fetched_invoice = invoice,
            Err(e) => {
                failed += 1;
                tracing::warn!(invoice_id = %invoice_id, error = %e, "Invoice re-fetch failed");
            }
        }
    }
    if let Some(reason) = fetched_invoice
        .as_ref()
        .and_then(|i| non_empty(i.payment_error_message.clone()))
    {
        return reason;
    }

    // (2) The payment intent's last_payment_error.
    if let Some(reason) = non_empty(ctx.event_pi_error.clone()) {
        return reason;
    }
    let pi_id = ctx.payment_intent_id.clone().or_else(|| {
        fetched_invoice
            .as_ref()
            .and_then(|i| i.payment_intent_id.clone())
    });
    if let Some(pi_id) = pi_id {
        attempted += 1;
        match gateway.fetch_payment_intent(&pi_id).await {
            Ok(Some(pi)) => {
                if let Some(reason) = non_empty(pi.payment_error_message) {
                    return reason;
                }
            }
            Ok(None) => {}
            Err(e) => {
                failed += 1;
                tracing::warn!(payment_intent = %pi_id, error = %e, "Payment intent fetch failed");
            }
        }
    }

    // (3) The invoice's charge object.
    if let Some(reason) = non_empty(ctx.event_charge_message.clone()) {
        return reason;
    }
    if let Some(reason) = fetched_invoice
        .as_ref()
        .and_then(|i| non_empty(i.charge_failure_message.clone()))
    {
        return reason;
    }

    // (4) Search the customer's payment intents for one tied to the invoice.
    if let (Some(customer_id), Some(invoice_id)) = (&ctx.customer_id, &ctx.invoice_id) {
        attempted += 1;
        match gateway.list_payment_intents(customer_id).await {
            Ok(intents) => {
                let reason = intents
                    .into_iter()
                    .find(|pi| pi.invoice_id.as_deref() == Some(invoice_id.as_str()))
                    .and_then(|pi| non_empty(pi.payment_error_message));
                if let Some(reason) = reason {
                    return reason;
                }
            }
            Err(e) => {
                failed += 1;
                tracing::warn!(customer = %customer_id, error = %e, "Payment intent search failed");
            }
        }
    }

    // (5) Via the subscription's latest invoice expansion.
    let mut latest_invoice = None;
    if let Some(subscription_id) = &ctx.subscription_id {
        attempted += 1;
        match gateway.fetch_subscription(subscription_id).await {
            Ok(Some(sub)) => {
                if let Some(invoice) = sub.latest_invoice {
                    if let Some(reason) = non_empty(invoice.payment_error_message.clone())
                        .or_else(|| non_empty(invoice.charge_failure_message.clone()))
                    {
                        return reason;
                    }
                    latest_invoice = Some(*invoice);
                }
            }
            Ok(None) => {}
            Err(e) => {
                failed += 1;
                tracing::warn!(subscription = %subscription_id, error = %e, "Subscription fetch failed");
            }
        }
    }

    if attempted > 0 && failed == attempted {
        return format!(
            "unknown: status={}, attempt_count={}, next_attempt={}",
            ctx.invoice_status.as_deref().unwrap_or("?"),
            ctx.attempt_count
                .map(|c| c.to_string())
                .unwrap_or_else(|| "?".into()),
            ctx.next_payment_attempt
                .map(|t| t.to_string())
                .unwrap_or_else(|| "none".into()),
        );
    }

    // Still empty: diagnose from what the gateway does know.
    let invoice = fetched_invoice.as_ref().or(latest_invoice.as_ref());
    if invoice.and_then(|i| i.collection_method.as_deref()) == Some("send_invoice") {
        return "no_automatic_payment".into();
    }
    if let Some(customer_id) = &ctx.customer_id {
        if let Ok(Some(customer)) = gateway.fetch_customer(customer_id).await {
            if !customer.has_default_payment_method {
                return "no_payment_method_on_file".into();
            }
        }
    }
    "no_attempt_yet".into()
}

// =============================================================================
// Dispatcher
// =============================================================================

/// Verifies, deduplicates, and applies gateway events.
pub struct EventDispatcher {
    store: LedgerStore,
    ledger: TokenLedger,
    subscriptions: SubscriptionService,
    referrals: ReferralService,
    catalog: Catalog,
    gateway: Arc<dyn PaymentGateway>,
    webhook_secret: String,
}

impl EventDispatcher {
    pub fn new(
        config: &BillingConfig,
        store: LedgerStore,
        gateway: Arc<dyn PaymentGateway>,
    ) -> Self {
        let ledger = TokenLedger::new(store.clone());
        let subscriptions = SubscriptionService::new(store.clone());
        let referrals = ReferralService::new(store.clone(), config.referral_token_amount);
        let catalog = Catalog::new(store.pool().clone());
        Self {
            store,
            ledger,
            subscriptions,
            referrals,
            catalog,
            gateway,
            webhook_secret: config.pg_webhook_secret.clone(),
        }
    }

    /// Verify, parse, deduplicate, and apply one raw delivery.
    pub async fn dispatch(
        &self,
        payload: &str,
        signature: &str,
    ) -> BillingResult<DispatchOutcome> {
        verify_signature(
            payload,
            signature,
            &self.webhook_secret,
            OffsetDateTime::now_utc(),
        )
        .map_err(|e| {
            let prefix: String = payload.chars().take(120).collect();
            tracing::warn!(
                payload_prefix = %prefix,
                "Webhook signature verification failed"
            );
            e
        })?;

        let event = PgEvent::parse(payload)?;

        let outcome = tokio::time::timeout(EVENT_DEADLINE, self.process(&event))
            .await
            .map_err(|_| BillingError::Deadline)??;

        tracing::info!(
            event_id = %event.id,
            event_type = %event.event_type,
            outcome = ?outcome,
            "Webhook event dispatched"
        );
        Ok(outcome)
    }

    async fn process(&self, event: &PgEvent) -> BillingResult<DispatchOutcome> {
        let kind = event.kind();
        if let EventKind::Other(event_type) = &kind {
            // Track which kinds arrive unhandled; helps spot new events
            // that may need handlers.
            tracing::info!(event_type = %event_type, event_id = %event.id, "Unhandled event kind");
            return Ok(DispatchOutcome::Ignored);
        }

        let mut tx = self.store.begin().await?;

        if !self
            .store
            .claim_event(&mut tx, &event.id, &event.event_type)
            .await?
        {
            tx.rollback().await?;
            tracing::info!(event_id = %event.id, "Duplicate event, nothing to do");
            return Ok(DispatchOutcome::Duplicate);
        }

        let outcome = match kind {
            EventKind::CheckoutSessionCompleted => {
                self.handle_checkout_completed(&mut tx, event).await?
            }
            EventKind::SubscriptionCreated | EventKind::SubscriptionUpdated => {
                self.handle_subscription_upsert(&mut tx, event).await?
            }
            EventKind::SubscriptionDeleted => {
                self.handle_subscription_deleted(&mut tx, event).await?
            }
            EventKind::InvoicePaid | EventKind::InvoicePaymentSucceeded => {
                self.handle_invoice_paid(&mut tx, event).await?
            }
            EventKind::InvoicePaymentFailed => {
                let invoice: InvoiceObject = event.object()?;
                let ctx = FailureContext {
                    invoice_id: Some(invoice.id.clone()),
                    payment_intent_id: invoice.payment_intent.as_ref().map(|r| r.id().to_string()),
                    customer_id: invoice.customer.as_ref().map(|r| r.id().to_string()),
                    subscription_id: invoice.subscription.as_ref().map(|r| r.id().to_string()),
                    invoice_status: invoice.status.clone(),
                    attempt_count: invoice.attempt_count,
                    next_payment_attempt: invoice.next_payment_attempt,
                    ..Default::default()
                };
                self.handle_payment_failed(&mut tx, ctx).await?
            }
            EventKind::PaymentIntentFailed => {
                let pi: PaymentIntentObject = event.object()?;
                let ctx = FailureContext {
                    invoice_id: pi.invoice.as_ref().map(|r| r.id().to_string()),
                    payment_intent_id: Some(pi.id.clone()),
                    customer_id: pi.customer.as_ref().map(|r| r.id().to_string()),
                    event_pi_error: pi.last_payment_error.and_then(|e| e.message),
                    ..Default::default()
                };
                self.handle_payment_failed(&mut tx, ctx).await?
            }
            EventKind::ChargeFailed => {
                let charge: ChargeObject = event.object()?;
                let ctx = FailureContext {
                    invoice_id: charge.invoice.as_ref().map(|r| r.id().to_string()),
                    customer_id: charge.customer.as_ref().map(|r| r.id().to_string()),
                    event_charge_message: charge.failure_message,
                    ..Default::default()
                };
                self.handle_payment_failed(&mut tx, ctx).await?
            }
            EventKind::PaymentIntentSucceeded => {
                self.handle_payment_intent_succeeded(&mut tx, event).await?
            }
            EventKind::Other(_) => unreachable!("filtered above"),
        };

        tx.commit().await?;
        Ok(outcome)
    }

    // =========================================================================
    // User resolution
    // =========================================================================

    /// Resolve the affected user: explicit metadata first, then the bound
    /// gateway customer, then a customer-email lookup via the gateway.
    async fn resolve_user(
        &self,
        tx: &mut StoreTx<'_>,
        metadata_user_id: Option<&str>,
        customer_id: Option<&str>,
    ) -> BillingResult<Option<UserRow>> {
        if let Some(external_id) = metadata_user_id {
            if let Some(user) = self.store.find_user_by_external_id(tx, external_id).await? {
                return Ok(Some(user));
            }
        }

        if let Some(customer_id) = customer_id {
            if let Some(user) = self.store.find_user_by_pg_customer(tx, customer_id).await? {
                return Ok(Some(user));
            }

            match self.gateway.fetch_customer(customer_id).await {
                Ok(Some(customer)) => {
                    if let Some(email) = customer.email {
                        if let Some(user) = self.store.find_user_by_email(tx, &email).await? {
                            return Ok(Some(user));
                        }
                    }
                }
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!(customer = %customer_id, error = %e, "Customer lookup failed");
                }
            }
        }

        Ok(None)
    }

    // =========================================================================
    // Handlers (each runs inside the event transaction)
    // =========================================================================

    async fn handle_checkout_completed(
        &self,
        tx: &mut StoreTx<'_>,
        event: &PgEvent,
    ) -> BillingResult<DispatchOutcome> {
        let session: CheckoutSessionObject = event.object()?;
        let customer_id = session.customer.as_ref().map(|r| r.id().to_string());

        let Some(user) = self
            .resolve_user(tx, session.metadata.user_id.as_deref(), customer_id.as_deref())
            .await?
        else {
            tracing::error!(
                event_id = %event.id,
                session_id = %session.id,
                "Checkout session cannot be attributed to a user"
            );
            return Ok(DispatchOutcome::Skipped("unresolved user"));
        };

        if let Some(customer_id) = &customer_id {
            self.store.bind_pg_customer(tx, user.id, customer_id).await?;
        }

        if session.is_subscription_mode() {
            // Subscription side effects arrive on their own events.
            return Ok(DispatchOutcome::Processed);
        }
        if !session.is_payment_mode() {
            tracing::info!(session_id = %session.id, mode = ?session.mode, "Ignoring checkout mode");
            return Ok(DispatchOutcome::Ignored);
        }

        let Some(plan_option) = session.metadata.plan_option.as_deref() else {
            tracing::error!(
                session_id = %session.id,
                "Payment-mode checkout session without plan_option metadata"
            );
            return Ok(DispatchOutcome::Skipped("missing plan_option"));
        };

        self.credit_one_time_purchase(
            tx,
            &user,
            plan_option,
            &session.id,
            session.total_details.amount_discount.unwrap_or(0) as i32,
        )
        .await
    }

    /// One-time payment outside Checkout; equivalent handling, idempotent
    /// on the payment-intent id.
    async fn handle_payment_intent_succeeded(
        &self,
        tx: &mut StoreTx<'_>,
        event: &PgEvent,
    ) -> BillingResult<DispatchOutcome> {
        let pi: PaymentIntentObject = event.object()?;

        if pi.invoice.is_some() {
            // Invoice-backed intents are credited by the invoice events.
            return Ok(DispatchOutcome::Ignored);
        }

        let customer_id = pi.customer.as_ref().map(|r| r.id().to_string());
        let Some(user) = self
            .resolve_user(tx, pi.metadata.user_id.as_deref(), customer_id.as_deref())
            .await?
        else {
            tracing::error!(event_id = %event.id, payment_intent = %pi.id, "Unattributable payment intent");
            return Ok(DispatchOutcome::Skipped("unresolved user"));
        };

        if let Some(customer_id) = &customer_id {
            self.store.bind_pg_customer(tx, user.id, customer_id).await?;
        }

        let Some(plan_option) = pi.metadata.plan_option.as_deref() else {
            tracing::error!(payment_intent = %pi.id, "Payment intent without plan_option metadata");
            return Ok(DispatchOutcome::Skipped("missing plan_option"));
        };

        self.credit_one_time_purchase(tx, &user, plan_option, &pi.id, 0)
            .await
    }

    async fn credit_one_time_purchase(
        &self,
        tx: &mut StoreTx<'_>,
        user: &UserRow,
        plan_option: &str,
        pg_purchase_id: &str,
        discount_cents: i32,
    ) -> BillingResult<DispatchOutcome> {
        let price = self.catalog.token_price_by_tier(plan_option).await?;

        let now = OffsetDateTime::now_utc();
        let expires_at = now + Duration::days(PURCHASE_EXPIRY_DAYS);

        let purchase_id = self
            .store
            .insert_purchase(
                tx,
                user.id,
                &price.tier,
                pg_purchase_id,
                price.tokens,
                discount_cents,
                now,
                expires_at,
            )
            .await?;

        let Some(purchase_id) = purchase_id else {
            tracing::info!(
                pg_purchase_id = %pg_purchase_id,
                "Purchase already recorded, nothing to credit"
            );
            return Ok(DispatchOutcome::Processed);
        };

        self.ledger
            .grant_batch(
                tx,
                user.id,
                BatchOrigin::Purchase(purchase_id),
                price.tokens,
                expires_at,
                None,
                "one-time-purchase",
                TokenEventReason::Purchase,
            )
            .await?;

        self.referrals
            .apply_pending_reward(tx, &self.ledger, user.id)
            .await?;

        tracing::info!(
            user_id = %user.id,
            purchase_id = %purchase_id,
            tokens = price.tokens,
            discount_cents = discount_cents,
            "One-time purchase credited"
        );
        Ok(DispatchOutcome::Processed)
    }

    async fn handle_subscription_upsert(
        &self,
        tx: &mut StoreTx<'_>,
        event: &PgEvent,
    ) -> BillingResult<DispatchOutcome> {
        let sub: SubscriptionObject = event.object()?;
        let customer_id = sub.customer.as_ref().map(|r| r.id().to_string());

        let Some(user) = self
            .resolve_user(tx, sub.metadata.user_id.as_deref(), customer_id.as_deref())
            .await?
        else {
            tracing::error!(event_id = %event.id, subscription = %sub.id, "Unattributable subscription");
            return Ok(DispatchOutcome::Skipped("unresolved user"));
        };

        if let Some(customer_id) = &customer_id {
            self.store.bind_pg_customer(tx, user.id, customer_id).await?;
        }

        let Some(price_id) = sub.price_id() else {
            tracing::error!(subscription = %sub.id, "Subscription event without a price item");
            return Ok(DispatchOutcome::Skipped("missing price"));
        };
        let price = self.catalog.subscription_price(price_id).await?;

        // Tier changes on updates grant an upgrade batch; detect before
        // the upsert overwrites the row.
        let previous = self.store.lock_subscription_by_pg_id(tx, &sub.id).await?;
        let tier_changed = previous
            .as_ref()
            .map(|row| row.plan_tier != price.plan_tier)
            .unwrap_or(false);

        let fields = SubscriptionUpsert {
            user_id: user.id,
            plan_key: &price.plan_key,
            plan_tier: &price.plan_tier,
            billing_cycle: &price.billing_cycle,
            pg_subscription_id: &sub.id,
            current_period_start: sub.period_start(),
            current_period_end: sub.period_end(),
            tokens_per_cycle: price.tokens_per_cycle,
            price_cents: price.price_cents,
        };
        let (local_id, was_insert) = self.subscriptions.on_created(tx, &fields).await?;

        if tier_changed {
            let now = OffsetDateTime::now_utc();
            if let Some(decision) = decide_subscription_credit(
                &price,
                BillingReason::SubscriptionUpdate,
                None,
                sub.period_end(),
                now,
            ) {
                self.ledger
                    .grant_batch(
                        tx,
                        user.id,
                        BatchOrigin::Subscription(local_id),
                        decision.amount,
                        decision.expires_at,
                        None,
                        "plan-upgrade",
                        decision.reason,
                    )
                    .await?;
                if decision.stamp_monthly_refill {
                    self.store.stamp_monthly_refill(tx, local_id, now).await?;
                }
            }
        }

        tracing::info!(
            user_id = %user.id,
            subscription_id = %local_id,
            plan_tier = %price.plan_tier,
            was_insert = was_insert,
            tier_changed = tier_changed,
            "Subscription upserted"
        );
        Ok(DispatchOutcome::Processed)
    }

    async fn handle_subscription_deleted(
        &self,
        tx: &mut StoreTx<'_>,
        event: &PgEvent,
    ) -> BillingResult<DispatchOutcome> {
        let sub: SubscriptionObject = event.object()?;

        let Some(row) = self.store.lock_subscription_by_pg_id(tx, &sub.id).await? else {
            tracing::warn!(subscription = %sub.id, "Deleted subscription unknown locally");
            return Ok(DispatchOutcome::Skipped("unknown subscription"));
        };

        self.subscriptions.on_deleted(tx, &row).await?;
        Ok(DispatchOutcome::Processed)
    }

    async fn handle_invoice_paid(
        &self,
        tx: &mut StoreTx<'_>,
        event: &PgEvent,
    ) -> BillingResult<DispatchOutcome> {
        let invoice: InvoiceObject = event.object()?;

        if !invoice.is_paid() {
            tracing::info!(invoice = %invoice.id, status = ?invoice.status, "Ignoring unpaid invoice event");
            return Ok(DispatchOutcome::Ignored);
        }

        let Some(subscription_ref) = invoice.subscription.as_ref() else {
            // Stand-alone invoices carry no token semantics here.
            return Ok(DispatchOutcome::Ignored);
        };

        let row = self
            .store
            .lock_subscription_by_pg_id(tx, subscription_ref.id())
            .await?
            .ok_or_else(|| {
                BillingError::MissingSubscription(subscription_ref.id().to_string())
            })?;

        if let Some(customer) = invoice.customer.as_ref() {
            self.store
                .bind_pg_customer(tx, row.user_id, customer.id())
                .await?;
        }

        let price = self.catalog.subscription_price(&row.plan_key).await?;
        let now = OffsetDateTime::now_utc();
        let reason = invoice.reason();

        if let Some(decision) = decide_subscription_credit(
            &price,
            reason,
            invoice.line_period_end(),
            row.current_period_end,
            now,
        ) {
            let grant = self
                .ledger
                .grant_batch(
                    tx,
                    row.user_id,
                    BatchOrigin::Subscription(row.id),
                    decision.amount,
                    decision.expires_at,
                    Some(&invoice.id),
                    "subscription-credit",
                    decision.reason,
                )
                .await?;
            if grant.already_credited {
                tracing::info!(invoice = %invoice.id, "Invoice already credited");
            }
            if decision.stamp_monthly_refill && !grant.already_credited {
                self.store.stamp_monthly_refill(tx, row.id, now).await?;
            }
        } else {
            tracing::info!(
                invoice = %invoice.id,
                billing_cycle = %price.billing_cycle,
                "No credit for this invoice; maintenance refills apply"
            );
        }

        // A successful charge always clears dunning.
        self.subscriptions.on_payment_recovered(tx, &row).await?;

        if reason == BillingReason::SubscriptionCreate {
            self.referrals
                .apply_pending_reward(tx, &self.ledger, row.user_id)
                .await?;
        }

        Ok(DispatchOutcome::Processed)
    }

    async fn handle_payment_failed(
        &self,
        tx: &mut StoreTx<'_>,
        ctx: FailureContext,
    ) -> BillingResult<DispatchOutcome> {
        let Some(user) = self.resolve_user(tx, None, ctx.customer_id.as_deref()).await? else {
            tracing::error!(
                invoice = ?ctx.invoice_id,
                customer = ?ctx.customer_id,
                "Payment failure cannot be attributed to a user"
            );
            return Ok(DispatchOutcome::Skipped("unresolved user"));
        };

        // Prefer the subscription named on the invoice; fall back to the
        // user's active subscription for charge/intent failures.
        let row = match ctx.subscription_id.as_deref() {
            Some(pg_id) => self.store.lock_subscription_by_pg_id(tx, pg_id).await?,
            None => self.store.latest_active_subscription(tx, user.id).await?,
        };

        let reason = resolve_failure_reason(self.gateway.as_ref(), &ctx).await;

        if let Some(row) = &row {
            self.subscriptions.on_payment_failed(tx, row, &reason).await?;
        } else {
            // No subscription to annotate; still raise the user flag.
            self.store
                .update_user_flags(tx, user.id, None, Some(true))
                .await?;
            tracing::warn!(
                user_id = %user.id,
                reason = %reason,
                "Payment failure without a local subscription"
            );
        }

        Ok(DispatchOutcome::Processed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::{
        CheckoutParams, CheckoutSessionOut, GatewayCustomer, GatewayInvoice,
        GatewayPaymentIntent, GatewaySubscription,
    };
    use async_trait::async_trait;
    use std::sync::Mutex;
    use time::macros::datetime;

    fn sign(payload: &str, secret: &str, ts: i64) -> String {
        let secret_key = secret.strip_prefix("whsec_").unwrap_or(secret);
        let mut mac = HmacSha256::new_from_slice(secret_key.as_bytes()).unwrap();
        mac.update(format!("{ts}.{payload}").as_bytes());
        format!("t={ts},v1={}", hex::encode(mac.finalize().into_bytes()))
    }

    #[test]
    fn accepts_valid_signature() {
        let now = datetime!(2025-06-01 12:00 UTC);
        let header = sign("{}", "whsec_testsecret", now.unix_timestamp());
        assert!(verify_signature("{}", &header, "whsec_testsecret", now).is_ok());
    }

    #[test]
    fn rejects_tampered_payload() {
        let now = datetime!(2025-06-01 12:00 UTC);
        let header = sign("{}", "whsec_testsecret", now.unix_timestamp());
        assert!(matches!(
            verify_signature(r#"{"x":1}"#, &header, "whsec_testsecret", now),
            Err(BillingError::BadSignature)
        ));
    }

    #[test]
    fn rejects_wrong_secret() {
        let now = datetime!(2025-06-01 12:00 UTC);
        let header = sign("{}", "whsec_a", now.unix_timestamp());
        assert!(verify_signature("{}", &header, "whsec_b", now).is_err());
    }

    #[test]
    fn rejects_stale_timestamp() {
        let now = datetime!(2025-06-01 12:00 UTC);
        let header = sign("{}", "whsec_testsecret", now.unix_timestamp() - 301);
        assert!(verify_signature("{}", &header, "whsec_testsecret", now).is_err());
    }

    #[test]
    fn rejects_missing_header_parts() {
        let now = datetime!(2025-06-01 12:00 UTC);
        assert!(verify_signature("{}", "t=123", "whsec_x", now).is_err());
        assert!(verify_signature("{}", "v1=abc", "whsec_x", now).is_err());
        assert!(verify_signature("{}", "", "whsec_x", now).is_err());
    }

    fn monthly_price() -> SubscriptionPrice {
        SubscriptionPrice {
            plan_key: "price_std_m".into(),
            plan_tier: "standard".into(),
            billing_cycle: "monthly".into(),
            tokens_per_cycle: 1_000,
            monthly_refill_tokens: None,
            price_cents: 1_900,
        }
    }

    fn yearly_price() -> SubscriptionPrice {
        SubscriptionPrice {
            plan_key: "price_prem_y".into(),
            plan_tier: "premium".into(),
            billing_cycle: "yearly".into(),
            tokens_per_cycle: 12_000,
            monthly_refill_tokens: Some(1_000),
            price_cents: 99_00,
        }
    }

    #[test]
    fn monthly_create_grants_cycle_tokens() {
        let now = datetime!(2025-03-01 00:00 UTC);
        let line_end = datetime!(2025-04-01 00:00 UTC);
        let decision = decide_subscription_credit(
            &monthly_price(),
            BillingReason::SubscriptionCreate,
            Some(line_end),
            None,
            now,
        )
        .unwrap();
        assert_eq!(decision.amount, 1_000);
        assert_eq!(decision.expires_at, line_end);
        assert_eq!(decision.reason, TokenEventReason::SubscriptionInitialCredit);
        assert!(!decision.stamp_monthly_refill);
    }

    #[test]
    fn monthly_cycle_grants_refill() {
        let now = datetime!(2025-03-01 00:00 UTC);
        let decision = decide_subscription_credit(
            &monthly_price(),
            BillingReason::SubscriptionCycle,
            None,
            Some(datetime!(2025-04-01 00:00 UTC)),
            now,
        )
        .unwrap();
        assert_eq!(decision.amount, 1_000);
        assert_eq!(decision.reason, TokenEventReason::SubscriptionRefill);
        // Falls back to the subscription period end.
        assert_eq!(decision.expires_at, datetime!(2025-04-01 00:00 UTC));
    }

    #[test]
    fn monthly_expiry_falls_back_to_cycle_length() {
        let now = datetime!(2025-03-15 00:00 UTC);
        let decision = decide_subscription_credit(
            &monthly_price(),
            BillingReason::SubscriptionCycle,
            None,
            None,
            now,
        )
        .unwrap();
        assert_eq!(decision.expires_at, datetime!(2025-04-15 00:00 UTC));
    }

    #[test]
    fn yearly_create_grants_one_refill_and_stamps() {
        let now = datetime!(2025-03-01 00:00 UTC);
        let decision = decide_subscription_credit(
            &yearly_price(),
            BillingReason::SubscriptionCreate,
            // Line period end is a year out; yearly grants ignore it.
            Some(datetime!(2026-03-01 00:00 UTC)),
            None,
            now,
        )
        .unwrap();
        assert_eq!(decision.amount, 1_000);
        assert_eq!(decision.expires_at, datetime!(2025-04-01 00:00 UTC));
        assert!(decision.stamp_monthly_refill);
    }

    #[test]
    fn yearly_cycle_grants_nothing() {
        let now = datetime!(2026-03-01 00:00 UTC);
        assert!(decide_subscription_credit(
            &yearly_price(),
            BillingReason::SubscriptionCycle,
            None,
            None,
            now,
        )
        .is_none());
    }

    #[test]
    fn upgrade_reason_is_upgrade_credit() {
        let now = datetime!(2025-03-01 00:00 UTC);
        let decision = decide_subscription_credit(
            &monthly_price(),
            BillingReason::SubscriptionUpdate,
            None,
            None,
            now,
        )
        .unwrap();
        assert_eq!(decision.reason, TokenEventReason::SubscriptionUpgradeCredit);
    }

    // =========================================================================
    // Failure-reason escalation with a scripted gateway
    // =========================================================================

    #[derive(Default)]
    struct FakeGateway {
        invoice: Option<GatewayInvoice>,
        payment_intent: Option<GatewayPaymentIntent>,
        customer_intents: Vec<GatewayPaymentIntent>,
        customer: Option<GatewayCustomer>,
        subscription: Option<GatewaySubscription>,
        fail_all: bool,
        calls: Mutex<Vec<&'static str>>,
    }

    impl FakeGateway {
        fn record(&self, call: &'static str) {
            self.calls.lock().unwrap().push(call);
        }
    }

    #[async_trait]
    impl PaymentGateway for FakeGateway {
        async fn fetch_invoice(&self, _: &str) -> BillingResult<Option<GatewayInvoice>> {
            self.record("fetch_invoice");
            if self.fail_all {
                return Err(BillingError::Gateway("down".into()));
            }
            Ok(self.invoice.clone())
        }

        async fn fetch_payment_intent(
            &self,
            _: &str,
        ) -> BillingResult<Option<GatewayPaymentIntent>> {
            self.record("fetch_payment_intent");
            if self.fail_all {
                return Err(BillingError::Gateway("down".into()));
            }
            Ok(self.payment_intent.clone())
        }

        async fn list_payment_intents(
            &self,
            _: &str,
        ) -> BillingResult<Vec<GatewayPaymentIntent>> {
            self.record("list_payment_intents");
            if self.fail_all {
                return Err(BillingError::Gateway("down".into()));
            }
            Ok(self.customer_intents.clone())
        }

        async fn fetch_customer(&self, _: &str) -> BillingResult<Option<GatewayCustomer>> {
            self.record("fetch_customer");
            if self.fail_all {
                return Err(BillingError::Gateway("down".into()));
            }
            Ok(self.customer.clone())
        }

        async fn fetch_subscription(
            &self,
            _: &str,
        ) -> BillingResult<Option<GatewaySubscription>> {
            self.record("fetch_subscription");
            if self.fail_all {
                return Err(BillingError::Gateway("down".into()));
            }
            Ok(self.subscription.clone())
        }

        async fn cancel_at_period_end(&self, _: &str) -> BillingResult<()> {
            self.record("cancel_at_period_end");
            Ok(())
        }

        async fn create_checkout_session(
            &self,
            _: CheckoutParams,
        ) -> BillingResult<CheckoutSessionOut> {
            unimplemented!("not used in these tests")
        }
    }

    fn failing_invoice_ctx() -> FailureContext {
        FailureContext {
            invoice_id: Some("in_1".into()),
            customer_id: Some("cus_1".into()),
            subscription_id: Some("sub_1".into()),
            invoice_status: Some("open".into()),
            attempt_count: Some(2),
            next_payment_attempt: Some(1_750_000_000),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn escalation_stops_at_expanded_invoice() {
        let gateway = FakeGateway {
            invoice: Some(GatewayInvoice {
                id: "in_1".into(),
                payment_error_message: Some("Your card was declined.".into()),
                ..Default::default()
            }),
            ..Default::default()
        };
        let reason = resolve_failure_reason(&gateway, &failing_invoice_ctx()).await;
        assert_eq!(reason, "Your card was declined.");
        assert_eq!(*gateway.calls.lock().unwrap(), vec!["fetch_invoice"]);
    }

    #[tokio::test]
    async fn event_supplied_intent_error_preempts_lookups() {
        let gateway = FakeGateway::default();
        let ctx = FailureContext {
            event_pi_error: Some("insufficient_funds".into()),
            ..Default::default()
        };
        let reason = resolve_failure_reason(&gateway, &ctx).await;
        assert_eq!(reason, "insufficient_funds");
        assert!(gateway.calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn escalation_reaches_charge_message() {
        let gateway = FakeGateway {
            invoice: Some(GatewayInvoice {
                id: "in_1".into(),
                charge_failure_message: Some("expired_card".into()),
                payment_intent_id: Some("pi_1".into()),
                ..Default::default()
            }),
            payment_intent: Some(GatewayPaymentIntent::default()),
            ..Default::default()
        };
        let reason = resolve_failure_reason(&gateway, &failing_invoice_ctx()).await;
        assert_eq!(reason, "expired_card");
    }

    #[tokio::test]
    async fn escalation_searches_customer_intents() {
        let gateway = FakeGateway {
            invoice: Some(GatewayInvoice {
                id: "in_1".into(),
                ..Default::default()
            }),
            customer_intents: vec![
                GatewayPaymentIntent {
                    id: "pi_other".into(),
                    invoice_id: Some("in_other".into()),
                    payment_error_message: Some("wrong one".into()),
                },
                GatewayPaymentIntent {
                    id: "pi_1".into(),
                    invoice_id: Some("in_1".into()),
                    payment_error_message: Some("card_velocity_exceeded".into()),
                },
            ],
            ..Default::default()
        };
        let reason = resolve_failure_reason(&gateway, &failing_invoice_ctx()).await;
        assert_eq!(reason, "card_velocity_exceeded");
    }

    #[tokio::test]
    async fn escalation_reaches_subscription_latest_invoice() {
        let gateway = FakeGateway {
            subscription: Some(GatewaySubscription {
                id: "sub_1".into(),
                latest_invoice: Some(Box::new(GatewayInvoice {
                    id: "in_1".into(),
                    payment_error_message: Some("processing_error".into()),
                    ..Default::default()
                })),
                ..Default::default()
            }),
            ..Default::default()
        };
        let reason = resolve_failure_reason(&gateway, &failing_invoice_ctx()).await;
        assert_eq!(reason, "processing_error");
    }

    #[tokio::test]
    async fn diagnosis_send_invoice() {
        let gateway = FakeGateway {
            invoice: Some(GatewayInvoice {
                id: "in_1".into(),
                collection_method: Some("send_invoice".into()),
                ..Default::default()
            }),
            ..Default::default()
        };
        let reason = resolve_failure_reason(&gateway, &failing_invoice_ctx()).await;
        assert_eq!(reason, "no_automatic_payment");
    }

    #[tokio::test]
    async fn diagnosis_missing_payment_method() {
        let gateway = FakeGateway {
            invoice: Some(GatewayInvoice {
                id: "in_1".into(),
                ..Default::default()
            }),
            customer: Some(GatewayCustomer {
                id: "cus_1".into(),
                email: None,
                has_default_payment_method: false,
            }),
            ..Default::default()
        };
        let reason = resolve_failure_reason(&gateway, &failing_invoice_ctx()).await;
        assert_eq!(reason, "no_payment_method_on_file");
    }

    #[tokio::test]
    async fn diagnosis_defaults_to_no_attempt_yet() {
        let gateway = FakeGateway {
            invoice: Some(GatewayInvoice {
                id: "in_1".into(),
                ..Default::default()
            }),
            customer: Some(GatewayCustomer {
                id: "cus_1".into(),
                email: None,
                has_default_payment_method: true,
            }),
            ..Default::default()
        };
        let reason = resolve_failure_reason(&gateway, &failing_invoice_ctx()).await;
        assert_eq!(reason, "no_attempt_yet");
    }

    #[tokio::test]
    async fn all_lookups_failing_reports_unknown_with_context() {
        let gateway = FakeGateway {
            fail_all: true,
            ..Default::default()
        };
        let reason = resolve_failure_reason(&gateway, &failing_invoice_ctx()).await;
        assert_eq!(
            reason,
            "unknown: status=open, attempt_count=2, next_attempt=1750000000"
        );
    }
}
