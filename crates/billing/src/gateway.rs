//! Outbound payment-gateway access.
//!
//! Components never talk to the gateway SDK directly: they depend on the
//! `PaymentGateway` trait, which is injected at construction so every
//! consumer is test-fakeable. `StripeGateway` is the production
//! implementation. Every call carries a 10-second deadline so store
//! writes still have time to commit inside the per-event budget.

use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::{BillingError, BillingResult};

/// Inner deadline for a single gateway call.
const GATEWAY_DEADLINE: Duration = Duration::from_secs(10);

/// Invoice as needed by the failure-reason escalation chain and the
/// credit policy. Fetched with payment_intent and latest charge expanded.
#[derive(Debug, Clone, Default)]
pub struct GatewayInvoice {
    pub id: String,
    pub status: Option<String>,
    pub collection_method: Option<String>,
    pub attempt_count: i64,
    pub next_payment_attempt: Option<i64>,
    pub customer_id: Option<String>,
    pub subscription_id: Option<String>,
    pub payment_intent_id: Option<String>,
    /// `last_payment_error.message` from the expanded payment intent.
    pub payment_error_message: Option<String>,
    /// `failure_message` from the expanded charge.
    pub charge_failure_message: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct GatewayPaymentIntent {
    pub id: String,
    pub invoice_id: Option<String>,
    pub payment_error_message: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct GatewayCustomer {
    pub id: String,
    pub email: Option<String>,
    pub has_default_payment_method: bool,
}

#[derive(Debug, Clone, Default)]
pub struct GatewaySubscription {
    pub id: String,
    pub status: Option<String>,
    pub price_id: Option<String>,
    pub cancel_at_period_end: bool,
    pub current_period_end: Option<i64>,
    pub latest_invoice: Option<Box<GatewayInvoice>>,
}

impl GatewaySubscription {
    /// Whether the gateway considers this subscription live (dunning
    /// states included, matching the local grace policy).
    pub fn is_live(&self) -> bool {
        matches!(
            self.status.as_deref(),
            Some("active") | Some("trialing") | Some("past_due")
        )
    }
}

/// Parameters for a hosted checkout session.
#[derive(Debug, Clone)]
pub struct CheckoutParams {
    /// Gateway price id to charge.
    pub price_key: String,
    /// Payment (one-time) vs subscription mode.
    pub one_time: bool,
    pub customer_email: Option<String>,
    pub success_url: String,
    pub cancel_url: String,
    /// Propagated onto the session so webhooks can attribute it.
    pub metadata: HashMap<String, String>,
}

#[derive(Debug, Clone)]
pub struct CheckoutSessionOut {
    pub id: String,
    pub url: Option<String>,
}

/// The gateway contract the billing core consumes.
#[async_trait]
pub trait PaymentGateway: Send + Sync {
    /// Re-fetch an invoice with its payment intent and latest charge
    /// expanded. `None` when the gateway no longer knows the invoice.
    async fn fetch_invoice(&self, invoice_id: &str) -> BillingResult<Option<GatewayInvoice>>;

    async fn fetch_payment_intent(&self, id: &str)
        -> BillingResult<Option<GatewayPaymentIntent>>;

    /// Payment intents for a customer, used to locate the intent behind a
    /// failing invoice when the invoice itself does not carry it.
    async fn list_payment_intents(
        &self,
        customer_id: &str,
    ) -> BillingResult<Vec<GatewayPaymentIntent>>;

    async fn fetch_customer(&self, customer_id: &str) -> BillingResult<Option<GatewayCustomer>>;

    /// Fetch a subscription with its latest invoice expanded.
    async fn fetch_subscription(
        &self,
        pg_subscription_id: &str,
    ) -> BillingResult<Option<GatewaySubscription>>;

    /// Ask the gateway to cancel at period end. Local state is unchanged
    /// until the resulting `subscription.deleted` arrives.
    async fn cancel_at_period_end(&self, pg_subscription_id: &str) -> BillingResult<()>;

    async fn create_checkout_session(
        &self,
        params: CheckoutParams,
    ) -> BillingResult<CheckoutSessionOut>;
}

// =============================================================================
// Stripe implementation
// =============================================================================

/// Production gateway backed by the Stripe SDK.
pub struct StripeGateway {
    client: stripe::Client,
}

impl StripeGateway {
    pub fn new(secret_key: &str) -> Self {
        Self {
            client: stripe::Client::new(secret_key.to_string()),
        }
    }
}

async fn with_deadline<T, F>(fut: F) -> BillingResult<T>
where
    F: Future<Output = BillingResult<T>>,
{
    tokio::time::timeout(GATEWAY_DEADLINE, fut)
        .await
        .map_err(|_| BillingError::Gateway("gateway call timed out".into()))?
}

/// Treat a gateway 404 as absence rather than failure.
fn none_on_404<T>(result: Result<T, stripe::StripeError>) -> BillingResult<Option<T>> {
    match result {
        Ok(v) => Ok(Some(v)),
        Err(stripe::StripeError::Stripe(e)) if e.http_status == 404 => Ok(None),
        Err(e) => Err(e.into()),
    }
}

fn expandable_id<T: stripe::Object>(e: &stripe::Expandable<T>) -> String
where
    T::Id: ToString,
{
    match e {
        stripe::Expandable::Id(id) => id.to_string(),
        stripe::Expandable::Object(o) => o.id().to_string(),
    }
}

fn map_invoice(invoice: stripe::Invoice) -> GatewayInvoice {
    let payment_error_message = match &invoice.payment_intent {
        Some(stripe::Expandable::Object(pi)) => pi
            .last_payment_error
            .as_ref()
            .and_then(|e| e.message.clone()),
        _ => None,
    };
    let charge_failure_message = match &invoice.charge {
        Some(stripe::Expandable::Object(charge)) => charge.failure_message.clone(),
        _ => None,
    };

    GatewayInvoice {
        id: invoice.id.to_string(),
        status: invoice.status.map(|s| s.to_string()),
        collection_method: invoice.collection_method.map(|m| m.to_string()),
        attempt_count: invoice.attempt_count.unwrap_or(0) as i64,
        next_payment_attempt: invoice.next_payment_attempt,
        customer_id: invoice.customer.as_ref().map(expandable_id),
        subscription_id: invoice.subscription.as_ref().map(expandable_id),
        payment_intent_id: invoice.payment_intent.as_ref().map(expandable_id),
        payment_error_message,
        charge_failure_message,
    }
}

fn map_payment_intent(pi: stripe::PaymentIntent) -> GatewayPaymentIntent {
    GatewayPaymentIntent {
        id: pi.id.to_string(),
        invoice_id: pi.invoice.as_ref().map(expandable_id),
        payment_error_message: pi.last_payment_error.as_ref().and_then(|e| e.message.clone()),
    }
}

#[async_trait]
impl PaymentGateway for StripeGateway {
    async fn fetch_invoice(&self, invoice_id: &str) -> BillingResult<Option<GatewayInvoice>> {
        let id: stripe::InvoiceId = invoice_id
            .parse()
            .map_err(|_| BillingError::Gateway(format!("invalid invoice id {invoice_id}")))?;
        let result = with_deadline(async {
            Ok(none_on_404(
                stripe::Invoice::retrieve(&self.client, &id, &["payment_intent", "charge"]).await,
            )?)
        })
        .await?;
        Ok(result.map(map_invoice))
    }

    async fn fetch_payment_intent(
        &self,
        id: &str,
    ) -> BillingResult<Option<GatewayPaymentIntent>> {
        let pi_id: stripe::PaymentIntentId = id
            .parse()
            .map_err(|_| BillingError::Gateway(format!("invalid payment intent id {id}")))?;
        let result = with_deadline(async {
            Ok(none_on_404(
                stripe::PaymentIntent::retrieve(&self.client, &pi_id, &[]).await,
            )?)
        })
        .await?;
        Ok(result.map(map_payment_intent))
    }

    async fn list_payment_intents(
        &self,
        customer_id: &str,
    ) -> BillingResult<Vec<GatewayPaymentIntent>> {
        let cus_id: stripe::CustomerId = customer_id
            .parse()
            .map_err(|_| BillingError::Gateway(format!("invalid customer id {customer_id}")))?;
        let list = with_deadline(async {
            let mut params = stripe::ListPaymentIntents::new();
            params.customer = Some(cus_id);
            Ok(stripe::PaymentIntent::list(&self.client, &params).await?)
        })
        .await?;
        Ok(list.data.into_iter().map(map_payment_intent).collect())
    }

    async fn fetch_customer(&self, customer_id: &str) -> BillingResult<Option<GatewayCustomer>> {
        let cus_id: stripe::CustomerId = customer_id
            .parse()
            .map_err(|_| BillingError::Gateway(format!("invalid customer id {customer_id}")))?;
        let result = with_deadline(async {
            Ok(none_on_404(
                stripe::Customer::retrieve(&self.client, &cus_id, &[]).await,
            )?)
        })
        .await?;
        Ok(result.map(|customer| GatewayCustomer {
            id: customer.id.to_string(),
            email: customer.email.clone(),
            has_default_payment_method: customer
                .invoice_settings
                .as_ref()
                .and_then(|s| s.default_payment_method.as_ref())
                .is_some(),
        }))
    }

    async fn fetch_subscription(
        &self,
        pg_subscription_id: &str,
    ) -> BillingResult<Option<GatewaySubscription>> {
        let sub_id: stripe::SubscriptionId = pg_subscription_id.parse().map_err(|_| {
            BillingError::Gateway(format!("invalid subscription id {pg_subscription_id}"))
        })?;
        let result = with_deadline(async {
            Ok(none_on_404(
                stripe::Subscription::retrieve(
                    &self.client,
                    &sub_id,
                    &["latest_invoice", "latest_invoice.payment_intent"],
                )
                .await,
            )?)
        })
        .await?;

        Ok(result.map(|sub| {
            let latest_invoice = match &sub.latest_invoice {
                Some(stripe::Expandable::Object(invoice)) => {
                    Some(Box::new(map_invoice((**invoice).clone())))
                }
                _ => None,
            };
            let price_id = sub
                .items
                .data
                .first()
                .and_then(|item| item.price.as_ref())
                .map(|p| p.id.to_string());
            GatewaySubscription {
                id: sub.id.to_string(),
                status: Some(sub.status.to_string()),
                price_id,
                cancel_at_period_end: sub.cancel_at_period_end,
                current_period_end: Some(sub.current_period_end),
                latest_invoice,
            }
        }))
    }

    async fn cancel_at_period_end(&self, pg_subscription_id: &str) -> BillingResult<()> {
        let sub_id: stripe::SubscriptionId = pg_subscription_id.parse().map_err(|_| {
            BillingError::Gateway(format!("invalid subscription id {pg_subscription_id}"))
        })?;
        with_deadline(async {
            let params = stripe::UpdateSubscription {
                cancel_at_period_end: Some(true),
                ..Default::default()
            };
            stripe::Subscription::update(&self.client, &sub_id, params).await?;
            Ok(())
        })
        .await?;
        tracing::info!(
            pg_subscription_id = %pg_subscription_id,
            "Requested cancel at period end"
        );
        Ok(())
    }

    async fn create_checkout_session(
        &self,
        params: CheckoutParams,
    ) -> BillingResult<CheckoutSessionOut> {
        let session = with_deadline(async {
            let mut create = stripe::CreateCheckoutSession::new();
            create.mode = Some(if params.one_time {
                stripe::CheckoutSessionMode::Payment
            } else {
                stripe::CheckoutSessionMode::Subscription
            });
            create.success_url = Some(&params.success_url);
            create.cancel_url = Some(&params.cancel_url);
            create.customer_email = params.customer_email.as_deref();
            create.line_items = Some(vec![stripe::CreateCheckoutSessionLineItems {
                price: Some(params.price_key.clone()),
                quantity: Some(1),
                ..Default::default()
            }]);
            create.metadata = Some(params.metadata.clone());
            Ok(stripe::CheckoutSession::create(&self.client, create).await?)
        })
        .await?;

        Ok(CheckoutSessionOut {
            id: session.id.to_string(),
            url: session.url.clone(),
        })
    }
}
