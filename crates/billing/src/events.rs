//! Typed webhook event envelopes.
//!
//! The dispatcher re-parses the raw body itself; the models here are
//! explicit, typed records per event kind. Unknown fields are ignored at
//! parse time, and fields a handler requires are checked where it uses
//! them.

use serde::Deserialize;
use serde_json::Value;
use time::OffsetDateTime;

use crate::error::{BillingError, BillingResult};

/// The gateway's JSON event envelope.
#[derive(Debug, Clone, Deserialize)]
pub struct PgEvent {
    pub id: String,
    #[serde(rename = "type")]
    pub event_type: String,
    #[serde(default)]
    pub created: Option<i64>,
    pub data: EventData,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EventData {
    pub object: Value,
}

impl PgEvent {
    pub fn parse(payload: &str) -> BillingResult<Self> {
        serde_json::from_str(payload).map_err(|e| BillingError::MalformedEvent(e.to_string()))
    }

    pub fn kind(&self) -> EventKind {
        EventKind::from_type(&self.event_type)
    }

    pub fn created_at(&self) -> Option<OffsetDateTime> {
        self.created
            .and_then(|ts| OffsetDateTime::from_unix_timestamp(ts).ok())
    }

    /// Extract the event object as a typed record.
    pub fn object<T: serde::de::DeserializeOwned>(&self) -> BillingResult<T> {
        serde_json::from_value(self.data.object.clone())
            .map_err(|e| BillingError::MalformedEvent(format!("{}: {e}", self.event_type)))
    }
}

/// Routable event kinds. Anything else is acknowledged without effects.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventKind {
    CheckoutSessionCompleted,
    SubscriptionCreated,
    SubscriptionUpdated,
    SubscriptionDeleted,
    InvoicePaid,
    InvoicePaymentSucceeded,
    InvoicePaymentFailed,
    PaymentIntentFailed,
    PaymentIntentSucceeded,
    ChargeFailed,
    Other(String),
}

impl EventKind {
    pub fn from_type(event_type: &str) -> Self {
        match event_type {
            "checkout.session.completed" => EventKind::CheckoutSessionCompleted,
            "customer.subscription.created" => EventKind::SubscriptionCreated,
            "customer.subscription.updated" => EventKind::SubscriptionUpdated,
            "customer.subscription.deleted" => EventKind::SubscriptionDeleted,
            "invoice.paid" => EventKind::InvoicePaid,
            "invoice.payment_succeeded" => EventKind::InvoicePaymentSucceeded,
            "invoice.payment_failed" => EventKind::InvoicePaymentFailed,
            "payment_intent.payment_failed" => EventKind::PaymentIntentFailed,
            "payment_intent.succeeded" => EventKind::PaymentIntentSucceeded,
            "charge.failed" => EventKind::ChargeFailed,
            other => EventKind::Other(other.to_string()),
        }
    }
}

/// A reference the gateway may deliver inline or as a bare id.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum Ref {
    Id(String),
    Object { id: String },
}

impl Ref {
    pub fn id(&self) -> &str {
        match self {
            Ref::Id(id) => id,
            Ref::Object { id } => id,
        }
    }
}

/// Free-form metadata with the keys the handlers care about.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Metadata {
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub plan_option: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct TotalDetails {
    #[serde(default)]
    pub amount_discount: Option<i64>,
}

/// `checkout.session.completed` object.
#[derive(Debug, Clone, Deserialize)]
pub struct CheckoutSessionObject {
    pub id: String,
    #[serde(default)]
    pub mode: Option<String>,
    #[serde(default)]
    pub customer: Option<Ref>,
    #[serde(default)]
    pub customer_email: Option<String>,
    #[serde(default)]
    pub metadata: Metadata,
    #[serde(default)]
    pub total_details: TotalDetails,
    #[serde(default)]
    pub amount_total: Option<i64>,
    #[serde(default)]
    pub subscription: Option<Ref>,
}

impl CheckoutSessionObject {
    pub fn is_payment_mode(&self) -> bool {
        self.mode.as_deref() == Some("payment")
    }

    pub fn is_subscription_mode(&self) -> bool {
        self.mode.as_deref() == Some("subscription")
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct InvoiceLinePeriod {
    #[serde(default)]
    pub start: Option<i64>,
    #[serde(default)]
    pub end: Option<i64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct InvoiceLine {
    #[serde(default)]
    pub period: InvoiceLinePeriod,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct InvoiceLines {
    #[serde(default)]
    pub data: Vec<InvoiceLine>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SubscriptionDetails {
    #[serde(default)]
    pub metadata: Metadata,
}

/// Invoice object as delivered on `invoice.*` events.
#[derive(Debug, Clone, Deserialize)]
pub struct InvoiceObject {
    pub id: String,
    #[serde(default)]
    pub customer: Option<Ref>,
    #[serde(default)]
    pub subscription: Option<Ref>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub billing_reason: Option<String>,
    #[serde(default)]
    pub collection_method: Option<String>,
    #[serde(default)]
    pub payment_intent: Option<Ref>,
    #[serde(default)]
    pub charge: Option<Ref>,
    #[serde(default)]
    pub attempt_count: Option<i64>,
    #[serde(default)]
    pub next_payment_attempt: Option<i64>,
    #[serde(default)]
    pub lines: InvoiceLines,
    #[serde(default)]
    pub subscription_details: SubscriptionDetails,
}

/// The credit-grant cadence a paid invoice represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BillingReason {
    SubscriptionCreate,
    SubscriptionCycle,
    SubscriptionUpdate,
    Other,
}

impl InvoiceObject {
    pub fn is_paid(&self) -> bool {
        self.status.as_deref() == Some("paid")
    }

    pub fn reason(&self) -> BillingReason {
        match self.billing_reason.as_deref() {
            Some("subscription_create") => BillingReason::SubscriptionCreate,
            Some("subscription_cycle") => BillingReason::SubscriptionCycle,
            Some("subscription_update") => BillingReason::SubscriptionUpdate,
            _ => BillingReason::Other,
        }
    }

    /// Latest line-period end across the invoice lines, the preferred
    /// batch expiry.
    pub fn line_period_end(&self) -> Option<OffsetDateTime> {
        self.lines
            .data
            .iter()
            .filter_map(|l| l.period.end)
            .max()
            .and_then(|ts| OffsetDateTime::from_unix_timestamp(ts).ok())
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SubscriptionItemPrice {
    #[serde(default)]
    pub id: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SubscriptionItem {
    #[serde(default)]
    pub price: SubscriptionItemPrice,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SubscriptionItems {
    #[serde(default)]
    pub data: Vec<SubscriptionItem>,
}

/// Subscription object as delivered on `customer.subscription.*` events.
#[derive(Debug, Clone, Deserialize)]
pub struct SubscriptionObject {
    pub id: String,
    #[serde(default)]
    pub customer: Option<Ref>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub cancel_at_period_end: Option<bool>,
    #[serde(default)]
    pub current_period_start: Option<i64>,
    #[serde(default)]
    pub current_period_end: Option<i64>,
    #[serde(default)]
    pub metadata: Metadata,
    #[serde(default)]
    pub items: SubscriptionItems,
}

impl SubscriptionObject {
    /// The gateway price id of the first subscription item.
    pub fn price_id(&self) -> Option<&str> {
        self.items
            .data
            .first()
            .and_then(|item| item.price.id.as_deref())
    }

    pub fn period_start(&self) -> Option<OffsetDateTime> {
        self.current_period_start
            .and_then(|ts| OffsetDateTime::from_unix_timestamp(ts).ok())
    }

    pub fn period_end(&self) -> Option<OffsetDateTime> {
        self.current_period_end
            .and_then(|ts| OffsetDateTime::from_unix_timestamp(ts).ok())
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct LastPaymentError {
    #[serde(default)]
    pub message: Option<String>,
}

/// Payment-intent object for one-time purchases and failure events.
#[derive(Debug, Clone, Deserialize)]
pub struct PaymentIntentObject {
    pub id: String,
    #[serde(default)]
    pub customer: Option<Ref>,
    #[serde(default)]
    pub invoice: Option<Ref>,
    #[serde(default)]
    pub metadata: Metadata,
    #[serde(default)]
    pub last_payment_error: Option<LastPaymentError>,
}

/// Charge object for `charge.failed`.
#[derive(Debug, Clone, Deserialize)]
pub struct ChargeObject {
    pub id: String,
    #[serde(default)]
    pub customer: Option<Ref>,
    #[serde(default)]
    pub invoice: Option<Ref>,
    #[serde(default)]
    pub failure_message: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_checkout_session_with_discount() {
        let payload = r#"{
            "id": "evt_1",
            "type": "checkout.session.completed",
            "created": 1735689600,
            "data": { "object": {
                "id": "cs_test_1",
                "object": "checkout.session",
                "mode": "payment",
                "customer": "cus_9",
                "metadata": { "user_id": "u1", "plan_option": "tier1" },
                "total_details": { "amount_discount": 1000 },
                "amount_total": 4000,
                "unknown_field": [1, 2, 3]
            } }
        }"#;

        let event = PgEvent::parse(payload).unwrap();
        assert_eq!(event.kind(), EventKind::CheckoutSessionCompleted);

        let session: CheckoutSessionObject = event.object().unwrap();
        assert!(session.is_payment_mode());
        assert_eq!(session.customer.as_ref().unwrap().id(), "cus_9");
        assert_eq!(session.metadata.user_id.as_deref(), Some("u1"));
        assert_eq!(session.metadata.plan_option.as_deref(), Some("tier1"));
        assert_eq!(session.total_details.amount_discount, Some(1000));
    }

    #[test]
    fn parses_invoice_with_expanded_customer_object() {
        let payload = r#"{
            "id": "evt_2",
            "type": "invoice.paid",
            "data": { "object": {
                "id": "in_1",
                "status": "paid",
                "billing_reason": "subscription_create",
                "customer": { "id": "cus_9", "email": "a@b.c" },
                "subscription": "sub_1",
                "lines": { "data": [
                    { "period": { "start": 1735689600, "end": 1738368000 } }
                ] }
            } }
        }"#;

        let event = PgEvent::parse(payload).unwrap();
        let invoice: InvoiceObject = event.object().unwrap();
        assert!(invoice.is_paid());
        assert_eq!(invoice.reason(), BillingReason::SubscriptionCreate);
        assert_eq!(invoice.customer.as_ref().unwrap().id(), "cus_9");
        assert_eq!(invoice.subscription.as_ref().unwrap().id(), "sub_1");
        assert!(invoice.line_period_end().is_some());
    }

    #[test]
    fn unknown_event_type_is_other() {
        let payload = r#"{
            "id": "evt_3",
            "type": "customer.tax_id.created",
            "data": { "object": {} }
        }"#;
        let event = PgEvent::parse(payload).unwrap();
        assert_eq!(
            event.kind(),
            EventKind::Other("customer.tax_id.created".into())
        );
    }

    #[test]
    fn missing_optional_fields_default() {
        let payload = r#"{
            "id": "evt_4",
            "type": "invoice.payment_failed",
            "data": { "object": { "id": "in_2" } }
        }"#;
        let event = PgEvent::parse(payload).unwrap();
        let invoice: InvoiceObject = event.object().unwrap();
        assert!(!invoice.is_paid());
        assert_eq!(invoice.reason(), BillingReason::Other);
        assert!(invoice.customer.is_none());
        assert!(invoice.lines.data.is_empty());
    }

    #[test]
    fn malformed_payload_is_rejected() {
        assert!(matches!(
            PgEvent::parse("{not json"),
            Err(BillingError::MalformedEvent(_))
        ));
    }

    #[test]
    fn subscription_object_price_and_period() {
        let payload = r#"{
            "id": "evt_5",
            "type": "customer.subscription.created",
            "data": { "object": {
                "id": "sub_1",
                "customer": "cus_9",
                "status": "active",
                "current_period_start": 1735689600,
                "current_period_end": 1738368000,
                "metadata": { "user_id": "u1" },
                "items": { "data": [ { "price": { "id": "price_basic_m" } } ] }
            } }
        }"#;
        let event = PgEvent::parse(payload).unwrap();
        let sub: SubscriptionObject = event.object().unwrap();
        assert_eq!(sub.price_id(), Some("price_basic_m"));
        assert!(sub.period_end().unwrap() > sub.period_start().unwrap());
        assert_eq!(sub.metadata.user_id.as_deref(), Some("u1"));
    }
}
