// Billing crate clippy configuration
// These are intentional patterns in this crate:
#![allow(clippy::too_many_arguments)] // Some ledger operations require many parameters
// Test code patterns (expected in test files):
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! Ledgerly Billing Core
//!
//! Reconciles payment-gateway events with an auditable token ledger.
//!
//! ## Features
//!
//! - **Event Ingest**: verify, deduplicate, and route gateway webhooks
//! - **Token Ledger**: per-user credit batches with FIFO-by-expiry
//!   consumption and an append-only journal
//! - **Subscription Lifecycle**: explicit state machine with dunning grace
//! - **Maintenance**: expiry sweep, period-end deactivation, yearly-plan
//!   monthly refills
//! - **Reconciliation**: drift detection against the gateway

pub mod catalog;
pub mod config;
pub mod error;
pub mod events;
pub mod gateway;
pub mod ledger;
pub mod maintenance;
pub mod reconcile;
pub mod referral;
pub mod store;
pub mod subscription;
pub mod types;
pub mod webhooks;


pub use catalog::{Catalog, SubscriptionPrice, TokenPrice};
pub use config::BillingConfig;
pub use error::{BillingError, BillingResult};
pub use gateway::{
    CheckoutParams, CheckoutSessionOut, PaymentGateway, StripeGateway,
};
pub use ledger::{ConsumeMode, TokenLedger};
pub use maintenance::{MaintenanceSummary, MaintenanceWorker};
pub use reconcile::{Anomaly, AnomalySeverity, ReconcileSummary, ReconciliationWorker};
pub use referral::ReferralService;
pub use store::LedgerStore;
pub use subscription::{SubscriptionService, SubscriptionState};
pub use types::{BatchOrigin, BillingCycle, PlanTier, TokenEventReason};
pub use webhooks::{DispatchOutcome, EventDispatcher};
