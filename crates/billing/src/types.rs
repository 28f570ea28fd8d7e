//! Domain types shared across the billing core.

use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use time::{Date, Duration, OffsetDateTime};
use uuid::Uuid;

/// Expiry window for one-time purchase and referral batches.
pub const PURCHASE_EXPIRY_DAYS: i64 = 60;

// =============================================================================
// Enums
// =============================================================================

/// Subscription plan tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlanTier {
    Basic,
    Standard,
    Premium,
    Ultra,
    Daily,
}

impl PlanTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            PlanTier::Basic => "basic",
            PlanTier::Standard => "standard",
            PlanTier::Premium => "premium",
            PlanTier::Ultra => "ultra",
            PlanTier::Daily => "daily",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "basic" => Some(PlanTier::Basic),
            "standard" => Some(PlanTier::Standard),
            "premium" => Some(PlanTier::Premium),
            "ultra" => Some(PlanTier::Ultra),
            "daily" => Some(PlanTier::Daily),
            _ => None,
        }
    }
}

impl std::fmt::Display for PlanTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Billing period length.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BillingCycle {
    Daily,
    Monthly,
    Yearly,
}

impl BillingCycle {
    pub fn as_str(&self) -> &'static str {
        match self {
            BillingCycle::Daily => "daily",
            BillingCycle::Monthly => "monthly",
            BillingCycle::Yearly => "yearly",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "daily" => Some(BillingCycle::Daily),
            "monthly" => Some(BillingCycle::Monthly),
            "yearly" => Some(BillingCycle::Yearly),
            _ => None,
        }
    }

    /// Fallback expiry horizon when neither the invoice line nor the
    /// subscription carries a period end.
    pub fn fallback_length(&self, now: OffsetDateTime) -> OffsetDateTime {
        match self {
            BillingCycle::Daily => now + Duration::days(1),
            BillingCycle::Monthly => add_one_month(now),
            BillingCycle::Yearly => add_months(now, 12),
        }
    }
}

impl std::fmt::Display for BillingCycle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Where a credit batch came from.
///
/// Persisted as the string tag plus one nullable foreign key; in-process
/// it is matched exhaustively.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchOrigin {
    Subscription(Uuid),
    Purchase(Uuid),
    Referral(Uuid),
}

impl BatchOrigin {
    pub fn source_tag(&self) -> &'static str {
        match self {
            BatchOrigin::Subscription(_) => "subscription",
            BatchOrigin::Purchase(_) => "purchase",
            BatchOrigin::Referral(_) => "referral",
        }
    }

    pub fn subscription_id(&self) -> Option<Uuid> {
        match self {
            BatchOrigin::Subscription(id) => Some(*id),
            _ => None,
        }
    }

    pub fn purchase_id(&self) -> Option<Uuid> {
        match self {
            BatchOrigin::Purchase(id) => Some(*id),
            _ => None,
        }
    }
}

/// Stable reason tags for journal entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TokenEventReason {
    Purchase,
    SubscriptionInitialCredit,
    SubscriptionRefill,
    SubscriptionUpgradeCredit,
    ReferralReward,
    Consumption,
    Expiry,
}

impl TokenEventReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            TokenEventReason::Purchase => "purchase",
            TokenEventReason::SubscriptionInitialCredit => "subscription_initial_credit",
            TokenEventReason::SubscriptionRefill => "subscription_refill",
            TokenEventReason::SubscriptionUpgradeCredit => "subscription_upgrade_credit",
            TokenEventReason::ReferralReward => "referral_reward",
            TokenEventReason::Consumption => "consumption",
            TokenEventReason::Expiry => "expiry",
        }
    }
}

impl std::fmt::Display for TokenEventReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// =============================================================================
// Rows
// =============================================================================

#[derive(Debug, Clone, FromRow)]
pub struct UserRow {
    pub id: Uuid,
    pub user_id: String,
    pub email: String,
    pub pg_customer_id: Option<String>,
    pub has_active_subscription: bool,
    pub has_payment_issue: bool,
    pub is_deleted: bool,
}

#[derive(Debug, Clone, FromRow)]
pub struct SubscriptionRow {
    pub id: Uuid,
    pub user_id: Uuid,
    pub plan_key: String,
    pub plan_tier: String,
    pub billing_cycle: String,
    pub pg_subscription_id: String,
    pub is_active: bool,
    pub current_period_start: Option<OffsetDateTime>,
    pub current_period_end: Option<OffsetDateTime>,
    pub tokens_per_cycle: i64,
    pub price_cents: i32,
    pub last_monthly_refill: Option<OffsetDateTime>,
    pub payment_failure_reason: Option<String>,
}

impl SubscriptionRow {
    pub fn cycle(&self) -> Option<BillingCycle> {
        BillingCycle::from_str(&self.billing_cycle)
    }
}

#[derive(Debug, Clone, FromRow)]
pub struct BatchRow {
    pub id: i64,
    pub user_id: Uuid,
    pub source: String,
    pub subscription_id: Option<Uuid>,
    pub purchase_id: Option<Uuid>,
    pub invoice_id: Option<String>,
    pub amount: i64,
    pub consumed: i64,
    pub expires_at: OffsetDateTime,
    pub is_active: bool,
    pub note: String,
}

impl BatchRow {
    /// Tokens still spendable from this batch.
    pub fn remaining(&self) -> i64 {
        (self.amount - self.consumed).max(0)
    }
}

#[derive(Debug, Clone, FromRow)]
pub struct TokenEventRow {
    pub id: i64,
    pub user_id: Uuid,
    pub batch_id: i64,
    pub delta: i64,
    pub reason: String,
    pub at: OffsetDateTime,
}

#[derive(Debug, Clone, FromRow)]
pub struct ReferralRow {
    pub id: Uuid,
    pub referrer_user_id: Uuid,
    pub referred_user_id: Uuid,
    pub is_rewarded: bool,
}

// =============================================================================
// Calendar arithmetic
// =============================================================================

/// Add one calendar month, clamping the day to the target month's length.
pub fn add_one_month(t: OffsetDateTime) -> OffsetDateTime {
    add_months(t, 1)
}

/// Add `n` calendar months, clamping the day to the target month's length.
pub fn add_months(t: OffsetDateTime, n: i32) -> OffsetDateTime {
    let date = t.date();
    let total = date.year() * 12 + (date.month() as i32 - 1) + n;
    let year = total.div_euclid(12);
    let month_idx = total.rem_euclid(12) as u8 + 1;
    let month = time::Month::try_from(month_idx).expect("month index in 1..=12");
    let max_day = days_in_month(year, month);
    let day = date.day().min(max_day);
    let new_date = Date::from_calendar_date(year, month, day).expect("clamped day is valid");
    t.replace_date(new_date)
}

/// Whether two instants fall in the same calendar year-month (UTC).
pub fn same_calendar_month(a: OffsetDateTime, b: OffsetDateTime) -> bool {
    let (a, b) = (a.to_offset(time::UtcOffset::UTC), b.to_offset(time::UtcOffset::UTC));
    a.year() == b.year() && a.month() == b.month()
}

fn days_in_month(year: i32, month: time::Month) -> u8 {
    time::util::days_in_year_month(year, month)
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    #[test]
    fn tier_roundtrip() {
        for tier in ["basic", "standard", "premium", "ultra", "daily"] {
            assert_eq!(PlanTier::from_str(tier).unwrap().as_str(), tier);
        }
        assert!(PlanTier::from_str("platinum").is_none());
    }

    #[test]
    fn batch_origin_persisted_shape() {
        let sub = Uuid::new_v4();
        let origin = BatchOrigin::Subscription(sub);
        assert_eq!(origin.source_tag(), "subscription");
        assert_eq!(origin.subscription_id(), Some(sub));
        assert_eq!(origin.purchase_id(), None);

        let origin = BatchOrigin::Referral(Uuid::new_v4());
        assert_eq!(origin.source_tag(), "referral");
        assert_eq!(origin.subscription_id(), None);
        assert_eq!(origin.purchase_id(), None);
    }

    #[test]
    fn add_month_clamps_to_month_end() {
        let jan31 = datetime!(2025-01-31 12:00 UTC);
        assert_eq!(add_one_month(jan31), datetime!(2025-02-28 12:00 UTC));

        let jan31_leap = datetime!(2024-01-31 12:00 UTC);
        assert_eq!(add_one_month(jan31_leap), datetime!(2024-02-29 12:00 UTC));
    }

    #[test]
    fn add_months_crosses_year_boundary() {
        let nov = datetime!(2025-11-15 00:00 UTC);
        assert_eq!(add_months(nov, 2), datetime!(2026-01-15 00:00 UTC));
        assert_eq!(add_months(nov, 14), datetime!(2027-01-15 00:00 UTC));
    }

    #[test]
    fn same_month_comparison() {
        let a = datetime!(2025-06-01 00:00 UTC);
        let b = datetime!(2025-06-30 23:59 UTC);
        let c = datetime!(2025-07-01 00:00 UTC);
        assert!(same_calendar_month(a, b));
        assert!(!same_calendar_month(b, c));
        // Same month number, different year.
        let d = datetime!(2026-06-15 00:00 UTC);
        assert!(!same_calendar_month(a, d));
    }

    #[test]
    fn batch_remaining_never_negative() {
        let batch = BatchRow {
            id: 1,
            user_id: Uuid::new_v4(),
            source: "purchase".into(),
            subscription_id: None,
            purchase_id: None,
            invoice_id: None,
            amount: 100,
            consumed: 100,
            expires_at: OffsetDateTime::now_utc(),
            is_active: true,
            note: String::new(),
        };
        assert_eq!(batch.remaining(), 0);
    }
}
