//! Reconciliation: drift detection between the gateway and the ledger store.
//!
//! ## Design Principles
//!
//! 1. **Executable**: each check is a real query or gateway cross-check
//! 2. **Explanatory**: anomalies carry enough context to debug
//! 3. **Non-destructive**: the worker only reads; it never auto-heals

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::BillingResult;
use crate::gateway::PaymentGateway;

/// Severity of a detected anomaly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AnomalySeverity {
    /// The ledger may be crediting or debiting incorrectly.
    Critical,
    /// Data inconsistency that needs attention.
    High,
    /// Potential issue, should investigate.
    Medium,
    /// Informational.
    Low,
}

impl std::fmt::Display for AnomalySeverity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AnomalySeverity::Critical => write!(f, "CRITICAL"),
            AnomalySeverity::High => write!(f, "HIGH"),
            AnomalySeverity::Medium => write!(f, "MEDIUM"),
            AnomalySeverity::Low => write!(f, "LOW"),
        }
    }
}

/// A single detected drift or inconsistency.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Anomaly {
    /// Which check fired.
    pub check: String,
    pub severity: AnomalySeverity,
    pub user_id: Option<Uuid>,
    pub subscription_id: Option<Uuid>,
    /// Human-readable description.
    pub description: String,
    /// Additional context for debugging.
    pub context: serde_json::Value,
}

/// Summary of one reconciliation run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconcileSummary {
    pub checked_at: OffsetDateTime,
    pub subscriptions_checked: usize,
    pub anomalies: Vec<Anomaly>,
    pub healthy: bool,
}

#[derive(Debug, sqlx::FromRow)]
struct ActiveSubRow {
    id: Uuid,
    user_id: Uuid,
    plan_key: String,
    pg_subscription_id: String,
}

#[derive(Debug, sqlx::FromRow)]
struct JournalDriftRow {
    batch_id: i64,
    user_id: Uuid,
    amount: i64,
    consumed: i64,
    is_active: bool,
    journal_sum: i64,
}

/// Scheduled drift detector between the gateway and the local store.
pub struct ReconciliationWorker {
    pool: PgPool,
    gateway: Arc<dyn PaymentGateway>,
}

impl ReconciliationWorker {
    pub fn new(pool: PgPool, gateway: Arc<dyn PaymentGateway>) -> Self {
        Self { pool, gateway }
    }

    /// Run all checks and return the anomaly list.
    pub async fn run(&self) -> BillingResult<ReconcileSummary> {
        let checked_at = OffsetDateTime::now_utc();
        let mut anomalies = Vec::new();

        let subscriptions: Vec<ActiveSubRow> = sqlx::query_as(
            r#"
            SELECT id, user_id, plan_key, pg_subscription_id
            FROM subscriptions
            WHERE is_active
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        let subscriptions_checked = subscriptions.len();

        for sub in &subscriptions {
            match self.gateway.fetch_subscription(&sub.pg_subscription_id).await {
                Ok(None) => anomalies.push(Anomaly {
                    check: "subscription_orphan".into(),
                    severity: AnomalySeverity::High,
                    user_id: Some(sub.user_id),
                    subscription_id: Some(sub.id),
                    description: format!(
                        "Local subscription {} not found upstream",
                        sub.pg_subscription_id
                    ),
                    context: serde_json::json!({
                        "pg_subscription_id": sub.pg_subscription_id,
                    }),
                }),
                Ok(Some(remote)) => {
                    if !remote.is_live() {
                        anomalies.push(Anomaly {
                            check: "subscription_status_drift".into(),
                            severity: AnomalySeverity::High,
                            user_id: Some(sub.user_id),
                            subscription_id: Some(sub.id),
                            description: format!(
                                "Local subscription is active but gateway status is {}",
                                remote.status.as_deref().unwrap_or("(none)")
                            ),
                            context: serde_json::json!({
                                "pg_subscription_id": sub.pg_subscription_id,
                                "gateway_status": remote.status,
                                "cancel_at_period_end": remote.cancel_at_period_end,
                            }),
                        });
                    }
                    if let Some(price_id) = &remote.price_id {
                        if price_id != &sub.plan_key {
                            anomalies.push(Anomaly {
                                check: "subscription_plan_drift".into(),
                                severity: AnomalySeverity::High,
                                user_id: Some(sub.user_id),
                                subscription_id: Some(sub.id),
                                description: format!(
                                    "Local plan_key {} but gateway price {}",
                                    sub.plan_key, price_id
                                ),
                                context: serde_json::json!({
                                    "local_plan_key": sub.plan_key,
                                    "gateway_price_id": price_id,
                                }),
                            });
                        }
                    }
                }
                Err(e) => {
                    // Transient lookup failure is not itself drift.
                    tracing::warn!(
                        pg_subscription_id = %sub.pg_subscription_id,
                        error = %e,
                        "Reconciliation lookup failed, skipping subscription"
                    );
                }
            }
        }

        anomalies.extend(self.check_journal_balance().await?);

        let summary = ReconcileSummary {
            checked_at,
            subscriptions_checked,
            healthy: anomalies.is_empty(),
            anomalies,
        };
        tracing::info!(
            subscriptions_checked = summary.subscriptions_checked,
            anomalies = summary.anomalies.len(),
            healthy = summary.healthy,
            "Reconciliation run complete"
        );
        Ok(summary)
    }

    /// Journal-sum invariant: for every active batch the journal deltas
    /// must sum to `amount − consumed`; for deactivated batches the expiry
    /// entry brings the sum to zero. Any mismatch is critical.
    async fn check_journal_balance(&self) -> BillingResult<Vec<Anomaly>> {
        let rows: Vec<JournalDriftRow> = sqlx::query_as(
            r#"
            SELECT b.id AS batch_id, b.user_id, b.amount, b.consumed, b.is_active,
                   COALESCE(SUM(te.delta), 0)::BIGINT AS journal_sum
            FROM batches b
            LEFT JOIN token_events te ON te.batch_id = b.id
            GROUP BY b.id
            HAVING COALESCE(SUM(te.delta), 0) !=
                   CASE WHEN b.is_active THEN b.amount - b.consumed ELSE 0 END
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| Anomaly {
                check: "journal_balance".into(),
                severity: AnomalySeverity::Critical,
                user_id: Some(row.user_id),
                subscription_id: None,
                description: format!(
                    "Batch {} journal sum {} does not match ledger state",
                    row.batch_id, row.journal_sum
                ),
                context: serde_json::json!({
                    "batch_id": row.batch_id,
                    "amount": row.amount,
                    "consumed": row.consumed,
                    "is_active": row.is_active,
                    "journal_sum": row.journal_sum,
                }),
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn severity_display() {
        assert_eq!(AnomalySeverity::Critical.to_string(), "CRITICAL");
        assert_eq!(AnomalySeverity::High.to_string(), "HIGH");
        assert_eq!(AnomalySeverity::Medium.to_string(), "MEDIUM");
        assert_eq!(AnomalySeverity::Low.to_string(), "LOW");
    }

    #[test]
    fn anomaly_serializes_for_alerting() {
        let anomaly = Anomaly {
            check: "subscription_orphan".into(),
            severity: AnomalySeverity::High,
            user_id: Some(Uuid::new_v4()),
            subscription_id: None,
            description: "gone".into(),
            context: serde_json::json!({"pg_subscription_id": "sub_1"}),
        };
        let json = serde_json::to_value(&anomaly).unwrap();
        assert_eq!(json["check"], "subscription_orphan");
        assert_eq!(json["severity"], "High");
    }
}
