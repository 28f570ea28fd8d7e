//! Ledgerly Background Worker
//!
//! Handles scheduled jobs:
//! - Maintenance sweep: expire batches, deactivate ended subscriptions,
//!   yearly-plan monthly refills (daily at 03:10 UTC)
//! - Reconciliation against the payment gateway (daily at 04:25 UTC)
//! - Heartbeat (every 5 minutes)

use std::sync::Arc;

use ledgerly_api::AlertService;
use ledgerly_billing::{
    BillingConfig, LedgerStore, MaintenanceWorker, PaymentGateway, ReconciliationWorker,
    StripeGateway,
};
use time::OffsetDateTime;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    // Load environment
    dotenvy::dotenv().ok();

    info!("Starting Ledgerly Worker");

    let config = BillingConfig::from_env()?;
    let pool = config.create_pool().await?;
    info!("Ledger store pool created");

    let gateway: Arc<dyn PaymentGateway> = Arc::new(StripeGateway::new(&config.pg_secret_key));
    let store = LedgerStore::new(pool.clone());
    let alerts = AlertService::new(config.alert_channel_webhook_url.clone());

    let scheduler = JobScheduler::new().await?;

    // Job 1: Maintenance sweep (daily at 03:10 UTC)
    let maintenance = Arc::new(MaintenanceWorker::new(store.clone()));
    scheduler
        .add(Job::new_async("0 10 3 * * *", move |_uuid, _l| {
            let worker = maintenance.clone();
            Box::pin(async move {
                info!("Running scheduled maintenance pass");
                match worker.run_pass(OffsetDateTime::now_utc()).await {
                    Ok(summary) => {
                        if summary.errors > 0 {
                            warn!(
                                errors = summary.errors,
                                "Maintenance pass finished with per-subscription errors"
                            );
                        }
                    }
                    Err(e) => error!(error = %e, "Maintenance pass failed"),
                }
            })
        })?)
        .await?;
    info!("Scheduled: Maintenance sweep (daily at 03:10 UTC)");

    // Job 2: Reconciliation against the gateway (daily at 04:25 UTC)
    let reconcile = Arc::new(ReconciliationWorker::new(pool.clone(), gateway.clone()));
    let reconcile_alerts = alerts.clone();
    scheduler
        .add(Job::new_async("0 25 4 * * *", move |_uuid, _l| {
            let worker = reconcile.clone();
            let alerts = reconcile_alerts.clone();
            Box::pin(async move {
                info!("Running scheduled reconciliation");
                match worker.run().await {
                    Ok(summary) if summary.healthy => {
                        info!(
                            subscriptions_checked = summary.subscriptions_checked,
                            "Reconciliation clean"
                        );
                    }
                    Ok(summary) => {
                        for anomaly in &summary.anomalies {
                            warn!(
                                check = %anomaly.check,
                                severity = %anomaly.severity,
                                description = %anomaly.description,
                                "Reconciliation anomaly"
                            );
                        }
                        alerts.notify(
                            "Reconciliation anomalies detected",
                            serde_json::json!({
                                "count": summary.anomalies.len(),
                                "anomalies": summary.anomalies,
                            }),
                        );
                    }
                    Err(e) => error!(error = %e, "Reconciliation run failed"),
                }
            })
        })?)
        .await?;
    info!("Scheduled: Reconciliation (daily at 04:25 UTC)");

    // Job 3: Health check heartbeat (every 5 minutes)
    scheduler
        .add(Job::new_async("0 */5 * * * *", |_uuid, _l| {
            Box::pin(async move {
                info!("Worker heartbeat - all systems operational");
            })
        })?)
        .await?;
    info!("Scheduled: Health check heartbeat (every 5 minutes)");

    scheduler.start().await?;
    info!("Worker started, all jobs scheduled");

    // Keep the process alive; jobs run on the scheduler's tasks.
    loop {
        tokio::time::sleep(std::time::Duration::from_secs(3600)).await;
    }
}
