//! Out-of-band alerting.
//!
//! Delivers operational alerts (reconciliation anomalies, unattributable
//! events) to an optional webhook channel. Delivery is fire-and-forget;
//! alerting must never block or fail a request path.

use serde_json::Value;

#[derive(Clone)]
pub struct AlertService {
    client: reqwest::Client,
    webhook_url: Option<String>,
}

impl AlertService {
    pub fn new(webhook_url: Option<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            webhook_url,
        }
    }

    pub fn from_env() -> Self {
        Self::new(std::env::var("ALERT_CHANNEL_WEBHOOK_URL").ok())
    }

    pub fn enabled(&self) -> bool {
        self.webhook_url.is_some()
    }

    /// Send an alert without waiting for delivery.
    pub fn notify(&self, title: &str, context: Value) {
        let Some(url) = self.webhook_url.clone() else {
            tracing::debug!(title = %title, "Alert channel not configured, dropping alert");
            return;
        };
        let client = self.client.clone();
        let title = title.to_string();
        tokio::spawn(async move {
            let body = serde_json::json!({
                "text": title,
                "context": context,
            });
            match client.post(&url).json(&body).send().await {
                Ok(response) if !response.status().is_success() => {
                    tracing::warn!(
                        status = %response.status(),
                        title = %title,
                        "Alert channel rejected alert"
                    );
                }
                Ok(_) => {}
                Err(e) => {
                    tracing::warn!(error = %e, title = %title, "Failed to deliver alert");
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disabled_without_url() {
        let alerts = AlertService::new(None);
        assert!(!alerts.enabled());
        // Must not panic or block when unconfigured.
        alerts.notify("test", serde_json::json!({}));
    }
}
