//! Best-effort close notifications.
//!
//! A notification describes a state transition that is already
//! committed; failure here is logged by the caller and never rolls the
//! close back.

use anyhow::Result;
use async_trait::async_trait;

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, owner: &str, message: &str) -> Result<()>;
}

/// Writes notifications to the log. The default.
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, owner: &str, message: &str) -> Result<()> {
        tracing::info!("notify {}: {}", owner, message);
        Ok(())
    }
}

/// Posts notifications to an operator-configured webhook.
pub struct WebhookNotifier {
    http_client: reqwest::Client,
    url: String,
}

impl WebhookNotifier {
    #[must_use]
    pub fn new(url: String) -> Self {
        Self {
            http_client: reqwest::Client::new(),
            url,
        }
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn notify(&self, owner: &str, message: &str) -> Result<()> {
        let body = serde_json::json!({ "owner": owner, "message": message });
        let response = self.http_client.post(&self.url).json(&body).send().await?;
        if !response.status().is_success() {
            anyhow::bail!("webhook returned {}", response.status());
        }
        Ok(())
    }
}
