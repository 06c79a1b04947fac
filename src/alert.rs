//! Outbound alert channel

use eyre::{Context, Result};
use reqwest::Client;
use serde::Serialize;
use std::future::Future;
use std::time::Duration;

/// Delivers a human-readable alert somewhere an operator will see it
pub trait Notifier: Send + Sync {
    /// Deliver `message`; an error means it was not delivered
    fn notify(&self, message: &str) -> impl Future<Output = Result<()>> + Send;
}

#[derive(Debug, Serialize)]
struct SlackPayload<'a> {
    text: &'a str,
}

/// Slack incoming-webhook notifier
pub struct SlackNotifier {
    webhook_url: String,
    client: Client,
}

impl SlackNotifier {
    /// Create a notifier posting to `webhook_url`
    pub fn new(webhook_url: impl Into<String>) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            webhook_url: webhook_url.into(),
            client,
        })
    }
}

impl Notifier for SlackNotifier {
    async fn notify(&self, message: &str) -> Result<()> {
        let resp = self
            .client
            .post(&self.webhook_url)
            .json(&SlackPayload { text: message })
            .send()
            .await
            .context("Failed to post Slack notification")?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            eyre::bail!("Slack notification failed: {} - {}", status, body);
        }

        Ok(())
    }
}

/// Alert channel chosen by configuration
pub enum AlertChannel {
    /// Post to Slack
    Slack(SlackNotifier),
    /// No webhook configured; the alert only appears in the logs
    LogOnly,
}

impl AlertChannel {
    /// Slack when a webhook URL is configured, log-only otherwise
    pub fn from_webhook(webhook_url: Option<&str>) -> Result<Self> {
        match webhook_url {
            Some(url) => Ok(Self::Slack(SlackNotifier::new(url)?)),
            None => Ok(Self::LogOnly),
        }
    }
}

impl Notifier for AlertChannel {
    async fn notify(&self, message: &str) -> Result<()> {
        match self {
            Self::Slack(slack) => slack.notify(message).await,
            Self::LogOnly => {
                tracing::debug!("No alert webhook configured, alert kept in logs");
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slack_payload() {
        let json = serde_json::to_string(&SlackPayload { text: "hello" }).unwrap();
        assert_eq!(json, r#"{"text":"hello"}"#);
    }

    #[tokio::test]
    async fn test_log_only_channel() {
        let channel = AlertChannel::from_webhook(None).unwrap();
        assert!(matches!(channel, AlertChannel::LogOnly));
        assert!(channel.notify("balance low").await.is_ok());
    }
}
