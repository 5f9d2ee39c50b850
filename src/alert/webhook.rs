//! Alert delivery transports.

use async_trait::async_trait;
use thiserror::Error;

use super::AlertMessage;

/// Alert delivery error types.
#[derive(Error, Debug)]
pub enum AlertError {
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("webhook answered with status {0}")]
    Status(u16),
}

/// Delivers one alert message.
#[async_trait]
pub trait AlertTransport: Send + Sync {
    async fn deliver(&self, message: &AlertMessage) -> Result<(), AlertError>;
}

/// Posts messages as JSON to a chat webhook.
pub struct WebhookTransport {
    client: reqwest::Client,
    url: String,
}

impl WebhookTransport {
    pub fn new(url: impl Into<String>) -> Self {
        Self { client: reqwest::Client::new(), url: url.into() }
    }
}

#[async_trait]
impl AlertTransport for WebhookTransport {
    async fn deliver(&self, message: &AlertMessage) -> Result<(), AlertError> {
        let response = self.client.post(&self.url).json(message).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(AlertError::Status(status.as_u16()));
        }
        Ok(())
    }
}

/// Writes messages to the log when no webhook is configured.
pub struct LogTransport;

#[async_trait]
impl AlertTransport for LogTransport {
    async fn deliver(&self, message: &AlertMessage) -> Result<(), AlertError> {
        if let Some(content) = &message.content {
            tracing::info!("Alert: {}", content);
        }
        for embed in &message.embeds {
            tracing::info!("Alert: {}", embed.description.replace('\n', " | "));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_log_transport_accepts_everything() {
        let message = AlertMessage::content("**1 Service offline** for Checker Paris");
        assert!(LogTransport.deliver(&message).await.is_ok());
    }
}
