//! Mail transports.
//!
//! - `LogTransport`: logs each notification; for local runs
//! - `WebhookTransport`: POSTs JSON to a mail relay

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;
use tracing::{debug, info, warn};

use super::{MailTransport, TransportError};
use crate::config::{TransportSettings, TransportType};

/// Logs notifications instead of sending them.
#[derive(Debug, Default, Clone)]
pub struct LogTransport;

#[async_trait]
impl MailTransport for LogTransport {
    async fn deliver(
        &self,
        recipient: &str,
        subject: &str,
        body: &str,
    ) -> Result<(), TransportError> {
        info!(
            recipient = %recipient,
            subject = %subject,
            body_len = body.len(),
            "Notification delivered"
        );
        Ok(())
    }

    fn name(&self) -> &str {
        "log"
    }
}

#[derive(Serialize)]
struct RelayMessage<'a> {
    to: &'a str,
    subject: &'a str,
    body: &'a str,
}

/// Sends notifications to an HTTP mail relay.
pub struct WebhookTransport {
    client: Client,
    endpoint: String,
}

impl WebhookTransport {
    pub fn new(endpoint: impl Into<String>, timeout: Duration) -> Result<Self, TransportError> {
        let endpoint = endpoint.into();
        if endpoint.is_empty() {
            return Err(TransportError::Config(
                "webhook endpoint not configured".to_string(),
            ));
        }

        let client = Client::builder().timeout(timeout).build()?;

        Ok(Self { client, endpoint })
    }
}

#[async_trait]
impl MailTransport for WebhookTransport {
    async fn deliver(
        &self,
        recipient: &str,
        subject: &str,
        body: &str,
    ) -> Result<(), TransportError> {
        let response = self
            .client
            .post(&self.endpoint)
            .json(&RelayMessage {
                to: recipient,
                subject,
                body,
            })
            .send()
            .await?;

        let status = response.status();
        if status.is_success() {
            debug!(
                endpoint = %self.endpoint,
                recipient = %recipient,
                "Mail relay accepted message"
            );
            return Ok(());
        }

        let text = response.text().await.unwrap_or_default();
        let detail = format!(
            "HTTP {} - {}",
            status,
            text.chars().take(200).collect::<String>()
        );
        warn!(endpoint = %self.endpoint, status = %status, "Mail relay returned error");

        if status == reqwest::StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
            Err(TransportError::Unavailable(detail))
        } else {
            Err(TransportError::Rejected(detail))
        }
    }

    fn name(&self) -> &str {
        "webhook"
    }
}

/// Build the transport named by the settings.
pub fn from_settings(
    settings: &TransportSettings,
) -> Result<Box<dyn MailTransport>, TransportError> {
    match settings.transport_type {
        TransportType::Log => Ok(Box::new(LogTransport)),
        TransportType::Webhook => {
            let url = settings.url.clone().ok_or_else(|| {
                TransportError::Config("webhook transport requires a url".to_string())
            })?;
            Ok(Box::new(WebhookTransport::new(url, settings.timeout())?))
        }
    }
}
