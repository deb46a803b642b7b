use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use blast_core::config::DeliveryConfig;
use blast_core::types::{ApiPlatform, BroadcastMessage, Device, DeviceKind, MessageKind};
use reqwest::StatusCode;
use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendOutcome {
    Delivered,
    Failed(String),
    /// The gateway reports no live session behind an interactive device.
    /// The worker stops its batch on this. API devices never produce it.
    DeviceUnavailable,
}

/// Hands one message to whatever actually reaches the recipient.
#[async_trait]
pub trait Sender: Send + Sync {
    async fn send(&self, device: &Device, message: &BroadcastMessage) -> SendOutcome;
}

#[derive(Debug, Error)]
pub enum SendError {
    #[error("device {0} is misconfigured: {1}")]
    Misconfigured(String, String),

    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("endpoint returned {status}: {body}")]
    Rejected { status: StatusCode, body: String },
}

#[derive(Debug, Serialize)]
struct WhacenterRequest<'a> {
    device_id: &'a str,
    number: &'a str,
    message: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    file: Option<&'a str>,
}

#[derive(Debug, Serialize)]
struct GatewayRequest<'a> {
    message_id: i64,
    recipient: &'a str,
    recipient_name: &'a str,
    kind: MessageKind,
    content: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    media_url: Option<&'a str>,
}

/// Sender over HTTP: vendor APIs for API devices, the connection gateway for
/// interactive devices.
pub struct HttpSender {
    client: Arc<reqwest::Client>,
    gateway_url: Option<String>,
    wablas_api_url: String,
    whacenter_api_url: String,
}

impl HttpSender {
    pub fn new(config: &DeliveryConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .map_err(|e| anyhow!("Failed to create HTTP client: {}", e))?;

        if config.gateway_url.is_none() {
            tracing::warn!("No connection gateway configured, interactive devices cannot send");
        }

        Ok(Self {
            client: Arc::new(client),
            gateway_url: config.gateway_url.as_ref().map(|u| u.trim_end_matches('/').to_string()),
            wablas_api_url: config.wablas_api_url.trim_end_matches('/').to_string(),
            whacenter_api_url: config.whacenter_api_url.trim_end_matches('/').to_string(),
        })
    }

    fn build_request(
        &self,
        device: &Device,
        message: &BroadcastMessage,
    ) -> Result<reqwest::Request, SendError> {
        let request = match device.kind {
            DeviceKind::Api(ApiPlatform::Wablas) => self.wablas_request(device, message)?,
            DeviceKind::Api(ApiPlatform::Whacenter) => self.whacenter_request(device, message)?,
            DeviceKind::Interactive => self.gateway_request(device, message)?,
        };
        Ok(request.build()?)
    }

    fn wablas_request(
        &self,
        device: &Device,
        message: &BroadcastMessage,
    ) -> Result<reqwest::RequestBuilder, SendError> {
        let token = api_token(device)?;
        let phone = message.recipient_address.as_str();
        let caption = message.content.as_str();

        let (path, form): (&str, Vec<(&str, &str)>) = match (message.message_kind, message.media_url.as_deref()) {
            (MessageKind::Text, _) | (_, None) => ("send-message", vec![("phone", phone), ("message", caption)]),
            (MessageKind::Image, Some(url)) => {
                ("send-image", vec![("phone", phone), ("image", url), ("caption", caption)])
            }
            (MessageKind::Video, Some(url)) => {
                ("send-video", vec![("phone", phone), ("video", url), ("caption", caption)])
            }
            (MessageKind::Document, Some(url)) => {
                ("send-document", vec![("phone", phone), ("document", url)])
            }
        };

        Ok(self
            .client
            .post(format!("{}/{}", self.wablas_api_url, path))
            .header("Authorization", token)
            .form(&form))
    }

    fn whacenter_request(
        &self,
        device: &Device,
        message: &BroadcastMessage,
    ) -> Result<reqwest::RequestBuilder, SendError> {
        let token = api_token(device)?;
        Ok(self
            .client
            .post(format!("{}/send", self.whacenter_api_url))
            .json(&WhacenterRequest {
                device_id: token,
                number: &message.recipient_address,
                message: &message.content,
                file: message.media_url.as_deref(),
            }))
    }

    fn gateway_request(
        &self,
        device: &Device,
        message: &BroadcastMessage,
    ) -> Result<reqwest::RequestBuilder, SendError> {
        let gateway = self.gateway_url.as_deref().ok_or_else(|| {
            SendError::Misconfigured(device.id.clone(), "no connection gateway configured".into())
        })?;
        Ok(self
            .client
            .post(format!("{}/devices/{}/messages", gateway, device.id))
            .json(&GatewayRequest {
                message_id: message.id,
                recipient: &message.recipient_address,
                recipient_name: &message.recipient_name,
                kind: message.message_kind,
                content: &message.content,
                media_url: message.media_url.as_deref(),
            }))
    }

    async fn try_send(&self, device: &Device, message: &BroadcastMessage) -> Result<(), SendError> {
        let request = self.build_request(device, message)?;
        let response = self.client.execute(request).await?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        let body = response
            .text()
            .await
            .unwrap_or_else(|_| "Unknown error".to_string());
        Err(SendError::Rejected { status, body })
    }
}

fn api_token(device: &Device) -> Result<&str, SendError> {
    device
        .api_token
        .as_deref()
        .filter(|t| !t.trim().is_empty())
        .ok_or_else(|| SendError::Misconfigured(device.id.clone(), "missing api token".into()))
}

/// A 409 or 503 from the connection gateway means the session behind an
/// interactive device is not there. Vendor APIs answering the same way only
/// fail the one message.
fn classify(device: &Device, result: Result<(), SendError>) -> SendOutcome {
    match (device.kind, result) {
        (_, Ok(())) => SendOutcome::Delivered,
        (DeviceKind::Interactive, Err(SendError::Rejected { status, .. }))
            if status == StatusCode::CONFLICT || status == StatusCode::SERVICE_UNAVAILABLE =>
        {
            SendOutcome::DeviceUnavailable
        }
        (_, Err(e)) => SendOutcome::Failed(e.to_string()),
    }
}

#[async_trait]
impl Sender for HttpSender {
    async fn send(&self, device: &Device, message: &BroadcastMessage) -> SendOutcome {
        let outcome = classify(device, self.try_send(device, message).await);
        match &outcome {
            SendOutcome::Delivered => {
                tracing::debug!("Message {} delivered via device {}", message.id, device.id)
            }
            SendOutcome::Failed(reason) => {
                tracing::warn!("Message {} failed on device {}: {}", message.id, device.id, reason)
            }
            SendOutcome::DeviceUnavailable => {
                tracing::warn!("Device {} unavailable while sending message {}", device.id, message.id)
            }
        }
        outcome
    }
}
