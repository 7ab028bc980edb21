use async_trait::async_trait;
use serde_json::{json, Value};
use thiserror::Error;

use crate::config::AppConfig;

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("gateway not configured: missing {0}")]
    NotConfigured(&'static str),
    #[error("gateway request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("provider rejected send ({status}): {body}")]
    Provider { status: u16, body: String },
    #[error("provider response missing message id")]
    MissingMessageId,
}

/// Outbound send interface to the external messaging provider. Returns the
/// provider-assigned external message id on success.
#[async_trait]
pub trait SendGateway: Send + Sync {
    async fn send_text(&self, to: &str, body: &str) -> Result<String, GatewayError>;
    async fn send_image(&self, to: &str, link: &str, caption: &str)
        -> Result<String, GatewayError>;
    async fn send_document(
        &self,
        to: &str,
        link: &str,
        filename: &str,
        caption: &str,
    ) -> Result<String, GatewayError>;
    async fn send_location(
        &self,
        to: &str,
        latitude: f64,
        longitude: f64,
        name: &str,
    ) -> Result<String, GatewayError>;
}

/// WhatsApp Cloud API client.
pub struct CloudGateway {
    http: reqwest::Client,
    api_base: String,
    phone_number_id: String,
    access_token: String,
}

impl CloudGateway {
    pub fn new(config: &AppConfig) -> Self {
        Self {
            http: reqwest::Client::new(),
            api_base: config.gateway_api_base.trim_end_matches('/').to_string(),
            phone_number_id: config.gateway_phone_number_id.clone(),
            access_token: config.gateway_access_token.clone(),
        }
    }

    async fn dispatch(&self, mut payload: Value) -> Result<String, GatewayError> {
        if self.access_token.is_empty() {
            return Err(GatewayError::NotConfigured("access token"));
        }
        if self.phone_number_id.is_empty() {
            return Err(GatewayError::NotConfigured("phone number id"));
        }
        payload["messaging_product"] = json!("whatsapp");
        payload["recipient_type"] = json!("individual");

        let response = self
            .http
            .post(format!(
                "{}/{}/messages",
                self.api_base, self.phone_number_id
            ))
            .bearer_auth(&self.access_token)
            .json(&payload)
            .send()
            .await?;

        let status = response.status();
        let raw_body = response.text().await.unwrap_or_default();
        if !status.is_success() {
            return Err(GatewayError::Provider {
                status: status.as_u16(),
                body: raw_body,
            });
        }

        let body =
            serde_json::from_str::<Value>(&raw_body).unwrap_or_else(|_| json!({ "raw": raw_body }));
        body.get("messages")
            .and_then(Value::as_array)
            .and_then(|msgs| msgs.first())
            .and_then(|m| m.get("id"))
            .and_then(Value::as_str)
            .map(|id| id.to_string())
            .ok_or(GatewayError::MissingMessageId)
    }
}

#[async_trait]
impl SendGateway for CloudGateway {
    async fn send_text(&self, to: &str, body: &str) -> Result<String, GatewayError> {
        self.dispatch(json!({
            "to": to,
            "type": "text",
            "text": { "preview_url": false, "body": body }
        }))
        .await
    }

    async fn send_image(
        &self,
        to: &str,
        link: &str,
        caption: &str,
    ) -> Result<String, GatewayError> {
        self.dispatch(json!({
            "to": to,
            "type": "image",
            "image": { "link": link, "caption": caption }
        }))
        .await
    }

    async fn send_document(
        &self,
        to: &str,
        link: &str,
        filename: &str,
        caption: &str,
    ) -> Result<String, GatewayError> {
        self.dispatch(json!({
            "to": to,
            "type": "document",
            "document": { "link": link, "filename": filename, "caption": caption }
        }))
        .await
    }

    async fn send_location(
        &self,
        to: &str,
        latitude: f64,
        longitude: f64,
        name: &str,
    ) -> Result<String, GatewayError> {
        self.dispatch(json!({
            "to": to,
            "type": "location",
            "location": { "latitude": latitude, "longitude": longitude, "name": name }
        }))
        .await
    }
}

/// Recording gateway for tests.
#[derive(Default)]
pub struct MockGateway {
    pub sent: std::sync::Mutex<Vec<SentRecord>>,
    pub fail: std::sync::atomic::AtomicBool,
}

#[derive(Debug, Clone)]
pub struct SentRecord {
    pub to: String,
    pub kind: &'static str,
    pub body: String,
}

impl MockGateway {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sent_snapshot(&self) -> Vec<SentRecord> {
        self.sent.lock().map(|v| v.clone()).unwrap_or_default()
    }

    fn record(&self, to: &str, kind: &'static str, body: &str) -> Result<String, GatewayError> {
        if self.fail.load(std::sync::atomic::Ordering::Relaxed) {
            return Err(GatewayError::Provider {
                status: 500,
                body: "mock failure".to_string(),
            });
        }
        let mut sent = self.sent.lock().unwrap_or_else(|e| e.into_inner());
        sent.push(SentRecord {
            to: to.to_string(),
            kind,
            body: body.to_string(),
        });
        Ok(format!("wamid.mock.{}", sent.len()))
    }
}

#[async_trait]
impl SendGateway for MockGateway {
    async fn send_text(&self, to: &str, body: &str) -> Result<String, GatewayError> {
        self.record(to, "text", body)
    }

    async fn send_image(
        &self,
        to: &str,
        link: &str,
        _caption: &str,
    ) -> Result<String, GatewayError> {
        self.record(to, "image", link)
    }

    async fn send_document(
        &self,
        to: &str,
        link: &str,
        _filename: &str,
        _caption: &str,
    ) -> Result<String, GatewayError> {
        self.record(to, "document", link)
    }

    async fn send_location(
        &self,
        to: &str,
        latitude: f64,
        longitude: f64,
        _name: &str,
    ) -> Result<String, GatewayError> {
        self.record(to, "location", &format!("{latitude},{longitude}"))
    }
}
