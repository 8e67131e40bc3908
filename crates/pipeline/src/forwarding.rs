//! Forwarding handler
//!
//! Delivers an event to a downstream HTTP service. The HTTP client is injected
//! so one connection pool is shared across handlers and tests can point it at
//! a mock server.
//!
//! Request body: `{"id": ..., "type": ..., "attempt": ..., "payload": ...}`.
//! The event id goes in `Idempotency-Key` so the downstream can drop repeats.
//! With a signing secret, `X-Eventgate-Signature: t=<unix>,v1=<hex>` carries an
//! HMAC-SHA256 of `"<t>.<body>"`.

use std::time::Duration;

use async_trait::async_trait;
use hmac::{Hmac, Mac};
use reqwest::StatusCode;
use sha2::Sha256;

use crate::error::HandlerError;
use crate::event::Event;
use crate::registry::EventHandler;

type HmacSha256 = Hmac<Sha256>;

pub const SIGNATURE_HEADER: &str = "X-Eventgate-Signature";
pub const IDEMPOTENCY_HEADER: &str = "Idempotency-Key";

#[derive(Debug, Clone)]
pub struct ForwardingHandler {
    client: reqwest::Client,
    url: String,
    signing_secret: Option<String>,
    timeout: Duration,
}

impl ForwardingHandler {
    pub fn new(client: reqwest::Client, url: impl Into<String>) -> Self {
        Self {
            client,
            url: url.into(),
            signing_secret: None,
            timeout: Duration::from_secs(10),
        }
    }

    pub fn with_signing_secret(mut self, secret: impl Into<String>) -> Self {
        self.signing_secret = Some(secret.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

/// `t=<timestamp>,v1=<hex hmac of "<timestamp>.<body>">`
pub fn sign_payload(secret: &str, timestamp: i64, body: &str) -> Result<String, HandlerError> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|_| HandlerError::permanent("Invalid forwarding signing secret"))?;
    mac.update(format!("{}.{}", timestamp, body).as_bytes());
    Ok(format!(
        "t={},v1={}",
        timestamp,
        hex::encode(mac.finalize().into_bytes())
    ))
}

/// 2xx succeeds; 408, 429 and 5xx are worth retrying; other statuses are not
fn classify_status(status: StatusCode) -> Option<bool> {
    if status.is_success() {
        None
    } else {
        Some(
            status.is_server_error()
                || status == StatusCode::REQUEST_TIMEOUT
                || status == StatusCode::TOO_MANY_REQUESTS,
        )
    }
}

#[async_trait]
impl EventHandler for ForwardingHandler {
    async fn handle(&self, event: &Event) -> Result<(), HandlerError> {
        let body = serde_json::to_string(&serde_json::json!({
            "id": event.id,
            "type": event.event_type,
            "attempt": event.attempts + 1,
            "payload": event.payload,
        }))
        .map_err(|e| HandlerError::permanent(format!("Failed to encode event: {}", e)))?;

        let mut request = self
            .client
            .post(&self.url)
            .timeout(self.timeout)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .header(IDEMPOTENCY_HEADER, &event.id);

        if let Some(secret) = &self.signing_secret {
            let timestamp = time::OffsetDateTime::now_utc().unix_timestamp();
            request = request.header(SIGNATURE_HEADER, sign_payload(secret, timestamp, &body)?);
        }

        let response = request.body(body).send().await.map_err(|e| {
            HandlerError::transient(format!("Forwarding to {} failed: {}", self.url, e))
        })?;

        let status = response.status();
        match classify_status(status) {
            None => {
                tracing::debug!(
                    event_id = %event.id,
                    url = %self.url,
                    status = status.as_u16(),
                    "Event forwarded"
                );
                Ok(())
            }
            Some(retryable) => {
                let detail = response.text().await.unwrap_or_default();
                let message = format!(
                    "Downstream {} returned {}: {}",
                    self.url,
                    status.as_u16(),
                    detail.chars().take(200).collect::<String>()
                );
                if retryable {
                    Err(HandlerError::Transient(message))
                } else {
                    Err(HandlerError::Permanent(message))
                }
            }
        }
    }
}
