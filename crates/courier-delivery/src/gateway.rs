//! External send gateway client.
//!
//! The messaging provider's REST API is an opaque HTTP endpoint to this
//! pipeline; all that matters here is the bounded timeout and the
//! classification of the response into the retry decision tree. The
//! production client posts the job as JSON and maps responses onto the
//! delivery error taxonomy.

use std::time::Duration;

use async_trait::async_trait;
use courier_core::OutboundMessageJob;
use serde::Deserialize;
use tracing::{debug, warn};

use crate::error::{DeliveryError, Result};

/// Acknowledgement from a successful send.
#[derive(Debug, Clone)]
pub struct SendAck {
    /// Provider-assigned message id, when the gateway returns one.
    pub provider_message_id: Option<String>,
    /// HTTP status code of the accepting response.
    pub status_code: u16,
}

/// Outbound send operation, implemented by the production HTTP client and
/// by scripted test doubles.
#[async_trait]
pub trait SendGateway: Send + Sync + 'static {
    /// Attempts to deliver one message. Implementations carry their own
    /// bounded timeout; errors are classified per the delivery taxonomy.
    async fn send_message(&self, job: &OutboundMessageJob) -> Result<SendAck>;
}

/// Configuration for the HTTP send gateway.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Endpoint messages are posted to.
    pub url: String,
    /// Bounded timeout per send call.
    pub timeout: Duration,
    /// User agent sent with every request.
    pub user_agent: String,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            url: "http://localhost:9090/send".to_string(),
            timeout: Duration::from_secs(15),
            user_agent: "Courier-Delivery/1.0".to_string(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct SendResponseBody {
    #[serde(rename = "messageId")]
    message_id: Option<String>,
}

/// Production gateway client over reqwest.
#[derive(Debug, Clone)]
pub struct HttpSendGateway {
    client: reqwest::Client,
    config: GatewayConfig,
}

impl HttpSendGateway {
    /// Builds the client with the configured timeout and user agent.
    pub fn new(config: GatewayConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .user_agent(&config.user_agent)
            .build()
            .map_err(|e| DeliveryError::internal(format!("failed to build HTTP client: {e}")))?;

        Ok(Self { client, config })
    }
}

#[async_trait]
impl SendGateway for HttpSendGateway {
    async fn send_message(&self, job: &OutboundMessageJob) -> Result<SendAck> {
        let body = serde_json::json!({
            "instanceName": job.instance_name,
            "recipient": job.recipient,
            "payload": job.payload,
        });

        debug!(job_id = %job.id, attempt = job.attempt, url = %self.config.url, "sending message");

        let response = self
            .client
            .post(&self.config.url)
            .json(&body)
            .header("X-Courier-Job-Id", job.id.to_string())
            .header("X-Courier-Attempt", job.attempt.to_string())
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    DeliveryError::timeout(self.config.timeout.as_secs())
                } else if e.is_connect() {
                    DeliveryError::network(format!("connection failed: {e}"))
                } else {
                    DeliveryError::network(e.to_string())
                }
            })?;

        let status = response.status().as_u16();
        match status {
            200..=299 => {
                let provider_message_id = response
                    .json::<SendResponseBody>()
                    .await
                    .ok()
                    .and_then(|b| b.message_id);
                Ok(SendAck { provider_message_id, status_code: status })
            },
            429 => {
                let retry_after_seconds = response
                    .headers()
                    .get(reqwest::header::RETRY_AFTER)
                    .and_then(|v| v.to_str().ok())
                    .and_then(|v| v.parse::<u64>().ok());
                warn!(job_id = %job.id, retry_after_seconds, "gateway rate limited");
                Err(DeliveryError::RateLimited { retry_after_seconds })
            },
            400..=499 => {
                let reason = truncated_body(response).await;
                Err(DeliveryError::gateway_rejected(status, reason))
            },
            _ => {
                let body = truncated_body(response).await;
                Err(DeliveryError::gateway_server(status, body))
            },
        }
    }
}

/// Response bodies are only kept for diagnostics; cap what we retain.
async fn truncated_body(response: reqwest::Response) -> String {
    const MAX_BODY: usize = 512;
    let mut body = response.text().await.unwrap_or_default();
    if body.len() > MAX_BODY {
        body.truncate(MAX_BODY);
    }
    body
}
