//! HTTP client for outbound webhook delivery with a bounded timeout.
//!
//! A delivery is a single POST to the job's `send_url`. The JSON payload is
//! sent verbatim with `Content-Type: application/json`; jobs without a
//! payload are posted with no body and no content type.

use std::time::{Duration, Instant};

use bytes::Bytes;
use courier_core::{Webhook, WebhookId};
use reqwest::{header::CONTENT_TYPE, Response};
use serde::{Deserialize, Serialize};
use tracing::{info_span, Instrument};

use crate::error::{DeliveryError, Result};

/// Upper bound on stored response text.
const MAX_RESPONSE_TEXT_SIZE: usize = 64 * 1024;

/// Configuration for the webhook delivery client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Timeout for the whole request, including reading the response body.
    pub timeout: Duration,
    /// User agent string for requests.
    pub user_agent: String,
    /// Maximum number of redirects to follow.
    pub max_redirects: u32,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(crate::DEFAULT_TIMEOUT_SECONDS),
            user_agent: "Courier-Webhook-Delivery/1.0".to_string(),
            max_redirects: 3,
        }
    }
}

/// HTTP client used by delivery workers.
///
/// Cloning is cheap; clones share one connection pool.
#[derive(Debug, Clone)]
pub struct DeliveryClient {
    client: reqwest::Client,
    config: ClientConfig,
}

/// One outbound delivery.
#[derive(Debug, Clone)]
pub struct DeliveryRequest {
    /// Job being delivered.
    pub webhook_id: WebhookId,
    /// Destination URL.
    pub url: String,
    /// Serialized JSON payload; `None` sends no body.
    pub body: Option<Bytes>,
    /// 1-based attempt number, for logging.
    pub attempt_number: i32,
}

impl DeliveryRequest {
    /// Builds the request for a claimed job.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::InternalError` if the payload cannot be
    /// serialized.
    pub fn for_webhook(job: &Webhook) -> Result<Self> {
        let body = job
            .payload()
            .map(|value| serde_json::to_vec(value).map(Bytes::from))
            .transpose()
            .map_err(|e| DeliveryError::internal(format!("failed to serialize payload: {e}")))?;

        Ok(Self {
            webhook_id: job.id,
            url: job.send_url.clone(),
            body,
            attempt_number: job.attempt_count.saturating_add(1),
        })
    }
}

/// Response from a delivery attempt that reached the endpoint.
#[derive(Debug, Clone)]
pub struct DeliveryResponse {
    /// HTTP status code.
    pub status_code: u16,
    /// Response body, truncated to a bounded size.
    pub body: String,
    /// Time until the full response was read.
    pub duration: Duration,
    /// Whether the status was 2xx.
    pub is_success: bool,
}

impl DeliveryClient {
    /// Creates a new delivery client with the given configuration.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::ConfigurationError` if the HTTP client cannot
    /// be configured with the provided settings.
    pub fn new(config: ClientConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .user_agent(&config.user_agent)
            .redirect(reqwest::redirect::Policy::limited(config.max_redirects as usize))
            .build()
            .map_err(|e| {
                DeliveryError::configuration(format!("failed to build HTTP client: {e}"))
            })?;

        Ok(Self { client, config })
    }

    /// Creates a new delivery client with default configuration.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::ConfigurationError` if the HTTP client cannot
    /// be built.
    pub fn with_defaults() -> Result<Self> {
        Self::new(ClientConfig::default())
    }

    /// Configured request timeout.
    pub fn timeout(&self) -> Duration {
        self.config.timeout
    }

    /// Posts a webhook to its destination.
    ///
    /// Any HTTP status, success or not, is returned as `Ok`; the caller
    /// classifies it.
    ///
    /// # Errors
    ///
    /// - `Timeout` when the request exceeded the configured timeout
    /// - `NetworkError` for connection and other transport failures
    pub async fn deliver(&self, request: DeliveryRequest) -> Result<DeliveryResponse> {
        let start_time = Instant::now();

        let span = info_span!(
            "webhook_delivery",
            webhook_id = %request.webhook_id,
            url = %request.url,
            attempt = request.attempt_number
        );

        async move {
            tracing::debug!("starting webhook delivery");

            let mut http_request = self.client.post(&request.url);
            if let Some(body) = request.body {
                http_request = http_request.header(CONTENT_TYPE, "application/json").body(body);
            }

            let response = match http_request.send().await {
                Ok(response) => response,
                Err(e) => {
                    let duration = start_time.elapsed();
                    tracing::warn!(duration_ms = duration.as_millis(), "request failed: {}", e);

                    if e.is_timeout() {
                        return Err(DeliveryError::timeout(self.config.timeout.as_secs()));
                    }
                    if e.is_connect() {
                        return Err(DeliveryError::network(format!("connection failed: {e}")));
                    }
                    return Err(DeliveryError::network(e.to_string()));
                },
            };

            let delivery_response = self.parse_response(response, start_time).await?;

            if delivery_response.is_success {
                tracing::info!(
                    status = delivery_response.status_code,
                    duration_ms = delivery_response.duration.as_millis(),
                    "webhook delivered"
                );
            } else {
                tracing::warn!(
                    status = delivery_response.status_code,
                    duration_ms = delivery_response.duration.as_millis(),
                    "endpoint rejected webhook"
                );
            }

            Ok(delivery_response)
        }
        .instrument(span)
        .await
    }

    async fn parse_response(
        &self,
        response: Response,
        start_time: Instant,
    ) -> Result<DeliveryResponse> {
        let status_code = response.status().as_u16();
        let is_success = response.status().is_success();

        let body = match response.bytes().await {
            Ok(bytes) => truncate_text(&bytes),
            Err(e) if e.is_timeout() => {
                return Err(DeliveryError::timeout(self.config.timeout.as_secs()));
            },
            Err(e) => {
                tracing::warn!("failed to read response body: {}", e);
                format!("[failed to read response body: {e}]")
            },
        };

        Ok(DeliveryResponse { status_code, body, duration: start_time.elapsed(), is_success })
    }
}

/// Decodes a response body for storage. Postgres `TEXT` rejects NUL, so it
/// is replaced.
fn truncate_text(bytes: &[u8]) -> String {
    let text = if bytes.len() > MAX_RESPONSE_TEXT_SIZE {
        let suffix = "... (truncated)";
        let truncated = String::from_utf8_lossy(&bytes[..MAX_RESPONSE_TEXT_SIZE - suffix.len()]);
        format!("{truncated}{suffix}")
    } else {
        String::from_utf8_lossy(bytes).into_owned()
    };
    strip_nul(text)
}

pub(crate) fn strip_nul(text: String) -> String {
    if text.contains('\0') {
        text.replace('\0', "\u{FFFD}")
    } else {
        text
    }
}
