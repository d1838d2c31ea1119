//! Best-effort notification of a job's terminal outcome.
//!
//! A single POST per terminal resolution, sent on a background task so the
//! worker moves on immediately. Failures are logged and dropped: the job's
//! state is already final and the callback is never retried.

use std::time::Duration;

use courier_core::{JobStatus, NewRunLogEntry, Webhook, WebhookId};
use serde::{Deserialize, Serialize};
use tokio_util::task::TaskTracker;
use tracing::{debug, warn};

use crate::error::{DeliveryError, Result};

/// JSON body posted to the callback URL.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallbackEnvelope {
    /// Job id.
    pub webhook_id: WebhookId,
    /// The job's `send_url`.
    pub original_url: String,
    /// `success` or `error`.
    pub final_status: JobStatus,
    /// Attempt count after the final resolution.
    pub attempt_count: i32,
    /// Detail of the last attempt.
    pub last_response: LastResponse,
}

/// Last run log detail included in the callback.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LastResponse {
    /// Response body or transport error text.
    pub response_text: String,
    /// HTTP status; `null` when no response was received.
    pub response_code: Option<i32>,
    /// Latency in milliseconds.
    pub response_time: i64,
}

impl CallbackEnvelope {
    /// Builds the envelope for a job resolved to `final_status`.
    pub fn new(
        job: &Webhook,
        final_status: JobStatus,
        attempt_count: i32,
        last_attempt: &NewRunLogEntry,
    ) -> Self {
        Self {
            webhook_id: job.id,
            original_url: job.send_url.clone(),
            final_status,
            attempt_count,
            last_response: LastResponse {
                response_text: last_attempt.response_text.clone(),
                response_code: last_attempt.response_code,
                response_time: last_attempt.response_time_ms,
            },
        }
    }
}

/// Sends callback notifications on tracked background tasks.
///
/// Clones share the HTTP client and the task tracker.
#[derive(Debug, Clone)]
pub struct CallbackNotifier {
    client: reqwest::Client,
    tracker: TaskTracker,
}

impl CallbackNotifier {
    /// Creates a notifier whose requests time out after `timeout`.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::ConfigurationError` if the HTTP client cannot
    /// be built.
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent("Courier-Webhook-Callback/1.0")
            .build()
            .map_err(|e| {
                DeliveryError::configuration(format!("failed to build callback client: {e}"))
            })?;

        Ok(Self { client, tracker: TaskTracker::new() })
    }

    /// Posts `envelope` to `callback_url` in the background.
    pub fn notify(&self, callback_url: &str, envelope: CallbackEnvelope) {
        let notifier = self.clone();
        let url = callback_url.to_string();

        self.tracker.spawn(async move {
            if let Err(e) = notifier.send(&url, &envelope).await {
                warn!(
                    webhook_id = %envelope.webhook_id,
                    callback_url = %url,
                    error = %e,
                    "callback delivery failed"
                );
            }
        });
    }

    /// Posts `envelope` once and waits for the response.
    ///
    /// # Errors
    ///
    /// Returns an error for transport failures and non-success statuses.
    pub async fn send(&self, callback_url: &str, envelope: &CallbackEnvelope) -> Result<()> {
        let response = self
            .client
            .post(callback_url)
            .json(envelope)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    DeliveryError::network(format!("callback timed out: {e}"))
                } else {
                    DeliveryError::network(e.to_string())
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(DeliveryError::network(format!("callback rejected with HTTP {status}")));
        }

        debug!(
            webhook_id = %envelope.webhook_id,
            final_status = %envelope.final_status,
            "callback delivered"
        );
        Ok(())
    }

    /// Number of callbacks still in flight.
    pub fn in_flight(&self) -> usize {
        self.tracker.len()
    }

    /// Waits until every callback spawned so far has finished.
    pub async fn flush(&self) {
        self.tracker.close();
        self.tracker.wait().await;
        self.tracker.reopen();
    }
}
