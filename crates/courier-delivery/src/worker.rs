//! Delivery worker: one independent poll, claim, deliver, resolve loop.
//!
//! Workers coordinate only through the claim protocol on the shared table.
//! A worker owns its store session for its whole life and never shares it.

use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use courier_core::{Clock, NewRunLogEntry, ProcessingToken, Webhook, WebhookId};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    callback::{CallbackEnvelope, CallbackNotifier},
    client::{ClientConfig, DeliveryClient, DeliveryRequest},
    error::{DeliveryError, Result},
    retry::RetryPolicy,
    state::{self, DeliveryOutcome, Transition},
    storage::JobSession,
    sweep::SweepConfig,
    worker_pool::RestartPolicy,
};

/// Configuration for the delivery engine and its workers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryConfig {
    /// Number of concurrent worker units.
    pub worker_count: usize,

    /// Maximum candidates read per poll.
    pub batch_size: usize,

    /// Idle wait when nothing is claimable.
    pub poll_interval: Duration,

    /// Wait after a store error before polling again.
    pub error_backoff: Duration,

    /// Consecutive store errors after which a unit gives up and is
    /// restarted by its supervisor with a fresh session.
    pub max_consecutive_store_errors: u32,

    /// Outbound HTTP client settings.
    pub client_config: ClientConfig,

    /// Backoff and attempt limit.
    pub retry_policy: RetryPolicy,

    /// What the supervisor does when a unit fails.
    pub restart_policy: RestartPolicy,

    /// Stuck-job recovery.
    pub sweep: SweepConfig,

    /// Timeout for callback POSTs.
    pub callback_timeout: Duration,

    /// Deadline for graceful shutdown.
    pub shutdown_timeout: Duration,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            worker_count: crate::DEFAULT_WORKER_COUNT,
            batch_size: crate::DEFAULT_BATCH_SIZE,
            poll_interval: Duration::from_millis(100),
            error_backoff: Duration::from_secs(1),
            max_consecutive_store_errors: 5,
            client_config: ClientConfig::default(),
            retry_policy: RetryPolicy::default(),
            restart_policy: RestartPolicy::default(),
            sweep: SweepConfig::default(),
            callback_timeout: Duration::from_secs(10),
            shutdown_timeout: Duration::from_secs(30),
        }
    }
}

impl DeliveryConfig {
    /// Checks the configuration for values the engine cannot run with.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::ConfigurationError` describing the first
    /// invalid setting.
    pub fn validate(&self) -> Result<()> {
        if self.worker_count == 0 {
            return Err(DeliveryError::configuration("worker_count must be at least 1"));
        }
        if self.batch_size == 0 {
            return Err(DeliveryError::configuration("batch_size must be at least 1"));
        }
        if self.max_consecutive_store_errors == 0 {
            return Err(DeliveryError::configuration(
                "max_consecutive_store_errors must be at least 1",
            ));
        }
        if self.sweep.liveness_threshold <= self.client_config.timeout {
            return Err(DeliveryError::configuration(
                "stuck-job threshold must exceed the delivery timeout",
            ));
        }
        self.retry_policy.validate()
    }
}

/// Result of one handled job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessedJob {
    /// The job that was delivered.
    pub webhook_id: WebhookId,
    /// Decision applied to it.
    pub transition: Transition,
    /// Whether the resolution was written. `false` means the claim was lost
    /// in the meantime and another actor owns the row.
    pub resolved: bool,
}

/// A single delivery worker unit.
pub struct DeliveryWorker {
    id: usize,
    session: Box<dyn JobSession>,
    client: DeliveryClient,
    notifier: CallbackNotifier,
    config: Arc<DeliveryConfig>,
    clock: Arc<dyn Clock>,
    cancellation_token: CancellationToken,
}

impl DeliveryWorker {
    /// Creates a worker owning `session`.
    pub fn new(
        id: usize,
        session: Box<dyn JobSession>,
        client: DeliveryClient,
        notifier: CallbackNotifier,
        config: Arc<DeliveryConfig>,
        clock: Arc<dyn Clock>,
        cancellation_token: CancellationToken,
    ) -> Self {
        Self { id, session, client, notifier, config, clock, cancellation_token }
    }

    /// Worker identifier, for logs.
    pub fn id(&self) -> usize {
        self.id
    }

    /// Runs until cancelled.
    ///
    /// Cancellation is observed between iterations and during waits, so an
    /// attempt that has started always finishes and is resolved.
    ///
    /// # Errors
    ///
    /// Returns the last store error after `max_consecutive_store_errors`
    /// consecutive failures, so the supervisor can replace the session.
    pub async fn run(mut self) -> Result<()> {
        info!(worker_id = self.id, "delivery worker starting");
        let mut consecutive_errors = 0u32;

        loop {
            if self.cancellation_token.is_cancelled() {
                info!(worker_id = self.id, "delivery worker received shutdown signal");
                break;
            }

            match self.process_next().await {
                Ok(Some(_)) => {
                    consecutive_errors = 0;
                },
                Ok(None) => {
                    consecutive_errors = 0;
                    tokio::select! {
                        () = self.clock.sleep(self.config.poll_interval) => {}
                        () = self.cancellation_token.cancelled() => break,
                    }
                },
                Err(error) => {
                    consecutive_errors += 1;
                    error!(
                        worker_id = self.id,
                        consecutive_errors,
                        error = %error,
                        "worker iteration failed"
                    );
                    if consecutive_errors >= self.config.max_consecutive_store_errors {
                        return Err(error);
                    }
                    tokio::select! {
                        () = self.clock.sleep(self.config.error_backoff) => {}
                        () = self.cancellation_token.cancelled() => break,
                    }
                },
            }
        }

        info!(worker_id = self.id, "delivery worker stopped");
        Ok(())
    }

    /// Performs one poll-claim-deliver-resolve cycle.
    ///
    /// Returns `None` when nothing could be claimed.
    ///
    /// # Errors
    ///
    /// Returns error when the candidate poll, the fetch of the claimed row,
    /// the run log write, or the final resolution fails. The job then stays
    /// in `processing` for the stuck-job sweep.
    pub async fn process_next(&mut self) -> Result<Option<ProcessedJob>> {
        let now = self.clock.now_utc();

        let candidates = tokio::select! {
            biased;
            () = self.cancellation_token.cancelled() => return Ok(None),
            candidates = self.session.find_claimable(self.config.batch_size, now) => candidates?,
        };
        if candidates.is_empty() {
            return Ok(None);
        }

        let token = ProcessingToken::new();
        let Some(webhook_id) = self.session.claim_first(candidates, token, now).await? else {
            debug!(worker_id = self.id, "all candidates claimed elsewhere");
            return Ok(None);
        };

        let Some(job) = self.session.fetch_claimed(token).await? else {
            warn!(worker_id = self.id, webhook_id = %webhook_id, "claimed job vanished before fetch");
            return Ok(None);
        };

        self.deliver(job, token).await.map(Some)
    }

    async fn deliver(&mut self, job: Webhook, token: ProcessingToken) -> Result<ProcessedJob> {
        let started = Instant::now();
        let result = match DeliveryRequest::for_webhook(&job) {
            Ok(request) => self.client.deliver(request).await,
            Err(e) => Err(e),
        };
        let outcome = DeliveryOutcome::from_result(result, started.elapsed());

        let attempted_at = self.clock.now_utc();
        let entry = outcome.to_run_log(job.id, attempted_at);
        self.record_attempt(&entry).await?;

        let transition =
            state::decide(job.attempt_count, &outcome, attempted_at, &self.config.retry_policy);
        let resolved = self.session.resolve(job.id, token, transition.resolution()).await?;

        if !resolved {
            warn!(
                worker_id = self.id,
                webhook_id = %job.id,
                "claim lost before resolution, leaving row untouched"
            );
        } else {
            info!(
                worker_id = self.id,
                webhook_id = %job.id,
                status = %transition.status,
                attempt_count = transition.attempt_count,
                status_code = ?outcome.status_code(),
                latency_ms = outcome.latency().as_millis(),
                "delivery attempt resolved"
            );

            if let (Some(final_status), Some(callback_url)) =
                (transition.callback, job.callback_url.as_deref())
            {
                let envelope =
                    CallbackEnvelope::new(&job, final_status, transition.attempt_count, &entry);
                self.notifier.notify(callback_url, envelope);
            }
        }

        Ok(ProcessedJob { webhook_id: job.id, transition, resolved })
    }

    /// Writes the run log row, retrying once. The job is only resolved after
    /// this succeeds.
    async fn record_attempt(&mut self, entry: &NewRunLogEntry) -> Result<()> {
        let Err(first) = self.session.record_attempt(entry.clone()).await else {
            return Ok(());
        };
        warn!(
            worker_id = self.id,
            webhook_id = %entry.webhook_id,
            error = %first,
            "failed to record attempt, retrying"
        );

        self.session.record_attempt(entry.clone()).await.map_err(|e| {
            error!(
                worker_id = self.id,
                webhook_id = %entry.webhook_id,
                error = %e,
                "run log unavailable, leaving job claimed for the stuck-job sweep"
            );
            DeliveryError::from(e)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        let config = DeliveryConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.worker_count, 3);
        assert_eq!(config.poll_interval, Duration::from_millis(100));
        assert_eq!(config.retry_policy.max_attempts, 20);
    }

    #[test]
    fn zero_workers_rejected() {
        let config = DeliveryConfig { worker_count: 0, ..Default::default() };
        assert!(config.validate().is_err());
    }

    #[test]
    fn sweep_threshold_must_exceed_delivery_timeout() {
        let mut config = DeliveryConfig::default();
        config.sweep.liveness_threshold = config.client_config.timeout;
        assert!(config.validate().is_err());
    }
}
