//! Recovery of jobs stuck in `processing`.
//!
//! A worker that dies between claiming and resolving leaves its row in
//! `processing` with no owner. The sweeper periodically returns rows whose
//! claim is older than the liveness threshold to `available`. The threshold
//! must exceed the delivery timeout so a live attempt is never swept.

use std::{sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use courier_core::Clock;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{error::Result, storage::JobStore};

/// Stuck-job sweep settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SweepConfig {
    /// How often to sweep.
    pub interval: Duration,
    /// Age of a claim after which the job counts as stuck.
    pub liveness_threshold: Duration,
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self { interval: Duration::from_secs(30), liveness_threshold: Duration::from_secs(300) }
    }
}

/// Periodic stuck-job sweeper.
pub struct StuckJobSweeper {
    store: Arc<dyn JobStore>,
    config: SweepConfig,
    clock: Arc<dyn Clock>,
    cancellation_token: CancellationToken,
}

impl StuckJobSweeper {
    /// Creates a sweeper.
    pub fn new(
        store: Arc<dyn JobStore>,
        config: SweepConfig,
        clock: Arc<dyn Clock>,
        cancellation_token: CancellationToken,
    ) -> Self {
        Self { store, config, clock, cancellation_token }
    }

    /// Re-queues every currently stuck job. Returns how many were re-queued.
    ///
    /// # Errors
    ///
    /// Returns error if the store update fails.
    pub async fn sweep_once(&self) -> Result<u64> {
        let now = self.clock.now_utc();
        let threshold = chrono::Duration::from_std(self.config.liveness_threshold)
            .unwrap_or(chrono::Duration::MAX);
        let cutoff = now.checked_sub_signed(threshold).unwrap_or(DateTime::<Utc>::MIN_UTC);

        let requeued = self.store.requeue_stuck(cutoff, now).await?;
        if requeued > 0 {
            info!(requeued, "re-queued stuck jobs");
        } else {
            debug!("no stuck jobs");
        }

        Ok(requeued)
    }

    /// Sweeps every interval until cancelled. Errors are logged.
    pub async fn run(self) {
        loop {
            tokio::select! {
                () = self.clock.sleep(self.config.interval) => {}
                () = self.cancellation_token.cancelled() => break,
            }

            if let Err(e) = self.sweep_once().await {
                warn!(error = %e, "stuck-job sweep failed");
            }
        }

        debug!("stuck-job sweeper stopped");
    }
}
