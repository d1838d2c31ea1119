//! Worker pool management with structured concurrency.
//!
//! Each worker unit runs under its own supervisor task. The supervisor opens
//! the unit's session, runs the worker on an inner task so a panic is caught
//! as a join error, and restarts the unit with a fresh session according to
//! the restart policy. A failing unit never affects its siblings.

use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use courier_core::Clock;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::{
    callback::CallbackNotifier,
    client::DeliveryClient,
    error::{DeliveryError, Result},
    storage::JobStore,
    worker::{DeliveryConfig, DeliveryWorker},
};

/// What a supervisor does when its unit fails.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RestartPolicy {
    /// Restart failed units. When disabled a failed unit stays down.
    pub enabled: bool,
    /// Wait before a restart.
    pub delay: Duration,
}

impl Default for RestartPolicy {
    fn default() -> Self {
        Self { enabled: true, delay: Duration::from_secs(1) }
    }
}

/// Shared handles every supervisor needs.
#[derive(Clone)]
struct UnitContext {
    store: Arc<dyn JobStore>,
    config: Arc<DeliveryConfig>,
    client: DeliveryClient,
    notifier: CallbackNotifier,
    clock: Arc<dyn Clock>,
    cancellation_token: CancellationToken,
    restarts: Arc<AtomicU64>,
}

/// Worker pool that supervises delivery worker units.
pub struct WorkerPool {
    context: UnitContext,
    unit_handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Create a new worker pool with the given configuration.
    pub fn new(
        store: Arc<dyn JobStore>,
        config: Arc<DeliveryConfig>,
        client: DeliveryClient,
        notifier: CallbackNotifier,
        clock: Arc<dyn Clock>,
        cancellation_token: CancellationToken,
    ) -> Self {
        let context = UnitContext {
            store,
            config,
            client,
            notifier,
            clock,
            cancellation_token,
            restarts: Arc::new(AtomicU64::new(0)),
        };
        Self { context, unit_handles: Vec::new() }
    }

    /// Spawns one supervised unit per configured worker.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::ConfigurationError` if units are already
    /// running.
    pub fn spawn_workers(&mut self) -> Result<()> {
        if !self.unit_handles.is_empty() {
            return Err(DeliveryError::configuration("worker pool already started"));
        }

        let worker_count = self.context.config.worker_count;
        info!(worker_count, "spawning delivery worker units");

        for worker_id in 0..worker_count {
            let context = self.context.clone();
            self.unit_handles.push(tokio::spawn(supervise(worker_id, context)));
        }

        Ok(())
    }

    /// Total restarts performed across all units.
    pub fn restarts(&self) -> u64 {
        self.context.restarts.load(Ordering::Acquire)
    }

    /// Returns true if any supervisor is still running.
    pub fn has_active_workers(&self) -> bool {
        self.unit_handles.iter().any(|h| !h.is_finished())
    }

    /// Number of spawned units.
    pub fn worker_count(&self) -> usize {
        self.unit_handles.len()
    }

    /// Cancels all units and waits for them to finish their current
    /// attempt, then waits for in-flight callbacks.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::ShutdownTimeout` if the units do not stop
    /// within `timeout`.
    pub async fn shutdown_graceful(mut self, timeout: Duration) -> Result<()> {
        info!(
            worker_count = self.unit_handles.len(),
            timeout_seconds = timeout.as_secs(),
            "initiating graceful worker shutdown"
        );

        self.context.cancellation_token.cancel();

        let handles = std::mem::take(&mut self.unit_handles);
        let join_all = async {
            for (worker_id, handle) in handles.into_iter().enumerate() {
                if let Err(join_error) = handle.await {
                    error!(worker_id, error = %join_error, "worker supervisor aborted");
                }
            }
        };

        if tokio::time::timeout(timeout, join_all).await.is_err() {
            error!(
                timeout_seconds = timeout.as_secs(),
                "worker shutdown timed out, some workers may still be running"
            );
            return Err(DeliveryError::ShutdownTimeout { timeout });
        }

        let pending_callbacks = self.context.notifier.in_flight();
        if pending_callbacks > 0 {
            info!(pending_callbacks, "waiting for in-flight callbacks");
        }
        if tokio::time::timeout(timeout, self.context.notifier.flush()).await.is_err() {
            warn!("callbacks still in flight after shutdown deadline");
        }

        info!(restarts = self.restarts(), "worker pool shutdown completed");
        Ok(())
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        let active_count = self.unit_handles.iter().filter(|h| !h.is_finished()).count();

        if active_count > 0 && !self.context.cancellation_token.is_cancelled() {
            error!(
                active_workers = active_count,
                "WorkerPool dropped with active workers, forcing cancellation"
            );
            self.context.cancellation_token.cancel();
            warn!("call shutdown_graceful() before dropping the worker pool");
        }
    }
}

/// Runs one unit until cancellation, restarting it after failures.
async fn supervise(worker_id: usize, context: UnitContext) {
    let policy = context.config.restart_policy.clone();

    loop {
        if context.cancellation_token.is_cancelled() {
            break;
        }

        let failure = match run_unit(worker_id, &context).await {
            Ok(()) => break,
            Err(failure) => failure,
        };

        error!(worker_id, error = %failure, "worker unit failed");

        if !policy.enabled || context.cancellation_token.is_cancelled() {
            warn!(worker_id, "worker unit will not be restarted");
            break;
        }

        tokio::select! {
            () = context.clock.sleep(policy.delay) => {}
            () = context.cancellation_token.cancelled() => break,
        }

        let restarts = context.restarts.fetch_add(1, Ordering::AcqRel) + 1;
        info!(worker_id, restarts, "restarting worker unit");
    }

    info!(worker_id, "worker supervisor stopped");
}

/// Opens a fresh session and runs one worker life on an inner task.
async fn run_unit(worker_id: usize, context: &UnitContext) -> Result<()> {
    let session = context.store.session().await?;

    let worker = DeliveryWorker::new(
        worker_id,
        session,
        context.client.clone(),
        context.notifier.clone(),
        context.config.clone(),
        context.clock.clone(),
        context.cancellation_token.clone(),
    );

    match tokio::spawn(worker.run()).await {
        Ok(result) => result,
        Err(join_error) => {
            Err(DeliveryError::WorkerPanic { worker_id, error: join_error.to_string() })
        },
    }
}
