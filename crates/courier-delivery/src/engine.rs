//! Webhook delivery engine: supervised worker units plus stuck-job recovery.
//!
//! # Architecture
//!
//! ```text
//! ┌────────────────┐   ┌──────────────┐   ┌─────────────┐
//! │ DeliveryEngine │──▶│ Worker Pool  │──▶│ HTTP Client │
//! └────────────────┘   └──────────────┘   └─────────────┘
//!        │                   │                   │
//!        ▼                   ▼                   ▼
//! ┌───────────────┐    ┌──────────────┐   ┌─────────────┐
//! │ Stuck-job     │    │ Job table    │   │ Destination │
//! │ Sweeper       │    │ (Postgres)   │   │ + Callbacks │
//! └───────────────┘    └──────────────┘   └─────────────┘
//! ```

use std::sync::Arc;

use courier_core::{Clock, Storage};
use sqlx::PgPool;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::{
    callback::CallbackNotifier,
    client::DeliveryClient,
    error::{DeliveryError, Result},
    storage::{JobStore, PostgresJobStore},
    sweep::StuckJobSweeper,
    worker::DeliveryConfig,
    worker_pool::WorkerPool,
};

/// Main delivery engine coordinating webhook delivery workers.
pub struct DeliveryEngine {
    store: Arc<dyn JobStore>,
    config: Arc<DeliveryConfig>,
    clock: Arc<dyn Clock>,
    cancellation_token: CancellationToken,
    worker_pool: Option<WorkerPool>,
    sweeper: Option<JoinHandle<()>>,
}

impl DeliveryEngine {
    /// Creates an engine over a Postgres pool.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::ConfigurationError` if the configuration is
    /// invalid.
    pub fn new(pool: PgPool, config: DeliveryConfig, clock: Arc<dyn Clock>) -> Result<Self> {
        let store = Arc::new(PostgresJobStore::new(Arc::new(Storage::new(pool))));
        Self::with_store(store, config, clock)
    }

    /// Creates an engine over any job store.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::ConfigurationError` if the configuration is
    /// invalid.
    pub fn with_store(
        store: Arc<dyn JobStore>,
        config: DeliveryConfig,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        config.validate()?;

        Ok(Self {
            store,
            config: Arc::new(config),
            clock,
            cancellation_token: CancellationToken::new(),
            worker_pool: None,
            sweeper: None,
        })
    }

    /// Starts the worker units and the stuck-job sweeper.
    ///
    /// Returns immediately after spawning. Use `shutdown()` to stop
    /// gracefully.
    ///
    /// # Errors
    ///
    /// Returns error if the engine is already running or an HTTP client
    /// cannot be built.
    pub fn start(&mut self) -> Result<()> {
        if self.worker_pool.is_some() {
            return Err(DeliveryError::configuration("delivery engine already started"));
        }

        info!(
            worker_count = self.config.worker_count,
            batch_size = self.config.batch_size,
            max_attempts = self.config.retry_policy.max_attempts,
            backoff = %self.config.retry_policy.backoff_strategy,
            "starting webhook delivery engine"
        );

        let client = DeliveryClient::new(self.config.client_config.clone())?;
        let notifier = CallbackNotifier::new(self.config.callback_timeout)?;

        let mut worker_pool = WorkerPool::new(
            self.store.clone(),
            self.config.clone(),
            client,
            notifier,
            self.clock.clone(),
            self.cancellation_token.clone(),
        );
        worker_pool.spawn_workers()?;
        self.worker_pool = Some(worker_pool);

        let sweeper = StuckJobSweeper::new(
            self.store.clone(),
            self.config.sweep.clone(),
            self.clock.clone(),
            self.cancellation_token.clone(),
        );
        self.sweeper = Some(tokio::spawn(sweeper.run()));

        info!("delivery engine started successfully");
        Ok(())
    }

    /// Returns true while worker units are running.
    pub fn is_running(&self) -> bool {
        self.worker_pool.as_ref().is_some_and(WorkerPool::has_active_workers)
    }

    /// Total worker unit restarts since start.
    pub fn restarts(&self) -> u64 {
        self.worker_pool.as_ref().map_or(0, WorkerPool::restarts)
    }

    /// Gracefully shuts down the delivery engine.
    ///
    /// Stops claiming new work, lets every started attempt finish and
    /// resolve, then waits for in-flight callbacks.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::ShutdownTimeout` if workers do not stop within
    /// the configured shutdown timeout.
    pub async fn shutdown(mut self) -> Result<()> {
        info!("shutting down delivery engine");
        self.cancellation_token.cancel();

        if let Some(sweeper) = self.sweeper.take() {
            if let Err(e) = sweeper.await {
                warn!(error = %e, "stuck-job sweeper aborted");
            }
        }

        if let Some(worker_pool) = self.worker_pool.take() {
            worker_pool.shutdown_graceful(self.config.shutdown_timeout).await
        } else {
            info!("delivery engine was not started, shutdown completed immediately");
            Ok(())
        }
    }
}
