//! Test infrastructure for courier.
//!
//! Provides isolated, migrated Postgres databases, a deterministic clock and
//! fixture builders. Database-backed tests are skipped with a logged notice
//! when `DATABASE_URL` is not set.

#![warn(missing_docs)]
#![forbid(unsafe_code)]

use std::{future::Future, sync::Arc, time::Duration};

use anyhow::Result;
pub use courier_core::{Clock, Storage, TestClock};
use courier_core::{JobStatus, RunLogEntry, Webhook, WebhookId};
use sqlx::PgPool;
use tracing_subscriber::EnvFilter;

pub mod database;
pub mod fixtures;

pub use database::IsolatedTestDatabase;
pub use fixtures::WebhookBuilder;

/// Test environment bound to one isolated database.
pub struct TestEnv {
    /// Deterministic clock for time-based testing
    pub clock: TestClock,
    pool: PgPool,
    storage: Arc<Storage>,
}

impl TestEnv {
    /// Runs `test` against a fresh isolated database, then drops it.
    ///
    /// When `DATABASE_URL` is unset the test body is skipped and `Ok(())` is
    /// returned.
    pub async fn run_isolated_test<F, Fut>(test: F) -> Result<()>
    where
        F: FnOnce(TestEnv) -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        Self::run_isolated_test_with_pool_size(8, test).await
    }

    /// Like [`Self::run_isolated_test`] with an explicit pool size.
    pub async fn run_isolated_test_with_pool_size<F, Fut>(
        max_connections: u32,
        test: F,
    ) -> Result<()>
    where
        F: FnOnce(TestEnv) -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        init_test_tracing();

        if !database::database_url_available() {
            tracing::warn!("DATABASE_URL not set, skipping database test");
            return Ok(());
        }

        let database = IsolatedTestDatabase::with_pool_size(max_connections).await?;
        let env = Self {
            clock: TestClock::new(),
            pool: database.pool().clone(),
            storage: Arc::new(Storage::new(database.pool().clone())),
        };

        let outcome = test(env).await;

        if let Err(e) = database.cleanup().await {
            tracing::warn!(error = %e, "failed to drop test database");
        }

        outcome
    }

    /// Access to the database pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Repository access.
    pub fn storage(&self) -> Arc<Storage> {
        self.storage.clone()
    }

    /// Advances test time.
    pub fn advance_time(&self, duration: Duration) {
        self.clock.advance(duration);
    }

    /// Loads a job by id, failing if it does not exist.
    pub async fn webhook(&self, id: WebhookId) -> Result<Webhook> {
        self.storage
            .webhooks
            .find_by_id(id)
            .await?
            .ok_or_else(|| anyhow::anyhow!("webhook {id} not found"))
    }

    /// Current status of a job.
    pub async fn status(&self, id: WebhookId) -> Result<JobStatus> {
        Ok(self.webhook(id).await?.status)
    }

    /// Run log entries of a job in attempt order.
    pub async fn run_log(&self, id: WebhookId) -> Result<Vec<RunLogEntry>> {
        Ok(self.storage.run_log.find_by_webhook(id).await?)
    }
}

/// Installs a test-friendly tracing subscriber once per process.
pub fn init_test_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn,courier=debug")),
        )
        .with_test_writer()
        .try_init();
}
