//! Database access layer implementing the repository pattern.
//!
//! All queries against the job table and the run log go through these
//! repositories. Direct SQL elsewhere is limited to the schema migrator.

use std::sync::Arc;

use sqlx::PgPool;

pub mod run_log;
pub mod webhooks;

use crate::error::Result;

/// Container for all repository instances.
///
/// Repositories share one connection pool. Worker units additionally check
/// out their own connection from it and use the `*_on` operations.
#[derive(Clone)]
pub struct Storage {
    /// Repository for the webhook job table.
    pub webhooks: Arc<webhooks::Repository>,

    /// Repository for the per-attempt run log.
    pub run_log: Arc<run_log::Repository>,

    pool: Arc<PgPool>,
}

impl Storage {
    /// Creates a new storage instance with the given connection pool.
    pub fn new(pool: PgPool) -> Self {
        let pool = Arc::new(pool);

        Self {
            webhooks: Arc::new(webhooks::Repository::new(pool.clone())),
            run_log: Arc::new(run_log::Repository::new(pool.clone())),
            pool,
        }
    }

    /// Returns the shared pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Verifies the database answers a trivial query.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::Database` if the connection is unhealthy.
    pub async fn health_check(&self) -> Result<()> {
        let _: (i32,) = sqlx::query_as("SELECT 1").fetch_one(&*self.pool).await?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn storage_can_be_created() {
        let pool = sqlx::PgPool::connect_lazy("postgresql://test").unwrap();
        let storage = Storage::new(pool);
        assert!(!storage.pool().is_closed());
    }
}
