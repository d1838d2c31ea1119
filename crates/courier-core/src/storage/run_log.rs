//! Repository for the append-only run log.
//!
//! One row per delivery attempt. Rows are never updated or deleted.

use std::sync::Arc;

use sqlx::{Executor, PgConnection, PgPool, Postgres};

use crate::{
    error::Result,
    models::{NewRunLogEntry, RunLogEntry, WebhookId},
};

/// Repository for run log operations.
pub struct Repository {
    pool: Arc<PgPool>,
}

impl Repository {
    /// Creates a new repository instance.
    pub fn new(pool: Arc<PgPool>) -> Self {
        Self { pool }
    }

    /// Appends an attempt record.
    ///
    /// # Errors
    ///
    /// Returns error if insert fails.
    pub async fn create(&self, entry: &NewRunLogEntry) -> Result<i64> {
        self.create_impl(&*self.pool, entry).await
    }

    /// Appends an attempt record on a dedicated connection.
    ///
    /// # Errors
    ///
    /// Returns error if insert fails.
    pub async fn create_on(&self, conn: &mut PgConnection, entry: &NewRunLogEntry) -> Result<i64> {
        self.create_impl(conn, entry).await
    }

    async fn create_impl<'e, E>(&self, executor: E, entry: &NewRunLogEntry) -> Result<i64>
    where
        E: Executor<'e, Database = Postgres>,
    {
        let id = sqlx::query_scalar(
            r"
            INSERT INTO run_log (webhook_id, response_text, response_code, response_time_ms, attempted_at)
            VALUES ($1, $2, $3, $4, $5)
            RETURNING id
            ",
        )
        .bind(entry.webhook_id)
        .bind(&entry.response_text)
        .bind(entry.response_code)
        .bind(entry.response_time_ms)
        .bind(entry.attempted_at)
        .fetch_one(executor)
        .await?;

        Ok(id)
    }

    /// Lists every attempt for a job in insertion order.
    ///
    /// # Errors
    ///
    /// Returns error if query fails.
    pub async fn find_by_webhook(&self, webhook_id: WebhookId) -> Result<Vec<RunLogEntry>> {
        let entries = sqlx::query_as::<_, RunLogEntry>(
            r"
            SELECT id, webhook_id, response_text, response_code, response_time_ms, attempted_at
            FROM run_log
            WHERE webhook_id = $1
            ORDER BY id ASC
            ",
        )
        .bind(webhook_id)
        .fetch_all(&*self.pool)
        .await?;

        Ok(entries)
    }

    /// Returns the most recent attempt for a job.
    ///
    /// # Errors
    ///
    /// Returns error if query fails.
    pub async fn latest_for_webhook(&self, webhook_id: WebhookId) -> Result<Option<RunLogEntry>> {
        let entry = sqlx::query_as::<_, RunLogEntry>(
            r"
            SELECT id, webhook_id, response_text, response_code, response_time_ms, attempted_at
            FROM run_log
            WHERE webhook_id = $1
            ORDER BY id DESC
            LIMIT 1
            ",
        )
        .bind(webhook_id)
        .fetch_optional(&*self.pool)
        .await?;

        Ok(entry)
    }
}
