//! Repository for the shared `webhooks` job table.
//!
//! Implements the claim protocol: a non-locking candidate read followed by a
//! conditional single-row update whose affected-row count decides ownership.
//! Every mutation of a claimed row is conditional on the claim token, so a
//! worker that lost its claim can never overwrite another worker's result.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use sqlx::{types::Json, Executor, PgConnection, PgPool, Postgres};

use crate::{
    error::Result,
    models::{JobStatus, NewWebhook, ProcessingToken, Resolution, Webhook, WebhookId},
};

const WEBHOOK_COLUMNS: &str = "id, send_url, data, status, attempt_count, next_attempt_time, \
                               processing_id, claimed_at, callback_url, created_at";

/// Repository for webhook job operations.
///
/// Each operation is available against the shared pool and against a
/// dedicated connection (`*_on`), which worker units use so that no two
/// units share a session.
pub struct Repository {
    pool: Arc<PgPool>,
}

impl Repository {
    /// Creates a new repository instance.
    pub fn new(pool: Arc<PgPool>) -> Self {
        Self { pool }
    }

    /// Returns a reference to the database pool.
    pub fn pool(&self) -> Arc<PgPool> {
        self.pool.clone()
    }

    /// Inserts a job in the shape produced by the ingestion boundary.
    ///
    /// # Errors
    ///
    /// Returns error if insert fails or the id already exists.
    pub async fn create(&self, job: &NewWebhook) -> Result<WebhookId> {
        self.create_impl(&*self.pool, job).await
    }

    /// Inserts a job on a dedicated connection.
    ///
    /// # Errors
    ///
    /// Returns error if insert fails.
    pub async fn create_on(&self, conn: &mut PgConnection, job: &NewWebhook) -> Result<WebhookId> {
        self.create_impl(conn, job).await
    }

    async fn create_impl<'e, E>(&self, executor: E, job: &NewWebhook) -> Result<WebhookId>
    where
        E: Executor<'e, Database = Postgres>,
    {
        let id = sqlx::query_scalar(
            r#"
            INSERT INTO webhooks (id, send_url, data, status, attempt_count, next_attempt_time, callback_url)
            VALUES ($1, $2, $3, 'available', 0, $4, $5)
            RETURNING id
            "#,
        )
        .bind(job.id)
        .bind(&job.send_url)
        .bind(job.data.as_ref().map(Json))
        .bind(job.next_attempt_time)
        .bind(&job.callback_url)
        .fetch_one(executor)
        .await?;

        Ok(id)
    }

    /// Finds a job by id.
    ///
    /// # Errors
    ///
    /// Returns error if query fails.
    pub async fn find_by_id(&self, id: WebhookId) -> Result<Option<Webhook>> {
        let job = sqlx::query_as::<_, Webhook>(&format!(
            "SELECT {WEBHOOK_COLUMNS} FROM webhooks WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&*self.pool)
        .await?;

        Ok(job)
    }

    /// Lists up to `limit` claimable job ids, oldest due first.
    ///
    /// This is an advisory read. Candidates may be claimed by someone else
    /// before [`Self::try_claim`] runs.
    ///
    /// # Errors
    ///
    /// Returns error if query fails.
    pub async fn find_claimable(&self, limit: usize, now: DateTime<Utc>) -> Result<Vec<WebhookId>> {
        self.find_claimable_impl(&*self.pool, limit, now).await
    }

    /// Lists claimable job ids on a dedicated connection.
    ///
    /// # Errors
    ///
    /// Returns error if query fails.
    pub async fn find_claimable_on(
        &self,
        conn: &mut PgConnection,
        limit: usize,
        now: DateTime<Utc>,
    ) -> Result<Vec<WebhookId>> {
        self.find_claimable_impl(conn, limit, now).await
    }

    async fn find_claimable_impl<'e, E>(
        &self,
        executor: E,
        limit: usize,
        now: DateTime<Utc>,
    ) -> Result<Vec<WebhookId>>
    where
        E: Executor<'e, Database = Postgres>,
    {
        let ids = sqlx::query_scalar(
            r#"
            SELECT id FROM webhooks
            WHERE status = 'available'
              AND next_attempt_time <= $1
            ORDER BY next_attempt_time ASC
            LIMIT $2
            "#,
        )
        .bind(now)
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(executor)
        .await?;

        Ok(ids)
    }

    /// Attempts to claim a job for `token`.
    ///
    /// Returns `true` only if exactly one row moved from `available` to
    /// `processing`. Zero affected rows means the race was lost and is not an
    /// error.
    ///
    /// # Errors
    ///
    /// Returns error if the update itself fails.
    pub async fn try_claim(
        &self,
        id: WebhookId,
        token: ProcessingToken,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        self.try_claim_impl(&*self.pool, id, token, now).await
    }

    /// Attempts to claim a job on a dedicated connection.
    ///
    /// # Errors
    ///
    /// Returns error if the update itself fails.
    pub async fn try_claim_on(
        &self,
        conn: &mut PgConnection,
        id: WebhookId,
        token: ProcessingToken,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        self.try_claim_impl(conn, id, token, now).await
    }

    async fn try_claim_impl<'e, E>(
        &self,
        executor: E,
        id: WebhookId,
        token: ProcessingToken,
        now: DateTime<Utc>,
    ) -> Result<bool>
    where
        E: Executor<'e, Database = Postgres>,
    {
        let result = sqlx::query(
            r#"
            UPDATE webhooks
            SET status = 'processing', processing_id = $2, claimed_at = $3
            WHERE id = $1 AND status = 'available'
            "#,
        )
        .bind(id)
        .bind(token)
        .bind(now)
        .execute(executor)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    /// Re-reads the full row owned by `token`.
    ///
    /// # Errors
    ///
    /// Returns error if query fails.
    pub async fn fetch_claimed(&self, token: ProcessingToken) -> Result<Option<Webhook>> {
        self.fetch_claimed_impl(&*self.pool, token).await
    }

    /// Re-reads the claimed row on a dedicated connection.
    ///
    /// # Errors
    ///
    /// Returns error if query fails.
    pub async fn fetch_claimed_on(
        &self,
        conn: &mut PgConnection,
        token: ProcessingToken,
    ) -> Result<Option<Webhook>> {
        self.fetch_claimed_impl(conn, token).await
    }

    async fn fetch_claimed_impl<'e, E>(
        &self,
        executor: E,
        token: ProcessingToken,
    ) -> Result<Option<Webhook>>
    where
        E: Executor<'e, Database = Postgres>,
    {
        let job = sqlx::query_as::<_, Webhook>(&format!(
            "SELECT {WEBHOOK_COLUMNS} FROM webhooks \
             WHERE processing_id = $1 AND status = 'processing'"
        ))
        .bind(token)
        .fetch_optional(executor)
        .await?;

        Ok(job)
    }

    /// Applies a resolution to a job still owned by `token`.
    ///
    /// Clears `processing_id` and `claimed_at`. Returns `false` when the job
    /// is no longer `processing` under this token (for example after the
    /// stuck-job sweep re-queued it), in which case nothing changes.
    ///
    /// # Errors
    ///
    /// Returns error if the update fails.
    pub async fn resolve(
        &self,
        id: WebhookId,
        token: ProcessingToken,
        resolution: &Resolution,
    ) -> Result<bool> {
        self.resolve_impl(&*self.pool, id, token, resolution).await
    }

    /// Applies a resolution on a dedicated connection.
    ///
    /// # Errors
    ///
    /// Returns error if the update fails.
    pub async fn resolve_on(
        &self,
        conn: &mut PgConnection,
        id: WebhookId,
        token: ProcessingToken,
        resolution: &Resolution,
    ) -> Result<bool> {
        self.resolve_impl(conn, id, token, resolution).await
    }

    async fn resolve_impl<'e, E>(
        &self,
        executor: E,
        id: WebhookId,
        token: ProcessingToken,
        resolution: &Resolution,
    ) -> Result<bool>
    where
        E: Executor<'e, Database = Postgres>,
    {
        let result = sqlx::query(
            r#"
            UPDATE webhooks
            SET status = $3,
                attempt_count = $4,
                next_attempt_time = COALESCE($5, next_attempt_time),
                processing_id = NULL,
                claimed_at = NULL
            WHERE id = $1
              AND processing_id = $2
              AND status = 'processing'
              AND attempt_count <= $4
            "#,
        )
        .bind(id)
        .bind(token)
        .bind(resolution.status)
        .bind(resolution.attempt_count)
        .bind(resolution.next_attempt_time)
        .execute(executor)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    /// Returns jobs stuck in `processing` since before `cutoff` to the queue.
    ///
    /// The attempt count is left unchanged; the interrupted attempt was
    /// never resolved. Returns the number of re-queued jobs.
    ///
    /// # Errors
    ///
    /// Returns error if the update fails.
    pub async fn requeue_stuck(&self, cutoff: DateTime<Utc>, now: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE webhooks
            SET status = 'available',
                processing_id = NULL,
                claimed_at = NULL,
                next_attempt_time = $2
            WHERE status = 'processing'
              AND claimed_at < $1
            "#,
        )
        .bind(cutoff)
        .bind(now)
        .execute(&*self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    /// Counts jobs in a given status.
    ///
    /// # Errors
    ///
    /// Returns error if query fails.
    pub async fn count_by_status(&self, status: JobStatus) -> Result<i64> {
        let count = sqlx::query_scalar("SELECT COUNT(*) FROM webhooks WHERE status = $1")
            .bind(status)
            .fetch_one(&*self.pool)
            .await?;

        Ok(count)
    }
}
