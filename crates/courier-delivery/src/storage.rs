//! Job store abstraction for the delivery workers.
//!
//! `JobStore` is the pool-level handle: it opens sessions and runs the
//! stuck-job sweep. `JobSession` is owned by exactly one worker unit and is
//! backed by its own connection, so concurrent units never share a session.
//! Production uses the Postgres repositories from `courier_core`; tests use
//! the in-memory [`mock::MockJobStore`], which applies the same conditional
//! updates under a lock.

use std::{future::Future, pin::Pin, sync::Arc};

use chrono::{DateTime, Utc};
use courier_core::{
    error::Result, NewRunLogEntry, ProcessingToken, Resolution, Storage, Webhook, WebhookId,
};
use sqlx::{pool::PoolConnection, Postgres};
use tracing::{debug, warn};

/// Boxed future returned by store operations.
pub type StoreFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

/// Pool-level store operations.
pub trait JobStore: Send + Sync + 'static {
    /// Opens a session backed by a dedicated connection.
    fn session(&self) -> StoreFuture<'_, Box<dyn JobSession>>;

    /// Re-queues jobs claimed before `cutoff` that never resolved.
    ///
    /// Returns the number of re-queued jobs.
    fn requeue_stuck(&self, cutoff: DateTime<Utc>, now: DateTime<Utc>) -> StoreFuture<'_, u64>;
}

/// Store operations used by one worker unit.
pub trait JobSession: Send {
    /// Lists claimable candidates, oldest due first. Advisory only.
    fn find_claimable(&mut self, limit: usize, now: DateTime<Utc>)
        -> StoreFuture<'_, Vec<WebhookId>>;

    /// Atomically claims `id` for `token`. `false` means the race was lost.
    fn try_claim(
        &mut self,
        id: WebhookId,
        token: ProcessingToken,
        now: DateTime<Utc>,
    ) -> StoreFuture<'_, bool>;

    /// Re-reads the full row owned by `token`.
    fn fetch_claimed(&mut self, token: ProcessingToken) -> StoreFuture<'_, Option<Webhook>>;

    /// Appends a run log entry.
    fn record_attempt(&mut self, entry: NewRunLogEntry) -> StoreFuture<'_, ()>;

    /// Applies a resolution if the job is still owned by `token`.
    fn resolve(
        &mut self,
        id: WebhookId,
        token: ProcessingToken,
        resolution: Resolution,
    ) -> StoreFuture<'_, bool>;

    /// Claims the first candidate that can be claimed.
    ///
    /// Lost races are skipped silently. A claim that errors is logged and
    /// treated as lost; it never aborts the rest of the list.
    fn claim_first(
        &mut self,
        candidates: Vec<WebhookId>,
        token: ProcessingToken,
        now: DateTime<Utc>,
    ) -> StoreFuture<'_, Option<WebhookId>> {
        Box::pin(async move {
            for id in candidates {
                match self.try_claim(id, token, now).await {
                    Ok(true) => return Ok(Some(id)),
                    Ok(false) => debug!(webhook_id = %id, "candidate claimed elsewhere"),
                    Err(e) => warn!(webhook_id = %id, error = %e, "claim attempt failed, skipping"),
                }
            }
            Ok(None)
        })
    }
}

/// Production store backed by Postgres.
pub struct PostgresJobStore {
    storage: Arc<Storage>,
}

impl PostgresJobStore {
    /// Creates a store over the given repositories.
    pub fn new(storage: Arc<Storage>) -> Self {
        Self { storage }
    }
}

impl JobStore for PostgresJobStore {
    fn session(&self) -> StoreFuture<'_, Box<dyn JobSession>> {
        Box::pin(async move {
            let conn = self.storage.pool().acquire().await?;
            let session: Box<dyn JobSession> =
                Box::new(PostgresJobSession { storage: self.storage.clone(), conn });
            Ok(session)
        })
    }

    fn requeue_stuck(&self, cutoff: DateTime<Utc>, now: DateTime<Utc>) -> StoreFuture<'_, u64> {
        Box::pin(async move { self.storage.webhooks.requeue_stuck(cutoff, now).await })
    }
}

/// A worker's session holding one checked-out connection.
pub struct PostgresJobSession {
    storage: Arc<Storage>,
    conn: PoolConnection<Postgres>,
}

impl JobSession for PostgresJobSession {
    fn find_claimable(
        &mut self,
        limit: usize,
        now: DateTime<Utc>,
    ) -> StoreFuture<'_, Vec<WebhookId>> {
        Box::pin(async move {
            self.storage.webhooks.find_claimable_on(&mut self.conn, limit, now).await
        })
    }

    fn try_claim(
        &mut self,
        id: WebhookId,
        token: ProcessingToken,
        now: DateTime<Utc>,
    ) -> StoreFuture<'_, bool> {
        Box::pin(async move { self.storage.webhooks.try_claim_on(&mut self.conn, id, token, now).await })
    }

    fn fetch_claimed(&mut self, token: ProcessingToken) -> StoreFuture<'_, Option<Webhook>> {
        Box::pin(async move { self.storage.webhooks.fetch_claimed_on(&mut self.conn, token).await })
    }

    fn record_attempt(&mut self, entry: NewRunLogEntry) -> StoreFuture<'_, ()> {
        Box::pin(async move {
            self.storage.run_log.create_on(&mut self.conn, &entry).await?;
            Ok(())
        })
    }

    fn resolve(
        &mut self,
        id: WebhookId,
        token: ProcessingToken,
        resolution: Resolution,
    ) -> StoreFuture<'_, bool> {
        Box::pin(async move {
            self.storage.webhooks.resolve_on(&mut self.conn, id, token, &resolution).await
        })
    }
}

pub mod mock {
    //! In-memory job store for testing.
    //!
    //! Every operation takes one lock for its whole read-check-write, which
    //! gives the same atomicity as the conditional updates in Postgres.
    //! Faults can be injected to exercise error paths and supervision.

    use std::{
        collections::HashMap,
        sync::{
            atomic::{AtomicUsize, Ordering},
            Arc,
        },
    };

    use chrono::{DateTime, Utc};
    use courier_core::{
        error::{CoreError, Result},
        JobStatus, NewRunLogEntry, NewWebhook, ProcessingToken, Resolution, RunLogEntry, Webhook,
        WebhookId,
    };
    use sqlx::types::Json;
    use tokio::sync::Mutex;

    use super::{JobSession, JobStore, StoreFuture};

    #[derive(Default)]
    struct State {
        jobs: HashMap<WebhookId, Webhook>,
        run_log: Vec<RunLogEntry>,
        claim_errors: usize,
        poll_errors: usize,
        poll_panics: usize,
        session_errors: usize,
        record_errors: usize,
    }

    /// Mock job store for tests without a database.
    ///
    /// Clones share state, so a test can keep a handle for inspection while
    /// the pool owns another.
    #[derive(Clone, Default)]
    pub struct MockJobStore {
        state: Arc<Mutex<State>>,
        sessions_opened: Arc<AtomicUsize>,
        claim_attempts: Arc<AtomicUsize>,
    }

    impl MockJobStore {
        /// Creates an empty store.
        pub fn new() -> Self {
            Self::default()
        }

        /// Inserts a job as the ingestion boundary would.
        pub async fn insert(&self, job: NewWebhook) -> WebhookId {
            let webhook = Webhook {
                id: job.id,
                send_url: job.send_url,
                data: job.data.map(Json),
                status: JobStatus::Available,
                attempt_count: 0,
                next_attempt_time: job.next_attempt_time,
                processing_id: None,
                claimed_at: None,
                callback_url: job.callback_url,
                created_at: Utc::now(),
            };
            let id = webhook.id;
            self.state.lock().await.jobs.insert(id, webhook);
            id
        }

        /// Returns a snapshot of a job.
        pub async fn job(&self, id: WebhookId) -> Option<Webhook> {
            self.state.lock().await.jobs.get(&id).cloned()
        }

        /// Returns the run log of a job in attempt order.
        pub async fn run_log(&self, id: WebhookId) -> Vec<RunLogEntry> {
            let state = self.state.lock().await;
            state.run_log.iter().filter(|entry| entry.webhook_id == id).cloned().collect()
        }

        /// Counts jobs in `status`.
        pub async fn count(&self, status: JobStatus) -> usize {
            self.state.lock().await.jobs.values().filter(|job| job.status == status).count()
        }

        /// Forces a job into `processing` as if a worker crashed after
        /// claiming it at `claimed_at`.
        pub async fn force_claim(&self, id: WebhookId, claimed_at: DateTime<Utc>) {
            if let Some(job) = self.state.lock().await.jobs.get_mut(&id) {
                job.status = JobStatus::Processing;
                job.processing_id = Some(ProcessingToken::new());
                job.claimed_at = Some(claimed_at);
            }
        }

        /// Fails the next `n` claim attempts.
        pub async fn inject_claim_errors(&self, n: usize) {
            self.state.lock().await.claim_errors = n;
        }

        /// Fails the next `n` candidate polls.
        pub async fn inject_poll_errors(&self, n: usize) {
            self.state.lock().await.poll_errors = n;
        }

        /// Panics inside the next `n` candidate polls.
        pub async fn inject_poll_panics(&self, n: usize) {
            self.state.lock().await.poll_panics = n;
        }

        /// Fails the next `n` session openings.
        pub async fn inject_session_errors(&self, n: usize) {
            self.state.lock().await.session_errors = n;
        }

        /// Fails the next `n` run log inserts.
        pub async fn inject_record_errors(&self, n: usize) {
            self.state.lock().await.record_errors = n;
        }

        /// Number of sessions opened so far.
        pub fn sessions_opened(&self) -> usize {
            self.sessions_opened.load(Ordering::Acquire)
        }

        /// Number of `try_claim` calls so far, successful or not.
        pub fn claim_attempts(&self) -> usize {
            self.claim_attempts.load(Ordering::Acquire)
        }
    }

    fn take_fault(counter: &mut usize) -> bool {
        if *counter > 0 {
            *counter -= 1;
            true
        } else {
            false
        }
    }

    impl JobStore for MockJobStore {
        fn session(&self) -> StoreFuture<'_, Box<dyn JobSession>> {
            Box::pin(async move {
                if take_fault(&mut self.state.lock().await.session_errors) {
                    return Err(CoreError::Database("injected session failure".to_string()));
                }
                self.sessions_opened.fetch_add(1, Ordering::AcqRel);
                let session: Box<dyn JobSession> = Box::new(self.clone());
                Ok(session)
            })
        }

        fn requeue_stuck(
            &self,
            cutoff: DateTime<Utc>,
            now: DateTime<Utc>,
        ) -> StoreFuture<'_, u64> {
            Box::pin(async move {
                let mut state = self.state.lock().await;
                let mut requeued = 0;
                for job in state.jobs.values_mut() {
                    let stuck = job.status == JobStatus::Processing
                        && job.claimed_at.is_some_and(|at| at < cutoff);
                    if stuck {
                        job.status = JobStatus::Available;
                        job.processing_id = None;
                        job.claimed_at = None;
                        job.next_attempt_time = now;
                        requeued += 1;
                    }
                }
                Ok(requeued)
            })
        }
    }

    impl JobSession for MockJobStore {
        fn find_claimable(
            &mut self,
            limit: usize,
            now: DateTime<Utc>,
        ) -> StoreFuture<'_, Vec<WebhookId>> {
            Box::pin(async move {
                let mut state = self.state.lock().await;
                if take_fault(&mut state.poll_panics) {
                    drop(state);
                    panic!("injected poll panic");
                }
                if take_fault(&mut state.poll_errors) {
                    return Err(CoreError::Database("injected poll failure".to_string()));
                }

                let mut due: Vec<&Webhook> = state
                    .jobs
                    .values()
                    .filter(|job| job.status == JobStatus::Available && job.next_attempt_time <= now)
                    .collect();
                due.sort_by_key(|job| job.next_attempt_time);

                Ok(due.into_iter().take(limit).map(|job| job.id).collect())
            })
        }

        fn try_claim(
            &mut self,
            id: WebhookId,
            token: ProcessingToken,
            now: DateTime<Utc>,
        ) -> StoreFuture<'_, bool> {
            Box::pin(async move {
                self.claim_attempts.fetch_add(1, Ordering::AcqRel);
                let mut state = self.state.lock().await;
                if take_fault(&mut state.claim_errors) {
                    return Err(CoreError::Database("injected claim failure".to_string()));
                }

                match state.jobs.get_mut(&id) {
                    Some(job) if job.status == JobStatus::Available => {
                        job.status = JobStatus::Processing;
                        job.processing_id = Some(token);
                        job.claimed_at = Some(now);
                        Ok(true)
                    },
                    _ => Ok(false),
                }
            })
        }

        fn fetch_claimed(&mut self, token: ProcessingToken) -> StoreFuture<'_, Option<Webhook>> {
            Box::pin(async move {
                let state = self.state.lock().await;
                Ok(state
                    .jobs
                    .values()
                    .find(|job| {
                        job.status == JobStatus::Processing && job.processing_id == Some(token)
                    })
                    .cloned())
            })
        }

        fn record_attempt(&mut self, entry: NewRunLogEntry) -> StoreFuture<'_, ()> {
            Box::pin(async move {
                let mut state = self.state.lock().await;
                if take_fault(&mut state.record_errors) {
                    return Err(CoreError::Database("injected run log failure".to_string()));
                }
                let id = i64::try_from(state.run_log.len()).unwrap_or(i64::MAX) + 1;
                state.run_log.push(RunLogEntry {
                    id,
                    webhook_id: entry.webhook_id,
                    response_text: entry.response_text,
                    response_code: entry.response_code,
                    response_time_ms: entry.response_time_ms,
                    attempted_at: entry.attempted_at,
                });
                Ok(())
            })
        }

        fn resolve(
            &mut self,
            id: WebhookId,
            token: ProcessingToken,
            resolution: Resolution,
        ) -> StoreFuture<'_, bool> {
            Box::pin(async move {
                let mut state = self.state.lock().await;
                match state.jobs.get_mut(&id) {
                    Some(job)
                        if job.status == JobStatus::Processing
                            && job.processing_id == Some(token)
                            && job.attempt_count <= resolution.attempt_count =>
                    {
                        job.status = resolution.status;
                        job.attempt_count = resolution.attempt_count;
                        if let Some(next) = resolution.next_attempt_time {
                            job.next_attempt_time = next;
                        }
                        job.processing_id = None;
                        job.claimed_at = None;
                        Ok(true)
                    },
                    _ => Ok(false),
                }
            })
        }
    }
}
