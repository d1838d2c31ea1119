//! Webhook dispatch engine.
//!
//! Jobs live in a shared table. A fixed number of independent worker units
//! poll it, claim a due job with a conditional update, POST its payload to
//! the destination, record the attempt in the run log, and resolve the job
//! to `success`, `error`, or back to `available` with a deterministic
//! backoff. Terminal outcomes are reported to an optional callback URL.
//!
//! # Architecture
//!
//! Workers never coordinate directly. Each owns a dedicated store session
//! and competes for rows through the claim protocol:
//!
//! 1. **Find** - read a small batch of due candidates (advisory)
//! 2. **Claim** - conditional update to `processing` with a fresh token
//! 3. **Deliver** - single POST with a bounded timeout
//! 4. **Record** - append a run log entry
//! 5. **Resolve** - conditional update guarded by the token
//!
//! Units run under supervisors that restart them after failures, and a
//! sweeper returns jobs whose worker died mid-attempt to the queue.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use courier_core::RealClock;
//! use courier_delivery::{DeliveryConfig, DeliveryEngine, DeliveryError};
//! use sqlx::PgPool;
//!
//! # async fn example(pool: PgPool) -> std::result::Result<(), DeliveryError> {
//! let mut engine = DeliveryEngine::new(pool, DeliveryConfig::default(), Arc::new(RealClock::new()))?;
//! engine.start()?;
//! engine.shutdown().await?;
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod callback;
pub mod client;
pub mod engine;
pub mod error;
pub mod retry;
pub mod state;
pub mod storage;
pub mod sweep;
pub mod worker;
pub mod worker_pool;

pub use callback::{CallbackEnvelope, CallbackNotifier, LastResponse};
pub use client::{ClientConfig, DeliveryClient, DeliveryRequest, DeliveryResponse};
pub use engine::DeliveryEngine;
pub use error::{DeliveryError, Result};
pub use retry::{BackoffStrategy, RetryPolicy};
pub use state::{decide, DeliveryOutcome, Transition};
pub use storage::{JobSession, JobStore, PostgresJobStore};
pub use sweep::{StuckJobSweeper, SweepConfig};
pub use worker::{DeliveryConfig, DeliveryWorker, ProcessedJob};
pub use worker_pool::{RestartPolicy, WorkerPool};

/// Default number of concurrent delivery workers.
pub const DEFAULT_WORKER_COUNT: usize = 3;

/// Default number of candidates read per poll.
pub const DEFAULT_BATCH_SIZE: usize = 5;

/// Default HTTP request timeout in seconds.
pub const DEFAULT_TIMEOUT_SECONDS: u64 = 30;
