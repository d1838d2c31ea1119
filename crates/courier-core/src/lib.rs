//! Core domain models, storage and schema management for courier.
//!
//! Provides the webhook job and run log models, the repositories that own
//! every query against the shared job table, the schema migrator and the
//! clock abstraction used for deterministic scheduling tests.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod error;
pub mod migrate;
pub mod models;
pub mod storage;
pub mod time;

pub use error::{CoreError, Result};
pub use migrate::{Migration, Migrator};
pub use models::{
    JobStatus, MigrationRecord, NewRunLogEntry, NewWebhook, ProcessingToken, Resolution,
    RunLogEntry, Webhook, WebhookId,
};
pub use storage::Storage;
pub use time::{Clock, RealClock, TestClock};
