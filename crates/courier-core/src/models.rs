//! Core domain models and strongly-typed identifiers.
//!
//! Defines webhook jobs, run log entries and migration records along with
//! newtype wrappers for job ids and claim tokens. Includes the database
//! serialization impls that let these types bind directly into queries.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::types::Json;
use uuid::Uuid;

type PgDb = sqlx::Postgres;
type PgValueRef<'r> = sqlx::postgres::PgValueRef<'r>;
type PgTypeInfo = sqlx::postgres::PgTypeInfo;
type PgArgumentBuffer = sqlx::postgres::PgArgumentBuffer;
type EncodeResult =
    Result<sqlx::encode::IsNull, Box<dyn std::error::Error + Send + Sync + 'static>>;
type BoxDynError = sqlx::error::BoxDynError;

/// Strongly-typed webhook job identifier.
///
/// Assigned by the ingestion boundary when the row is inserted and never
/// changed afterwards.
///
/// # Example
///
/// ```
/// use courier_core::models::WebhookId;
/// let id = WebhookId::new();
/// println!("delivering webhook {}", id);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WebhookId(pub Uuid);

impl WebhookId {
    /// Creates a new random webhook id.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for WebhookId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for WebhookId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<Uuid> for WebhookId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl sqlx::Type<PgDb> for WebhookId {
    fn type_info() -> PgTypeInfo {
        <Uuid as sqlx::Type<PgDb>>::type_info()
    }
}

impl<'r> sqlx::Decode<'r, PgDb> for WebhookId {
    fn decode(value: PgValueRef<'r>) -> Result<Self, BoxDynError> {
        let uuid = <Uuid as sqlx::Decode<PgDb>>::decode(value)?;
        Ok(Self(uuid))
    }
}

impl sqlx::Encode<'_, PgDb> for WebhookId {
    fn encode_by_ref(&self, buf: &mut PgArgumentBuffer) -> EncodeResult {
        <Uuid as sqlx::Encode<PgDb>>::encode_by_ref(&self.0, buf)
    }
}

/// Opaque ownership token written into `processing_id` by a successful claim.
///
/// Each claim attempt generates a fresh token, so a row can only be fetched
/// and resolved by the worker whose claim actually affected it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProcessingToken(pub Uuid);

impl ProcessingToken {
    /// Generates a fresh claim token.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ProcessingToken {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ProcessingToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl sqlx::Type<PgDb> for ProcessingToken {
    fn type_info() -> PgTypeInfo {
        <Uuid as sqlx::Type<PgDb>>::type_info()
    }
}

impl<'r> sqlx::Decode<'r, PgDb> for ProcessingToken {
    fn decode(value: PgValueRef<'r>) -> Result<Self, BoxDynError> {
        let uuid = <Uuid as sqlx::Decode<PgDb>>::decode(value)?;
        Ok(Self(uuid))
    }
}

impl sqlx::Encode<'_, PgDb> for ProcessingToken {
    fn encode_by_ref(&self, buf: &mut PgArgumentBuffer) -> EncodeResult {
        <Uuid as sqlx::Encode<PgDb>>::encode_by_ref(&self.0, buf)
    }
}

/// Webhook job status governing queue visibility.
///
/// ```text
/// available -> processing -> success
///     ^            |      -> error (attempt limit reached)
///     └------------┘ (failed attempt, backoff)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Waiting for `next_attempt_time`; visible to the claim protocol.
    Available,

    /// Claimed by exactly one worker, identified by `processing_id`.
    Processing,

    /// Terminal: delivered with a success status.
    Success,

    /// Terminal: attempt limit exhausted.
    Error,
}

impl JobStatus {
    /// Returns the database representation.
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Available => "available",
            Self::Processing => "processing",
            Self::Success => "success",
            Self::Error => "error",
        }
    }

    /// Returns true for `success` and `error`.
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Success | Self::Error)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "available" => Ok(Self::Available),
            "processing" => Ok(Self::Processing),
            "success" => Ok(Self::Success),
            "error" => Ok(Self::Error),
            _ => Err(format!("invalid job status: {s}")),
        }
    }
}

impl sqlx::Type<PgDb> for JobStatus {
    fn type_info() -> PgTypeInfo {
        <&str as sqlx::Type<PgDb>>::type_info()
    }

    fn compatible(ty: &PgTypeInfo) -> bool {
        <&str as sqlx::Type<PgDb>>::compatible(ty)
    }
}

impl<'r> sqlx::Decode<'r, PgDb> for JobStatus {
    fn decode(value: PgValueRef<'r>) -> Result<Self, BoxDynError> {
        let s = <&str as sqlx::Decode<PgDb>>::decode(value)?;
        Ok(s.parse::<Self>()?)
    }
}

impl sqlx::Encode<'_, PgDb> for JobStatus {
    fn encode_by_ref(&self, buf: &mut PgArgumentBuffer) -> EncodeResult {
        <&str as sqlx::Encode<PgDb>>::encode_by_ref(&self.as_str(), buf)
    }
}

/// A webhook delivery job, one row of the shared `webhooks` table.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Webhook {
    /// Unique identifier for this job.
    pub id: WebhookId,

    /// Destination of the outbound POST.
    pub send_url: String,

    /// Payload sent verbatim as the request body; no body when absent.
    pub data: Option<Json<Value>>,

    /// Current queue state.
    pub status: JobStatus,

    /// Number of failed delivery attempts so far.
    pub attempt_count: i32,

    /// Earliest time the job may be claimed while `available`.
    pub next_attempt_time: DateTime<Utc>,

    /// Claim token of the owning worker while `processing`.
    pub processing_id: Option<ProcessingToken>,

    /// When the current claim was taken. Used by the stuck-job sweep.
    pub claimed_at: Option<DateTime<Utc>>,

    /// Receiver of the terminal outcome notification, if any.
    pub callback_url: Option<String>,

    /// Row insertion time.
    pub created_at: DateTime<Utc>,
}

impl Webhook {
    /// Returns the payload, if any. A JSON `null` counts as no payload.
    pub fn payload(&self) -> Option<&Value> {
        self.data.as_ref().map(|json| &json.0).filter(|value| !value.is_null())
    }
}

/// A job in the shape the ingestion boundary inserts it.
///
/// New jobs are always `available` with `attempt_count = 0`.
#[derive(Debug, Clone)]
pub struct NewWebhook {
    /// Assigned identifier.
    pub id: WebhookId,
    /// Destination URL.
    pub send_url: String,
    /// Optional JSON payload.
    pub data: Option<Value>,
    /// Optional callback receiver.
    pub callback_url: Option<String>,
    /// Initial eligibility time.
    pub next_attempt_time: DateTime<Utc>,
}

impl NewWebhook {
    /// Creates a job for `send_url` that is due immediately.
    pub fn new(send_url: impl Into<String>) -> Self {
        Self {
            id: WebhookId::new(),
            send_url: send_url.into(),
            data: None,
            callback_url: None,
            next_attempt_time: Utc::now(),
        }
    }

    /// Sets the JSON payload.
    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }

    /// Sets the callback URL.
    pub fn with_callback(mut self, callback_url: impl Into<String>) -> Self {
        self.callback_url = Some(callback_url.into());
        self
    }

    /// Sets when the job first becomes claimable.
    pub fn due_at(mut self, at: DateTime<Utc>) -> Self {
        self.next_attempt_time = at;
        self
    }
}

/// Resolution applied to a claimed job when it leaves `processing`.
///
/// `processing_id` and `claimed_at` are always cleared. `next_attempt_time`
/// is only written when the job is re-queued.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Resolution {
    /// Status the job moves to. Never `processing`.
    pub status: JobStatus,
    /// Attempt count after this attempt.
    pub attempt_count: i32,
    /// New eligibility time when re-queued.
    pub next_attempt_time: Option<DateTime<Utc>>,
}

/// One append-only run log row, written for every delivery attempt.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct RunLogEntry {
    /// Row id; increases with insertion order.
    pub id: i64,
    /// Job this attempt belongs to.
    pub webhook_id: WebhookId,
    /// Response body, or the transport error description.
    pub response_text: String,
    /// HTTP status code; `None` means the request never got a response.
    pub response_code: Option<i32>,
    /// Measured latency of the attempt in milliseconds.
    pub response_time_ms: i64,
    /// When the attempt was made.
    pub attempted_at: DateTime<Utc>,
}

/// Insert shape for [`RunLogEntry`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewRunLogEntry {
    /// Job this attempt belongs to.
    pub webhook_id: WebhookId,
    /// Response body, or the transport error description.
    pub response_text: String,
    /// HTTP status code; `None` for transport failures.
    pub response_code: Option<i32>,
    /// Measured latency in milliseconds.
    pub response_time_ms: i64,
    /// When the attempt was made.
    pub attempted_at: DateTime<Utc>,
}

/// Record of an applied schema migration.
#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct MigrationRecord {
    /// Numeric migration identifier.
    pub id: i64,
    /// File name the migration was loaded from.
    pub name: Option<String>,
    /// When the migration was committed.
    pub applied_at: DateTime<Utc>,
}
