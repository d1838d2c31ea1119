//! Delivery state machine.
//!
//! A pure decision from a claimed job's attempt count and the outcome of one
//! delivery attempt to the row's next state. It performs no I/O; the worker
//! applies the result through a single conditional update.

use std::time::Duration;

use chrono::{DateTime, Utc};
use courier_core::{JobStatus, NewRunLogEntry, Resolution, WebhookId};

use crate::{client::DeliveryResponse, error::DeliveryError, retry::RetryPolicy};

/// What happened when a job was delivered once.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryOutcome {
    /// The endpoint answered with a success status.
    Delivered {
        /// HTTP status code.
        status_code: u16,
        /// Response body.
        body: String,
        /// Measured latency.
        latency: Duration,
    },
    /// The endpoint answered with a non-success status.
    Rejected {
        /// HTTP status code.
        status_code: u16,
        /// Response body.
        body: String,
        /// Measured latency.
        latency: Duration,
    },
    /// No response was received (connection failure or timeout).
    Unreachable {
        /// Transport error description.
        error: String,
        /// Time until the failure.
        latency: Duration,
    },
}

impl DeliveryOutcome {
    /// Classifies the client's result for one attempt.
    pub fn from_result(result: Result<DeliveryResponse, DeliveryError>, latency: Duration) -> Self {
        match result {
            Ok(response) if response.is_success => Self::Delivered {
                status_code: response.status_code,
                body: response.body,
                latency,
            },
            Ok(response) => Self::Rejected {
                status_code: response.status_code,
                body: response.body,
                latency,
            },
            Err(error) => Self::Unreachable { error: error.to_string(), latency },
        }
    }

    /// Returns true for [`DeliveryOutcome::Delivered`].
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Delivered { .. })
    }

    /// HTTP status code; `None` when no response was received.
    pub fn status_code(&self) -> Option<u16> {
        match self {
            Self::Delivered { status_code, .. } | Self::Rejected { status_code, .. } => {
                Some(*status_code)
            },
            Self::Unreachable { .. } => None,
        }
    }

    /// Response body or transport error text.
    pub fn response_text(&self) -> &str {
        match self {
            Self::Delivered { body, .. } | Self::Rejected { body, .. } => body,
            Self::Unreachable { error, .. } => error,
        }
    }

    /// Measured latency.
    pub fn latency(&self) -> Duration {
        match self {
            Self::Delivered { latency, .. }
            | Self::Rejected { latency, .. }
            | Self::Unreachable { latency, .. } => *latency,
        }
    }

    /// Run log row for this attempt.
    pub fn to_run_log(&self, webhook_id: WebhookId, attempted_at: DateTime<Utc>) -> NewRunLogEntry {
        NewRunLogEntry {
            webhook_id,
            response_text: crate::client::strip_nul(self.response_text().to_string()),
            response_code: self.status_code().map(i32::from),
            response_time_ms: i64::try_from(self.latency().as_millis()).unwrap_or(i64::MAX),
            attempted_at,
        }
    }
}

/// The next state of a claimed job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    /// New status; never `processing`.
    pub status: JobStatus,
    /// Attempt count after this attempt.
    pub attempt_count: i32,
    /// Eligibility time when re-queued, otherwise `None`.
    pub next_attempt_time: Option<DateTime<Utc>>,
    /// Terminal status to report to the callback URL, if any.
    pub callback: Option<JobStatus>,
}

impl Transition {
    /// Returns true if the job leaves the queue for good.
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Row update applied by the job store.
    pub fn resolution(&self) -> Resolution {
        Resolution {
            status: self.status,
            attempt_count: self.attempt_count,
            next_attempt_time: self.next_attempt_time,
        }
    }
}

/// Decides the next state of a job that was delivered once.
///
/// - success: `success`, attempt count unchanged, callback `success`
/// - failure: attempt count + 1, then `error` with callback `error` if the
///   limit is reached, else `available` at `now + backoff(new count)`
pub fn decide(
    attempt_count: i32,
    outcome: &DeliveryOutcome,
    now: DateTime<Utc>,
    policy: &RetryPolicy,
) -> Transition {
    if outcome.is_success() {
        return Transition {
            status: JobStatus::Success,
            attempt_count,
            next_attempt_time: None,
            callback: Some(JobStatus::Success),
        };
    }

    let failures = attempt_count.max(0).saturating_add(1);
    let failures_u32 = failures.unsigned_abs();

    if policy.is_exhausted(failures_u32) {
        return Transition {
            status: JobStatus::Error,
            attempt_count: failures,
            next_attempt_time: None,
            callback: Some(JobStatus::Error),
        };
    }

    Transition {
        status: JobStatus::Available,
        attempt_count: failures,
        next_attempt_time: Some(policy.next_attempt_at(now, failures_u32)),
        callback: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::retry::BackoffStrategy;

    fn rejected(status_code: u16) -> DeliveryOutcome {
        DeliveryOutcome::Rejected {
            status_code,
            body: "nope".to_string(),
            latency: Duration::from_millis(12),
        }
    }

    fn delivered() -> DeliveryOutcome {
        DeliveryOutcome::Delivered {
            status_code: 200,
            body: "ok".to_string(),
            latency: Duration::from_millis(5),
        }
    }

    fn policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            base_delay: Duration::from_secs(60),
            max_delay: Duration::from_secs(3600),
            backoff_strategy: BackoffStrategy::Linear,
        }
    }

    #[test]
    fn success_is_terminal_with_callback() {
        let now = Utc::now();
        let t = decide(2, &delivered(), now, &policy(5));

        assert_eq!(t.status, JobStatus::Success);
        assert_eq!(t.attempt_count, 2);
        assert_eq!(t.next_attempt_time, None);
        assert_eq!(t.callback, Some(JobStatus::Success));
        assert!(t.is_terminal());
    }

    #[test]
    fn failure_below_limit_requeues_with_backoff() {
        let now = Utc::now();
        let t = decide(1, &rejected(500), now, &policy(5));

        assert_eq!(t.status, JobStatus::Available);
        assert_eq!(t.attempt_count, 2);
        assert_eq!(t.next_attempt_time, Some(now + chrono::Duration::seconds(120)));
        assert_eq!(t.callback, None);
    }

    #[test]
    fn failure_reaching_limit_is_terminal_error() {
        let now = Utc::now();
        let t = decide(2, &rejected(503), now, &policy(3));

        assert_eq!(t.status, JobStatus::Error);
        assert_eq!(t.attempt_count, 3);
        assert_eq!(t.next_attempt_time, None);
        assert_eq!(t.callback, Some(JobStatus::Error));
    }

    #[test]
    fn transport_failures_count_as_attempts() {
        let outcome = DeliveryOutcome::from_result(
            Err(DeliveryError::network("connection refused")),
            Duration::from_millis(3),
        );
        assert_eq!(outcome.status_code(), None);

        let t = decide(0, &outcome, Utc::now(), &policy(5));
        assert_eq!(t.status, JobStatus::Available);
        assert_eq!(t.attempt_count, 1);
    }

    #[test]
    fn single_attempt_policy_fails_immediately() {
        let t = decide(0, &rejected(400), Utc::now(), &policy(1));
        assert_eq!(t.status, JobStatus::Error);
        assert_eq!(t.attempt_count, 1);
    }

    #[test]
    fn run_log_row_reflects_outcome() {
        let id = WebhookId::new();
        let at = Utc::now();

        let entry = rejected(502).to_run_log(id, at);
        assert_eq!(entry.response_code, Some(502));
        assert_eq!(entry.response_text, "nope");
        assert_eq!(entry.response_time_ms, 12);

        let entry = DeliveryOutcome::Unreachable {
            error: "timeout".to_string(),
            latency: Duration::from_secs(30),
        }
        .to_run_log(id, at);
        assert_eq!(entry.response_code, None);
        assert_eq!(entry.response_time_ms, 30_000);

        let entry = DeliveryOutcome::Unreachable {
            error: "reset\0by peer".to_string(),
            latency: Duration::from_millis(1),
        }
        .to_run_log(id, at);
        assert_eq!(entry.response_text, "reset\u{FFFD}by peer");
    }

    #[test]
    fn resolution_mirrors_transition() {
        let now = Utc::now();
        let t = decide(0, &rejected(500), now, &policy(5));
        let r = t.resolution();
        assert_eq!(r.status, JobStatus::Available);
        assert_eq!(r.attempt_count, 1);
        assert_eq!(r.next_attempt_time, t.next_attempt_time);
    }
}
