//! Fixture builders for webhook jobs.
//!
//! Jobs are inserted the way the ingestion boundary would: `available`,
//! zero attempts, due at the test clock's current time unless overridden.

use std::time::Duration;

use anyhow::Result;
use courier_core::{Clock, NewWebhook, WebhookId};
use serde_json::Value;

use crate::TestEnv;

/// Builder for test webhook jobs.
#[derive(Debug, Clone)]
pub struct WebhookBuilder {
    send_url: String,
    data: Option<Value>,
    callback_url: Option<String>,
    due_in: Option<Duration>,
    overdue_by: Option<Duration>,
}

impl WebhookBuilder {
    /// Starts a job targeting `send_url`.
    pub fn new(send_url: impl Into<String>) -> Self {
        Self {
            send_url: send_url.into(),
            data: None,
            callback_url: None,
            due_in: None,
            overdue_by: None,
        }
    }

    /// Sets the JSON payload.
    pub fn data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }

    /// Sets the callback URL.
    pub fn callback(mut self, url: impl Into<String>) -> Self {
        self.callback_url = Some(url.into());
        self
    }

    /// Makes the job eligible only after `delay`.
    pub fn due_in(mut self, delay: Duration) -> Self {
        self.due_in = Some(delay);
        self.overdue_by = None;
        self
    }

    /// Makes the job eligible `age` ago, ahead of jobs due now.
    pub fn overdue_by(mut self, age: Duration) -> Self {
        self.overdue_by = Some(age);
        self.due_in = None;
        self
    }

    /// Builds the insert shape relative to `clock`.
    pub fn build(&self, clock: &dyn Clock) -> NewWebhook {
        let now = clock.now_utc();
        let due = match (self.due_in, self.overdue_by) {
            (Some(delay), _) => now + to_chrono(delay),
            (None, Some(age)) => now - to_chrono(age),
            (None, None) => now,
        };

        let mut job = NewWebhook::new(self.send_url.clone()).due_at(due);
        job.data = self.data.clone();
        job.callback_url = self.callback_url.clone();
        job
    }

    /// Inserts the job into the environment's database.
    pub async fn insert(&self, env: &TestEnv) -> Result<WebhookId> {
        let job = self.build(&env.clock);
        Ok(env.storage().webhooks.create(&job).await?)
    }
}

fn to_chrono(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or(chrono::Duration::MAX)
}
