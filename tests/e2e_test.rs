//! End-to-end dispatch through the delivery engine and a real database.
//!
//! Skipped when `DATABASE_URL` is not set.

use std::{sync::Arc, time::Duration};

use anyhow::Result;
use courier_core::{JobStatus, RealClock, WebhookId};
use courier_delivery::{
    BackoffStrategy, DeliveryConfig, DeliveryEngine, RestartPolicy, RetryPolicy,
};
use courier_testing::{TestEnv, WebhookBuilder};
use serde_json::json;
use wiremock::{matchers, Mock, MockServer, ResponseTemplate};

fn immediate_retries(max_attempts: u32) -> DeliveryConfig {
    DeliveryConfig {
        worker_count: 2,
        poll_interval: Duration::from_millis(10),
        retry_policy: RetryPolicy {
            max_attempts,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            backoff_strategy: BackoffStrategy::Fixed,
        },
        restart_policy: RestartPolicy { enabled: true, delay: Duration::from_millis(10) },
        ..Default::default()
    }
}

async fn wait_for_status(env: &TestEnv, id: WebhookId, status: JobStatus) -> Result<()> {
    for _ in 0..500 {
        if env.status(id).await? == status {
            return Ok(());
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    anyhow::bail!("job {id} never reached {status:?}")
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn delivered_job_reports_success_to_callback() -> Result<()> {
    TestEnv::run_isolated_test(|env| async move {
        let server = MockServer::start().await;
        Mock::given(matchers::method("POST"))
            .and(matchers::path("/hook"))
            .and(matchers::body_json(json!({"invoice": "INV-7"})))
            .respond_with(ResponseTemplate::new(202).set_body_string("queued"))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(matchers::method("POST"))
            .and(matchers::path("/callback"))
            .and(matchers::body_partial_json(json!({
                "final_status": "success",
                "attempt_count": 0,
                "last_response": {"response_code": 202, "response_text": "queued"}
            })))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let id = WebhookBuilder::new(format!("{}/hook", server.uri()))
            .data(json!({"invoice": "INV-7"}))
            .callback(format!("{}/callback", server.uri()))
            .insert(&env)
            .await?;

        let mut engine =
            DeliveryEngine::new(env.pool().clone(), immediate_retries(5), Arc::new(RealClock::new()))?;
        engine.start()?;
        wait_for_status(&env, id, JobStatus::Success).await?;
        engine.shutdown().await?;

        let log = env.run_log(id).await?;
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].response_code, Some(202));

        server.verify().await;
        Ok(())
    })
    .await
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn rejected_job_ends_in_error_after_attempt_limit() -> Result<()> {
    TestEnv::run_isolated_test(|env| async move {
        let server = MockServer::start().await;
        Mock::given(matchers::method("POST"))
            .and(matchers::path("/hook"))
            .respond_with(ResponseTemplate::new(503).set_body_string("maintenance"))
            .expect(3)
            .mount(&server)
            .await;
        Mock::given(matchers::method("POST"))
            .and(matchers::path("/callback"))
            .and(matchers::body_partial_json(json!({"final_status": "error", "attempt_count": 3})))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let id = WebhookBuilder::new(format!("{}/hook", server.uri()))
            .callback(format!("{}/callback", server.uri()))
            .insert(&env)
            .await?;

        let mut engine =
            DeliveryEngine::new(env.pool().clone(), immediate_retries(3), Arc::new(RealClock::new()))?;
        engine.start()?;
        wait_for_status(&env, id, JobStatus::Error).await?;
        engine.shutdown().await?;

        let job = env.webhook(id).await?;
        assert_eq!(job.attempt_count, 3);
        assert!(job.processing_id.is_none());

        let log = env.run_log(id).await?;
        assert_eq!(log.len(), 3);
        assert!(log.iter().all(|entry| entry.response_code == Some(503)));

        server.verify().await;
        Ok(())
    })
    .await
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn many_jobs_are_each_delivered_once() -> Result<()> {
    TestEnv::run_isolated_test_with_pool_size(12, |env| async move {
        let server = MockServer::start().await;
        Mock::given(matchers::method("POST"))
            .respond_with(ResponseTemplate::new(200))
            .expect(25)
            .mount(&server)
            .await;

        let mut ids = Vec::new();
        for n in 0..25 {
            let id = WebhookBuilder::new(format!("{}/hook/{n}", server.uri()))
                .data(json!({"n": n}))
                .insert(&env)
                .await?;
            ids.push(id);
        }

        let config = DeliveryConfig { worker_count: 4, ..immediate_retries(5) };
        let mut engine =
            DeliveryEngine::new(env.pool().clone(), config, Arc::new(RealClock::new()))?;
        engine.start()?;
        for id in &ids {
            wait_for_status(&env, *id, JobStatus::Success).await?;
        }
        engine.shutdown().await?;

        for id in ids {
            assert_eq!(env.run_log(id).await?.len(), 1);
        }
        server.verify().await;
        Ok(())
    })
    .await
}
