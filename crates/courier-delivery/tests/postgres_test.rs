//! Delivery against the Postgres job store.
//!
//! Each test runs in its own migrated database and is skipped when
//! `DATABASE_URL` is not set.

#![allow(clippy::unwrap_used)]

use std::{sync::Arc, time::Duration};

use anyhow::Result;
use courier_core::{Clock, JobStatus, ProcessingToken};
use courier_delivery::{
    storage::{JobSession, JobStore, PostgresJobStore},
    BackoffStrategy, CallbackNotifier, DeliveryClient, DeliveryConfig, DeliveryWorker,
    RetryPolicy, StuckJobSweeper, SweepConfig,
};
use courier_testing::{TestEnv, WebhookBuilder};
use serde_json::json;
use tokio_util::sync::CancellationToken;
use wiremock::{matchers, Mock, MockServer, ResponseTemplate};

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn sessions_race_for_one_job_and_one_wins() -> Result<()> {
    TestEnv::run_isolated_test_with_pool_size(12, |env| async move {
        let id = WebhookBuilder::new("http://example.com").insert(&env).await?;
        let store = Arc::new(PostgresJobStore::new(env.storage()));
        let now = env.clock.now_utc();

        let mut handles = Vec::new();
        for _ in 0..8 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                let mut session = store.session().await?;
                session.try_claim(id, ProcessingToken::new(), now).await
            }));
        }

        let mut winners = 0;
        for handle in handles {
            if handle.await?? {
                winners += 1;
            }
        }

        assert_eq!(winners, 1);
        assert_eq!(env.status(id).await?, JobStatus::Processing);
        Ok(())
    })
    .await
}

#[tokio::test]
async fn worker_retries_then_succeeds_with_callback() -> Result<()> {
    TestEnv::run_isolated_test(|env| async move {
        let server = MockServer::start().await;
        Mock::given(matchers::method("POST"))
            .and(matchers::path("/hook"))
            .and(matchers::body_json(json!({"order": 42})))
            .respond_with(ResponseTemplate::new(500))
            .up_to_n_times(2)
            .mount(&server)
            .await;
        Mock::given(matchers::method("POST"))
            .and(matchers::path("/hook"))
            .respond_with(ResponseTemplate::new(200).set_body_string("accepted"))
            .mount(&server)
            .await;
        Mock::given(matchers::method("POST"))
            .and(matchers::path("/callback"))
            .and(matchers::body_partial_json(json!({"final_status": "success", "attempt_count": 2})))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let id = WebhookBuilder::new(format!("{}/hook", server.uri()))
            .data(json!({"order": 42}))
            .callback(format!("{}/callback", server.uri()))
            .insert(&env)
            .await?;

        let config = DeliveryConfig {
            retry_policy: RetryPolicy {
                max_attempts: 5,
                base_delay: Duration::from_secs(60),
                max_delay: Duration::from_secs(3600),
                backoff_strategy: BackoffStrategy::Quadratic,
            },
            ..Default::default()
        };
        let store = PostgresJobStore::new(env.storage());
        let notifier = CallbackNotifier::new(Duration::from_secs(5))?;
        let mut worker = DeliveryWorker::new(
            0,
            store.session().await?,
            DeliveryClient::with_defaults()?,
            notifier.clone(),
            Arc::new(config),
            Arc::new(env.clock.clone()),
            CancellationToken::new(),
        );

        for _ in 0..3 {
            assert!(worker.process_next().await?.is_some());
            env.advance_time(Duration::from_secs(60));
        }
        notifier.flush().await;

        let job = env.webhook(id).await?;
        assert_eq!(job.status, JobStatus::Success);
        assert_eq!(job.attempt_count, 2);
        assert!(job.processing_id.is_none());

        let log = env.run_log(id).await?;
        let codes: Vec<_> = log.iter().map(|entry| entry.response_code).collect();
        assert_eq!(codes, vec![Some(500), Some(500), Some(200)]);
        assert_eq!(log[2].response_text, "accepted");

        server.verify().await;
        Ok(())
    })
    .await
}

#[tokio::test]
async fn stuck_claim_is_swept_back_to_the_queue() -> Result<()> {
    TestEnv::run_isolated_test(|env| async move {
        let id = WebhookBuilder::new("http://example.com").insert(&env).await?;
        let store: Arc<dyn JobStore> = Arc::new(PostgresJobStore::new(env.storage()));

        let mut session = store.session().await?;
        assert!(session.try_claim(id, ProcessingToken::new(), env.clock.now_utc()).await?);
        drop(session);

        let sweeper = StuckJobSweeper::new(
            store.clone(),
            SweepConfig::default(),
            Arc::new(env.clock.clone()),
            CancellationToken::new(),
        );
        assert_eq!(sweeper.sweep_once().await?, 0);

        env.advance_time(Duration::from_secs(301));
        assert_eq!(sweeper.sweep_once().await?, 1);

        let job = env.webhook(id).await?;
        assert_eq!(job.status, JobStatus::Available);
        assert_eq!(job.attempt_count, 0);
        assert!(job.processing_id.is_none());
        Ok(())
    })
    .await
}

#[tokio::test]
async fn response_with_nul_byte_is_still_logged() -> Result<()> {
    TestEnv::run_isolated_test(|env| async move {
        let server = MockServer::start().await;
        Mock::given(matchers::method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"ok\0done".to_vec()))
            .mount(&server)
            .await;

        let id = WebhookBuilder::new(server.uri()).insert(&env).await?;
        let store = PostgresJobStore::new(env.storage());
        let mut worker = DeliveryWorker::new(
            0,
            store.session().await?,
            DeliveryClient::with_defaults()?,
            CallbackNotifier::new(Duration::from_secs(5))?,
            Arc::new(DeliveryConfig::default()),
            Arc::new(env.clock.clone()),
            CancellationToken::new(),
        );

        assert!(worker.process_next().await?.is_some());
        assert_eq!(env.status(id).await?, JobStatus::Success);

        let log = env.run_log(id).await?;
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].response_text, "ok\u{FFFD}done");
        Ok(())
    })
    .await
}
