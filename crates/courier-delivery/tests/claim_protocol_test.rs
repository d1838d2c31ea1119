//! Claim protocol tests against the in-memory store.
//!
//! The mock applies each conditional update under one lock, so these tests
//! exercise the same exclusivity rules the Postgres updates enforce.

#![allow(clippy::unwrap_used)]

use chrono::Utc;
use courier_core::{Clock, JobStatus, NewWebhook, ProcessingToken, Resolution, TestClock};
use courier_delivery::storage::{mock::MockJobStore, JobSession, JobStore};

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_claims_have_exactly_one_winner() {
    let store = MockJobStore::new();
    let now = Utc::now();
    let id = store.insert(NewWebhook::new("http://example.com").due_at(now)).await;

    let mut handles = Vec::new();
    for _ in 0..16 {
        let store = store.clone();
        handles.push(tokio::spawn(async move {
            let mut session = store.session().await.unwrap();
            session.try_claim(id, ProcessingToken::new(), now).await.unwrap()
        }));
    }

    let mut winners = 0;
    for handle in handles {
        if handle.await.unwrap() {
            winners += 1;
        }
    }

    assert_eq!(winners, 1);
    assert_eq!(store.job(id).await.unwrap().status, JobStatus::Processing);
}

#[tokio::test]
async fn claimed_row_carries_token_and_claim_time() {
    let store = MockJobStore::new();
    let clock = TestClock::new();
    let now = clock.now_utc();
    let id = store.insert(NewWebhook::new("http://example.com").due_at(now)).await;

    let mut session = store.session().await.unwrap();
    let token = ProcessingToken::new();
    assert!(session.try_claim(id, token, now).await.unwrap());

    let claimed = session.fetch_claimed(token).await.unwrap().unwrap();
    assert_eq!(claimed.id, id);
    assert_eq!(claimed.processing_id, Some(token));
    assert_eq!(claimed.claimed_at, Some(now));

    assert!(session.fetch_claimed(ProcessingToken::new()).await.unwrap().is_none());
}

#[tokio::test]
async fn future_jobs_are_not_candidates() {
    let store = MockJobStore::new();
    let now = Utc::now();
    store.insert(NewWebhook::new("http://later").due_at(now + chrono::Duration::minutes(5))).await;
    let due = store.insert(NewWebhook::new("http://now").due_at(now)).await;

    let mut session = store.session().await.unwrap();
    assert_eq!(session.find_claimable(10, now).await.unwrap(), vec![due]);
}

#[tokio::test]
async fn candidates_are_oldest_due_first_and_limited() {
    let store = MockJobStore::new();
    let now = Utc::now();
    let newest = store.insert(NewWebhook::new("http://c").due_at(now)).await;
    let oldest =
        store.insert(NewWebhook::new("http://a").due_at(now - chrono::Duration::minutes(2))).await;
    let middle =
        store.insert(NewWebhook::new("http://b").due_at(now - chrono::Duration::minutes(1))).await;

    let mut session = store.session().await.unwrap();
    assert_eq!(session.find_claimable(2, now).await.unwrap(), vec![oldest, middle]);
    assert_eq!(session.find_claimable(5, now).await.unwrap().last(), Some(&newest));
}

#[tokio::test]
async fn terminal_jobs_stay_terminal() {
    let store = MockJobStore::new();
    let now = Utc::now();
    let id = store.insert(NewWebhook::new("http://example.com").due_at(now)).await;
    let mut session = store.session().await.unwrap();

    let token = ProcessingToken::new();
    assert!(session.try_claim(id, token, now).await.unwrap());
    let success =
        Resolution { status: JobStatus::Success, attempt_count: 0, next_attempt_time: None };
    assert!(session.resolve(id, token, success).await.unwrap());

    assert!(!session.try_claim(id, ProcessingToken::new(), now).await.unwrap());
    assert!(!session.resolve(id, token, success).await.unwrap());
    assert!(session.find_claimable(10, now).await.unwrap().is_empty());
    assert_eq!(store.job(id).await.unwrap().status, JobStatus::Success);
}

#[tokio::test]
async fn stale_token_cannot_resolve() {
    let store = MockJobStore::new();
    let now = Utc::now();
    let id = store.insert(NewWebhook::new("http://example.com").due_at(now)).await;
    let mut session = store.session().await.unwrap();

    let first = ProcessingToken::new();
    assert!(session.try_claim(id, first, now).await.unwrap());

    // worker presumed dead, job re-queued and claimed again
    let later = now + chrono::Duration::minutes(10);
    assert_eq!(store.requeue_stuck(later, later).await.unwrap(), 1);
    let second = ProcessingToken::new();
    assert!(session.try_claim(id, second, later).await.unwrap());

    let retry = Resolution {
        status: JobStatus::Available,
        attempt_count: 1,
        next_attempt_time: Some(later),
    };
    assert!(!session.resolve(id, first, retry).await.unwrap());
    assert!(session.resolve(id, second, retry).await.unwrap());
    assert_eq!(store.job(id).await.unwrap().attempt_count, 1);
}

#[tokio::test]
async fn resolve_never_decreases_attempt_count() {
    let store = MockJobStore::new();
    let now = Utc::now();
    let id = store.insert(NewWebhook::new("http://example.com").due_at(now)).await;
    let mut session = store.session().await.unwrap();

    let token = ProcessingToken::new();
    session.try_claim(id, token, now).await.unwrap();
    let bump =
        Resolution { status: JobStatus::Available, attempt_count: 3, next_attempt_time: Some(now) };
    assert!(session.resolve(id, token, bump).await.unwrap());

    let token = ProcessingToken::new();
    session.try_claim(id, token, now).await.unwrap();
    let regress =
        Resolution { status: JobStatus::Available, attempt_count: 2, next_attempt_time: Some(now) };
    assert!(!session.resolve(id, token, regress).await.unwrap());
    assert_eq!(store.job(id).await.unwrap().attempt_count, 3);
}

#[tokio::test]
async fn claim_first_skips_lost_and_failed_candidates() {
    let store = MockJobStore::new();
    let now = Utc::now();
    let taken = store.insert(NewWebhook::new("http://a").due_at(now)).await;
    let broken = store.insert(NewWebhook::new("http://b").due_at(now)).await;
    let free = store.insert(NewWebhook::new("http://c").due_at(now)).await;

    let mut other = store.session().await.unwrap();
    assert!(other.try_claim(taken, ProcessingToken::new(), now).await.unwrap());

    let mut session = store.session().await.unwrap();
    store.inject_claim_errors(1).await;
    let before = store.claim_attempts();
    let claimed = session
        .claim_first(vec![broken, taken, free], ProcessingToken::new(), now)
        .await
        .unwrap();

    assert_eq!(claimed, Some(free));
    assert_eq!(store.claim_attempts() - before, 3);
    assert_eq!(store.job(broken).await.unwrap().status, JobStatus::Available);
}
