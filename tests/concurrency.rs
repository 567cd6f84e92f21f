mod common;

use common::test_helpers::{harness, harness_with, user, video};
use futures::future::join_all;
use std::sync::Arc;
use std::time::Duration;
use turnstile::{
    Actor, ActorId, AdmissionConfig, Endpoint, RateLimiter, ReservationStatus, TokenPolicy,
};

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn fifty_concurrent_reserves_on_limit_sixty() {
    let h = Arc::new(harness(60));
    let tasks = (0..50).map(|i| {
        let h = h.clone();
        tokio::spawn(async move {
            let actor = user(&format!("actor-{i}"));
            h.core.reserve(&h.tenant, &video(), &actor, 2).await.unwrap()
        })
    });
    let outcomes: Vec<_> = join_all(tasks).await.into_iter().map(|r| r.unwrap()).collect();

    let admitted = outcomes.iter().filter(|o| o.is_admitted()).count();
    assert_eq!(admitted, 30);
    assert_eq!(outcomes.len() - admitted, 20);
    let usage = h.core.reservations().usage(&h.tenant, &video()).await.unwrap();
    assert_eq!(usage.reserved, 60);
    assert_eq!(usage.pending, 30);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn reserves_summing_to_limit_all_succeed() {
    let h = Arc::new(harness(100));
    let tasks = (0..20).map(|_| {
        let h = h.clone();
        tokio::spawn(async move {
            h.core.reserve(&h.tenant, &video(), &user("alice"), 5).await.unwrap()
        })
    });
    for outcome in join_all(tasks).await {
        assert!(outcome.unwrap().is_admitted());
    }
    let extra = h.core.reserve(&h.tenant, &video(), &user("bob"), 1).await.unwrap();
    assert_eq!(extra.denial().map(|d| d.code()), Some("quota_exceeded"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn sweep_racing_confirm_has_exactly_one_winner() {
    let config = AdmissionConfig { sweep_on_reserve: false, ..AdmissionConfig::default() };
    let h = Arc::new(harness_with(1_000, config));
    let alice = user("alice");
    let mut ids = Vec::new();
    for _ in 0..20 {
        let outcome = h.core.reserve(&h.tenant, &video(), &alice, 10).await.unwrap();
        ids.push(outcome.admission().unwrap().reservation_id);
    }
    h.clock.advance(Duration::from_secs(120));

    let sweeper = {
        let h = h.clone();
        tokio::spawn(async move {
            h.core.sweep(&Actor::System, None, Duration::from_secs(60)).await.unwrap()
        })
    };
    let confirms = ids.iter().map(|id| {
        let h = h.clone();
        let id = *id;
        tokio::spawn(async move { h.core.confirm(&h.tenant, id, &user("alice"), None).await })
    });
    let confirm_results: Vec<_> =
        join_all(confirms).await.into_iter().map(|r| r.unwrap()).collect();
    let report = sweeper.await.unwrap();

    let confirmed = confirm_results.iter().filter(|r| r.is_ok()).count();
    for r in &confirm_results {
        if let Err(e) = r {
            assert!(e.is_already_finalized(), "unexpected error: {e}");
        }
    }
    assert_eq!(confirmed + report.expired, 20);

    let mut expired = 0;
    for id in &ids {
        match h.core.reservations().get(&h.tenant, *id).await.unwrap().status {
            ReservationStatus::Confirmed => {}
            ReservationStatus::Expired => expired += 1,
            other => panic!("unexpected status {other}"),
        }
    }
    assert_eq!(expired, report.expired);
    let usage = h.core.reservations().usage(&h.tenant, &video()).await.unwrap();
    assert_eq!(usage.reserved, 0);
    assert_eq!(usage.committed, 10 * confirmed as u64);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_double_release_frees_once() {
    let h = Arc::new(harness(100));
    let id = h.reserved(&user("alice"), 40).await;
    let attempts = (0..8).map(|_| {
        let h = h.clone();
        tokio::spawn(async move { h.core.release(&h.tenant, id, &user("alice")).await })
    });
    let ok = join_all(attempts).await.into_iter().filter(|r| r.as_ref().unwrap().is_ok()).count();
    assert_eq!(ok, 1);
    assert_eq!(h.core.reservations().usage(&h.tenant, &video()).await.unwrap().available, 100);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn concurrent_rate_checks_admit_exactly_the_budget() {
    let h = Arc::new(harness(100));
    let tasks = (0..40).map(|_| {
        let h = h.clone();
        tokio::spawn(async move {
            let actor = ActorId::new("alice").unwrap();
            let endpoint = Endpoint::new("upload.create").unwrap();
            let limiter = h.core.rate_limiter();
            limiter.check_and_increment(&h.tenant, &actor, &endpoint, 10, 3600).await.unwrap()
        })
    });
    let decisions = join_all(tasks).await;
    let allowed = decisions.into_iter().filter(|d| d.as_ref().unwrap().is_allowed()).count();
    assert_eq!(allowed, 10);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn concurrent_token_validations_never_exceed_threshold() {
    let h = Arc::new(harness(100));
    let config = serde_json::json!({});
    let issued = h.core.tokens().issue(&Actor::System, &h.tenant, None, config).await.unwrap();
    let secret = Arc::new(issued.secret.expose().to_string());
    let policy = TokenPolicy::new(25, 3600).unwrap();
    let tasks = (0..100).map(|_| {
        let h = h.clone();
        let secret = secret.clone();
        tokio::spawn(async move { h.core.tokens().validate(&secret, policy).await.unwrap() })
    });
    let verdicts = join_all(tasks).await;
    let granted = verdicts.into_iter().filter(|v| v.as_ref().unwrap().is_granted()).count();
    assert_eq!(granted, 25);
}
