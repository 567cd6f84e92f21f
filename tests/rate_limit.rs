mod common;

use common::test_helpers::{harness, other_tenant, tenant, Harness, START_MILLIS};
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;
use tower::{service_fn, Layer, ServiceExt};
use turnstile::{
    ActorId, AuditAction, AuditOutcome, Endpoint, EndpointPolicy, GuardError, RateDecision,
    RateLimitLayer, RateLimiter, TenantId,
};

fn alice() -> ActorId {
    ActorId::new("alice").unwrap()
}

fn upload() -> Endpoint {
    Endpoint::new("upload.create").unwrap()
}

/// Move the clock to the start of the next hour-aligned window.
fn align_to_hour(h: &Harness) {
    let hour = 3_600_000;
    h.clock.set((START_MILLIS / hour + 1) * hour);
}

async fn check(h: &Harness, max_requests: u64, window_secs: u64) -> RateDecision {
    h.core
        .rate_limiter()
        .check_and_increment(&h.tenant, &alice(), &upload(), max_requests, window_secs)
        .await
        .unwrap()
}

#[tokio::test]
async fn ten_per_hour_then_denied_then_fresh_window() {
    let h = harness(100);
    align_to_hour(&h);

    for n in 1..=10 {
        let decision = check(&h, 10, 3600).await;
        assert!(decision.is_allowed(), "call {n} should pass");
        assert_eq!(decision.count(), n);
        h.clock.advance(Duration::from_secs(60));
    }
    let eleventh = check(&h, 10, 3600).await;
    let denial = eleventh.denial().expect("11th call denied");
    assert_eq!((denial.count, denial.limit), (11, 10));
    assert_eq!(denial.retry_after, Duration::from_secs(3600 - 600));

    h.clock.advance(Duration::from_secs(3000));
    let fresh = check(&h, 10, 3600).await;
    assert!(fresh.is_allowed());
    assert_eq!(fresh.count(), 1);
}

#[tokio::test]
async fn boundary_burst_is_admitted() {
    let h = harness(100);
    align_to_hour(&h);
    h.clock.advance(Duration::from_secs(3599));
    for _ in 0..10 {
        assert!(check(&h, 10, 3600).await.is_allowed());
    }
    h.clock.advance(Duration::from_secs(1));
    for _ in 0..10 {
        assert!(check(&h, 10, 3600).await.is_allowed());
    }
    assert!(!check(&h, 10, 3600).await.is_allowed());
}

#[tokio::test]
async fn checks_are_audited_under_the_tenant() {
    let h = harness(100);
    check(&h, 1, 60).await;
    check(&h, 1, 60).await;
    let records = h.audit.records_for(AuditAction::RateCheck).await;
    assert_eq!(records.len(), 2);
    assert_eq!(records[0].outcome, AuditOutcome::Admitted);
    assert_eq!(records[1].outcome, AuditOutcome::Denied("rate_limited".into()));
    assert_eq!(records[1].principal, "user:alice");
    assert!(records.iter().all(|r| r.tenant.as_ref() == Some(&h.tenant)));
}

#[tokio::test]
async fn spent_budget_in_one_tenant_leaves_another_untouched() {
    let h = harness(100);
    let (circle_1, circle_2) = (tenant(), other_tenant());
    for _ in 0..10 {
        assert!(h.core.check_endpoint(&circle_1, &alice(), &upload()).await.unwrap().is_allowed());
    }
    let spent = h.core.check_endpoint(&circle_1, &alice(), &upload()).await.unwrap();
    assert_eq!(spent.denial().map(|d| d.count), Some(11));

    let other = h.core.check_endpoint(&circle_2, &alice(), &upload()).await.unwrap();
    assert!(other.is_allowed());
    assert_eq!(other.count(), 1);

    let records = h.audit.records_for(AuditAction::RateCheck).await;
    assert_eq!(records.last().and_then(|r| r.tenant.as_ref()), Some(&circle_2));
}

#[tokio::test]
async fn middleware_short_circuits_over_budget() {
    let h = harness(100);
    let layer = RateLimitLayer::new(
        Arc::clone(h.core.rate_limiter()),
        EndpointPolicy::new(2, 60),
        |req: &(&'static str, &'static str)| {
            Some((TenantId::new(req.0).ok()?, ActorId::new(req.1).ok()?, upload()))
        },
    );
    let svc = layer.layer(service_fn(|(_, who): (&'static str, &'static str)| async move {
        Ok::<_, Infallible>(format!("hello {who}"))
    }));

    assert_eq!(svc.clone().oneshot(("circle-1", "alice")).await.unwrap(), "hello alice");
    assert_eq!(svc.clone().oneshot(("circle-1", "alice")).await.unwrap(), "hello alice");
    let err = svc.clone().oneshot(("circle-1", "alice")).await.unwrap_err();
    assert!(err.is_rate_limited());
    assert_eq!(err.denial().map(|d| d.limit), Some(2));
    // Another actor, or the same actor in another tenant, has its own budget.
    assert!(svc.clone().oneshot(("circle-1", "bob")).await.is_ok());
    assert!(svc.clone().oneshot(("circle-2", "alice")).await.is_ok());
}

#[tokio::test]
async fn middleware_refuses_unattributable_requests() {
    let h = harness(100);
    let layer = RateLimitLayer::new(
        Arc::clone(h.core.rate_limiter()),
        EndpointPolicy::new(2, 60),
        |_: &u32| -> Option<(TenantId, ActorId, Endpoint)> { None },
    );
    let svc = layer.layer(service_fn(|_: u32| async { Ok::<_, Infallible>(()) }));
    match svc.oneshot(7).await {
        Err(GuardError::Admission(e)) => assert!(e.is_validation()),
        other => panic!("expected admission error, got {other:?}"),
    }
}

#[tokio::test]
async fn plan_budget_and_cleanup() {
    let h = harness(100);
    let tenant = h.tenant.clone();
    for _ in 0..10 {
        assert!(h.core.check_endpoint(&tenant, &alice(), &upload()).await.unwrap().is_allowed());
    }
    assert!(!h.core.check_endpoint(&tenant, &alice(), &upload()).await.unwrap().is_allowed());

    h.clock.advance(Duration::from_secs(3 * 3600));
    let removed = h.core.rate_limiter().cleanup(Duration::from_secs(3600)).await.unwrap();
    assert_eq!(removed, 1);
    assert!(h.core.rate_limiter().store().is_empty());
}
