use criterion::{black_box, criterion_group, criterion_main, Criterion};
use futures::future::join_all;
use std::sync::Arc;
use turnstile::{
    Actor, ActorId, AdmissionCore, Endpoint, MemoryAuditSink, PlanCatalog, PlanDocument,
    RateLimiter, ResourceType, TenantId, TierPlan,
};

fn core() -> (AdmissionCore, TenantId, ResourceType) {
    let tenant = TenantId::new("bench").unwrap();
    let plans = PlanCatalog::new(
        PlanDocument::new()
            .tier("bench", TierPlan::new().grant("video", u64::MAX / 2, None))
            .assign(&tenant, "bench"),
    )
    .unwrap();
    let core = AdmissionCore::builder()
        .plans(Arc::new(plans))
        .audit_sink(Arc::new(MemoryAuditSink::with_capacity(1_024)))
        .build()
        .unwrap();
    (core, tenant, ResourceType::new("video").unwrap())
}

// Single caller: reserve then release on one ledger.
fn reserve_release_uncontended(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let (core, tenant, video) = core();
    let actor = Actor::user("alice").unwrap();

    c.bench_function("reserve_release_uncontended", |b| {
        b.to_async(&rt).iter(|| async {
            let outcome = core.reserve(&tenant, &video, &actor, black_box(10)).await.unwrap();
            if let Some(a) = outcome.admission() {
                let _ = black_box(core.release(&tenant, a.reservation_id, &actor).await);
            }
        });
    });
}

// 16 callers racing for the same ledger row.
fn reserve_contended(c: &mut Criterion) {
    let rt = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(4)
        .enable_all()
        .build()
        .unwrap();
    let (core, tenant, video) = core();
    let actors: Vec<Actor> = (0..16).map(|i| Actor::user(format!("actor-{i}")).unwrap()).collect();

    c.bench_function("reserve_contended_16", |b| {
        b.to_async(&rt).iter(|| async {
            let calls = actors.iter().map(|actor| {
                let core = core.clone();
                let tenant = tenant.clone();
                let video = video.clone();
                let actor = actor.clone();
                tokio::spawn(async move {
                    if let Ok(outcome) = core.reserve(&tenant, &video, &actor, 1).await {
                        if let Some(a) = outcome.admission() {
                            let _ = core.release(&tenant, a.reservation_id, &actor).await;
                        }
                    }
                })
            });
            black_box(join_all(calls).await);
        });
    });
}

fn rate_check(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let (core, tenant, _) = core();
    let actor = ActorId::new("alice").unwrap();
    let endpoint = Endpoint::new("upload.create").unwrap();

    c.bench_function("rate_check", |b| {
        b.to_async(&rt).iter(|| async {
            let limiter = core.rate_limiter();
            let decision = limiter.check_and_increment(&tenant, &actor, &endpoint, u64::MAX, 3600);
            let _ = black_box(decision.await);
        });
    });
}

criterion_group!(benches, reserve_release_uncontended, reserve_contended, rate_check);
criterion_main!(benches);
