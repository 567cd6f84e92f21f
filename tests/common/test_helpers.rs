#![allow(dead_code)]

use std::sync::Arc;
use turnstile::{
    Actor, ActorId, AdmissionConfig, AdmissionCore, EndpointPolicy, ManualClock, MemoryAuditSink,
    PlanCatalog, PlanDocument, ReservationId, ResourceType, Role, StaticAuthorizationGate, TenantId,
    TierPlan, TokenPolicy,
};

pub const START_MILLIS: u64 = 1_700_000_000_000;

pub struct Harness {
    pub core: AdmissionCore,
    pub clock: ManualClock,
    pub audit: MemoryAuditSink,
    pub gate: Arc<StaticAuthorizationGate>,
    pub plans: PlanCatalog,
    pub tenant: TenantId,
}

impl Harness {
    /// Reserve `amount` of video in the harness tenant; panics unless admitted.
    pub async fn reserved(&self, actor: &Actor, amount: u64) -> ReservationId {
        let outcome = self.core.reserve(&self.tenant, &video(), actor, amount).await.unwrap();
        outcome.admission().expect("reservation admitted").reservation_id
    }
}

pub fn tenant() -> TenantId {
    TenantId::new("circle-1").unwrap()
}

pub fn other_tenant() -> TenantId {
    TenantId::new("circle-2").unwrap()
}

pub fn video() -> ResourceType {
    ResourceType::new("video_storage_bytes").unwrap()
}

pub fn user(name: &str) -> Actor {
    Actor::user(name).unwrap()
}

pub fn standard_plans(video_limit: u64) -> PlanDocument {
    PlanDocument::new()
        .tier(
            "family",
            TierPlan::new()
                .grant("video_storage_bytes", video_limit, None)
                .lock("document_scan")
                .endpoint("upload.create", EndpointPolicy::new(10, 3600))
                .token(TokenPolicy::new(100, 3600).unwrap()),
        )
        .assign(&tenant(), "family")
        .assign(&other_tenant(), "family")
}

pub fn harness(video_limit: u64) -> Harness {
    harness_with(video_limit, AdmissionConfig::default())
}

/// Route core logs to the test writer; later calls are no-ops.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

pub fn harness_with(video_limit: u64, config: AdmissionConfig) -> Harness {
    init_tracing();
    let clock = ManualClock::starting_at(START_MILLIS);
    let audit = MemoryAuditSink::new();
    let gate = Arc::new(
        StaticAuthorizationGate::new()
            .with_role(&tenant(), &ActorId::new("admin").unwrap(), Role::Admin)
            .with_role(&tenant(), &ActorId::new("alice").unwrap(), Role::Contributor),
    );
    let plans = PlanCatalog::new(standard_plans(video_limit)).unwrap();
    let core = AdmissionCore::builder()
        .clock(Arc::new(clock.clone()))
        .audit_sink(Arc::new(audit.clone()))
        .authorization(gate.clone())
        .plans(Arc::new(plans.clone()))
        .config(config)
        .build()
        .unwrap();
    Harness { core, clock, audit, gate, plans, tenant: tenant() }
}

/// Assert the capacity invariant on the tenant's video ledger.
pub async fn assert_within_limit(h: &Harness) {
    if let Some(usage) = h.core.reservations().usage(&h.tenant, &video()).await {
        assert!(
            usage.committed + usage.reserved <= usage.limit,
            "capacity invariant violated: {usage:?}"
        );
    }
}
