//! One-stop wiring of the three admission components.

use crate::audit::{AuditSink, AuditTrail, TracingAuditSink};
use crate::authz::{AuthorizationGate, DenyAllGate};
use crate::clock::{Clock, SystemClock};
use crate::config::{AdmissionConfig, ConfigError};
use crate::error::AdmissionError;
use crate::identity::{Actor, ActorId, Endpoint, ReservationId, ResourceType, TenantId};
use crate::janitor::Janitor;
use crate::plan::PlanSource;
use crate::quota::{Confirmation, Release, ReservationManager, ReserveOutcome, SweepReport};
use crate::rate_limit::{FixedWindowLimiter, RateDecision, RateLimiter};
use crate::token::{TokenAccessGuard, TokenVerdict};
use std::sync::Arc;
use std::time::Duration;

/// Reservation manager, rate limiter and token guard sharing one clock,
/// audit trail, authorization gate and plan source.
#[derive(Debug, Clone)]
pub struct AdmissionCore {
    reservations: Arc<ReservationManager>,
    limiter: Arc<FixedWindowLimiter>,
    tokens: Arc<TokenAccessGuard>,
    plans: Arc<dyn PlanSource>,
    audit: AuditTrail,
    config: AdmissionConfig,
}

impl AdmissionCore {
    /// Start building a core.
    pub fn builder() -> AdmissionCoreBuilder {
        AdmissionCoreBuilder::default()
    }

    /// The reservation manager.
    pub fn reservations(&self) -> &Arc<ReservationManager> {
        &self.reservations
    }

    /// The fixed-window rate limiter.
    pub fn rate_limiter(&self) -> &Arc<FixedWindowLimiter> {
        &self.limiter
    }

    /// The token guard.
    pub fn tokens(&self) -> &Arc<TokenAccessGuard> {
        &self.tokens
    }

    /// Settings the core was built with.
    pub fn config(&self) -> &AdmissionConfig {
        &self.config
    }

    /// Number of audit records the sink failed to accept.
    pub fn audit_failures(&self) -> u64 {
        self.audit.failures()
    }

    /// Maintenance runner over this core's components.
    pub fn janitor(&self) -> Janitor {
        Janitor::new(self.reservations.clone(), self.limiter.clone(), &self.config)
    }

    /// See [`ReservationManager::reserve`].
    pub async fn reserve(
        &self,
        tenant: &TenantId,
        resource: &ResourceType,
        actor: &Actor,
        amount: u64,
    ) -> Result<ReserveOutcome, AdmissionError> {
        self.reservations.reserve(tenant, resource, actor, amount).await
    }

    /// See [`ReservationManager::confirm`].
    pub async fn confirm(
        &self,
        tenant: &TenantId,
        reservation: ReservationId,
        actor: &Actor,
        actual: Option<u64>,
    ) -> Result<Confirmation, AdmissionError> {
        self.reservations.confirm(tenant, reservation, actor, actual).await
    }

    /// See [`ReservationManager::release`].
    pub async fn release(
        &self,
        tenant: &TenantId,
        reservation: ReservationId,
        actor: &Actor,
    ) -> Result<Release, AdmissionError> {
        self.reservations.release(tenant, reservation, actor).await
    }

    /// See [`ReservationManager::sweep`].
    pub async fn sweep(
        &self,
        actor: &Actor,
        tenant: Option<&TenantId>,
        ttl: Duration,
    ) -> Result<SweepReport, AdmissionError> {
        self.reservations.sweep(actor, tenant, ttl).await
    }

    /// Rate check against the budget the tenant's plan sets for `endpoint`.
    /// An endpoint the plan does not budget is `NotFound`.
    pub async fn check_endpoint(
        &self,
        tenant: &TenantId,
        actor: &ActorId,
        endpoint: &Endpoint,
    ) -> Result<RateDecision, AdmissionError> {
        let policy = self.plans.endpoint_policy(tenant, endpoint).ok_or_else(|| {
            AdmissionError::not_found(format!("endpoint budget {tenant}/{endpoint}"))
        })?;
        self.limiter
            .check_and_increment(tenant, actor, endpoint, policy.max_requests, policy.window_secs)
            .await
    }

    /// Validate a bearer token under its tenant's token policy, or the
    /// configured default when the plan sets none.
    pub async fn validate_token(&self, raw: &str) -> Result<TokenVerdict, AdmissionError> {
        let policy = match self.tokens.tenant_of(raw).await {
            Some(tenant) => self.plans.token_policy(&tenant).unwrap_or(self.config.token),
            None => self.config.token,
        };
        self.tokens.validate(raw, policy).await
    }
}

/// Builder for [`AdmissionCore`]. Plans are required; everything else has a
/// default: wall clock, tracing audit sink, and a gate that denies every
/// non-system actor.
#[derive(Default)]
pub struct AdmissionCoreBuilder {
    clock: Option<Arc<dyn Clock>>,
    audit: Option<Arc<dyn AuditSink>>,
    gate: Option<Arc<dyn AuthorizationGate>>,
    plans: Option<Arc<dyn PlanSource>>,
    config: AdmissionConfig,
}

impl AdmissionCoreBuilder {
    /// Clock for every timestamp.
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Audit sink receiving every decision.
    pub fn audit_sink(mut self, sink: Arc<dyn AuditSink>) -> Self {
        self.audit = Some(sink);
        self
    }

    /// Gate consulted for administrative operations.
    pub fn authorization(mut self, gate: Arc<dyn AuthorizationGate>) -> Self {
        self.gate = Some(gate);
        self
    }

    /// Tenant plan source.
    pub fn plans(mut self, plans: Arc<dyn PlanSource>) -> Self {
        self.plans = Some(plans);
        self
    }

    /// Deployment settings.
    pub fn config(mut self, config: AdmissionConfig) -> Self {
        self.config = config;
        self
    }

    /// Validate the settings and wire the components.
    pub fn build(self) -> Result<AdmissionCore, AdmissionError> {
        self.config.validate()?;
        let plans = self.plans.ok_or(ConfigError::Invalid {
            field: "plans",
            reason: "a plan source is required".into(),
        })?;
        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock));
        let sink = self.audit.unwrap_or_else(|| Arc::new(TracingAuditSink));
        let gate = self.gate.unwrap_or_else(|| Arc::new(DenyAllGate));
        let audit = AuditTrail::new(sink, clock.clone());

        let reservations = ReservationManager::new(
            plans.clone(),
            gate.clone(),
            audit.clone(),
            clock.clone(),
            &self.config,
        );
        let limiter = FixedWindowLimiter::in_memory(audit.clone(), clock.clone());
        let tokens = TokenAccessGuard::new(gate, audit.clone(), clock, self.config.lock_shards);
        tracing::info!(lock_shards = self.config.lock_shards, "admission core ready");

        Ok(AdmissionCore {
            reservations: Arc::new(reservations),
            limiter: Arc::new(limiter),
            tokens: Arc::new(tokens),
            plans,
            audit,
            config: self.config,
        })
    }
}
