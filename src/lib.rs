#![forbid(unsafe_code)]
#![warn(missing_docs)]

//! # Turnstile
//!
//! Admission control for multi-tenant backends: deciding, under concurrent
//! access from many actors sharing a tenant's budget, whether to admit an
//! operation without letting aggregate usage exceed the budget.
//!
//! ## Features
//!
//! - **Quota reservations** with a reserve -> confirm/release lifecycle and a
//!   TTL sweep for abandoned claims
//! - **Fixed-window rate limits** per actor and endpoint, with Tower middleware
//! - **Access tokens** with revocation, expiry and a sliding access window
//! - **Audit trail** emitted by the core on every decision
//! - **Per-key pessimistic locking**: every check-and-mutate is one lock hold
//!
//! ## Quick Start
//!
//! ```rust
//! use std::sync::Arc;
//! use turnstile::{
//!     Actor, AdmissionCore, PlanCatalog, PlanDocument, ResourceType, TenantId, TierPlan,
//! };
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let tenant = TenantId::new("circle-1")?;
//!     let plans = PlanCatalog::new(
//!         PlanDocument::new()
//!             .tier("free", TierPlan::new().grant("video_storage_bytes", 1_000, None))
//!             .assign(&tenant, "free"),
//!     )?;
//!     let core = AdmissionCore::builder().plans(Arc::new(plans)).build()?;
//!
//!     let alice = Actor::user("alice")?;
//!     let video = ResourceType::new("video_storage_bytes")?;
//!     let outcome = core.reserve(&tenant, &video, &alice, 400).await?;
//!     if let Some(admission) = outcome.admission() {
//!         // ... do the upload, then commit what was actually used.
//!         core.confirm(&tenant, admission.reservation_id, &alice, Some(380)).await?;
//!     }
//!     Ok(())
//! }
//! ```

pub mod admission;
pub mod audit;
pub mod authz;
pub mod clock;
pub mod config;
pub mod error;
pub mod identity;
pub mod janitor;
pub mod lock;
pub mod plan;
pub mod quota;
pub mod rate_limit;
pub mod token;

// Re-exports
pub use admission::{AdmissionCore, AdmissionCoreBuilder};
pub use audit::{
    AuditAction, AuditError, AuditOutcome, AuditRecord, AuditSink, AuditTrail, MemoryAuditSink,
    MulticastAuditSink, TracingAuditSink,
};
pub use authz::{require_role, AuthorizationGate, DenyAllGate, Role, StaticAuthorizationGate};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{AdmissionConfig, ConfigError, TokenPolicy};
pub use error::{AdmissionError, GuardError};
pub use identity::{Actor, ActorId, Endpoint, ReservationId, ResourceType, TenantId, TokenId};
pub use janitor::{Janitor, JanitorHandle, JanitorReport};
pub use plan::{EndpointPolicy, PlanCatalog, PlanDocument, PlanSource, ResourceAccess, TierPlan};
pub use quota::{
    Admission, Confirmation, QuotaDenial, QuotaLedger, Release, Reservation, ReservationManager,
    ReservationStatus, ReserveOutcome, SweepReport, UsageSnapshot,
};
pub use rate_limit::{
    FixedWindowLimiter, InMemoryWindowStore, RateDecision, RateDenial, RateLimitLayer,
    RateLimitService, RateLimiter, WindowKey, WindowStore,
};
pub use token::{
    AccessToken, IssuedToken, Revocation, TokenAccessGuard, TokenDenial, TokenSecret, TokenVerdict,
};
