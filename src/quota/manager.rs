use super::ledger::{LedgerKey, LedgerState, Reservation, ReservationStatus, UsageSnapshot};
use crate::audit::{AuditAction, AuditOutcome, AuditRecord, AuditTrail};
use crate::authz::{require_role, AuthorizationGate, Role};
use crate::clock::Clock;
use crate::config::AdmissionConfig;
use crate::error::AdmissionError;
use crate::identity::{Actor, ReservationId, ResourceType, TenantId};
use crate::lock::LockTable;
use crate::plan::{PlanSource, ResourceAccess};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tracing::{debug, info, warn};

/// A granted reservation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Admission {
    /// Id to pass to Confirm or Release.
    pub reservation_id: ReservationId,
    /// Capacity left after this claim.
    pub available_after: u64,
    /// `committed + reserved` after this claim.
    pub current_usage: u64,
    /// Ledger limit.
    pub limit: u64,
}

/// Why a Reserve was refused.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QuotaDenial {
    /// Not enough capacity left.
    QuotaExceeded {
        /// Amount asked for.
        requested: u64,
        /// Capacity left (unchanged by the refusal).
        available: u64,
        /// `committed + reserved`.
        current_usage: u64,
        /// Ledger limit.
        limit: u64,
    },
    /// The tenant's tier does not include this resource.
    FeatureLocked {
        /// The locked resource.
        resource: ResourceType,
    },
}

impl QuotaDenial {
    /// Stable reason code.
    pub fn code(&self) -> &'static str {
        match self {
            QuotaDenial::QuotaExceeded { .. } => "quota_exceeded",
            QuotaDenial::FeatureLocked { .. } => "feature_locked",
        }
    }
}

impl fmt::Display for QuotaDenial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QuotaDenial::QuotaExceeded { requested, available, current_usage, limit } => {
                write!(f, "{current_usage} of {limit} used; ")?;
                write!(f, "requested {requested} but only {available} available")
            }
            QuotaDenial::FeatureLocked { resource } => {
                write!(f, "{resource} is not included in this plan")
            }
        }
    }
}

/// Result of [`ReservationManager::reserve`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReserveOutcome {
    /// Claim created.
    Admitted(Admission),
    /// Claim refused; nothing changed.
    Denied(QuotaDenial),
}

impl ReserveOutcome {
    /// Helper to check if admitted.
    pub fn is_admitted(&self) -> bool {
        matches!(self, ReserveOutcome::Admitted(_))
    }

    /// The admission, if any.
    pub fn admission(&self) -> Option<&Admission> {
        match self {
            ReserveOutcome::Admitted(a) => Some(a),
            ReserveOutcome::Denied(_) => None,
        }
    }

    /// The denial, if any.
    pub fn denial(&self) -> Option<&QuotaDenial> {
        match self {
            ReserveOutcome::Admitted(_) => None,
            ReserveOutcome::Denied(d) => Some(d),
        }
    }
}

/// Result of [`ReservationManager::confirm`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Confirmation {
    /// Confirmed reservation.
    pub reservation_id: ReservationId,
    /// Amount moved into committed usage.
    pub committed: u64,
    /// Part of the claim handed back because actual < requested.
    pub returned: u64,
    /// Ledger after the confirm.
    pub usage: UsageSnapshot,
}

/// Result of [`ReservationManager::release`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Release {
    /// Released reservation.
    pub reservation_id: ReservationId,
    /// Amount handed back.
    pub freed: u64,
    /// Ledger after the release.
    pub usage: UsageSnapshot,
}

/// Result of [`ReservationManager::sweep`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Ledgers visited.
    pub ledgers: usize,
    /// Reservations moved to EXPIRED.
    pub expired: usize,
    /// Capacity returned.
    pub freed: u64,
}

#[derive(Debug, Clone, Copy)]
struct Settings {
    sweep_on_reserve: bool,
    default_ttl: Duration,
}

fn millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

/// Two-phase reserve -> confirm/release over per-tenant quota ledgers.
///
/// Every read-compute-write runs under the ledger's exclusive lock; operations
/// on different ledgers never wait on each other. Each call emits exactly one
/// audit record, after the lock is released.
pub struct ReservationManager {
    ledgers: LockTable<LedgerKey, LedgerState>,
    index: Mutex<HashMap<ReservationId, LedgerKey>>,
    plans: Arc<dyn PlanSource>,
    gate: Arc<dyn AuthorizationGate>,
    audit: AuditTrail,
    clock: Arc<dyn Clock>,
    settings: Settings,
}

impl fmt::Debug for ReservationManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReservationManager")
            .field("ledgers", &self.ledgers.len())
            .field("plans", &self.plans)
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

impl ReservationManager {
    /// Create a manager.
    pub fn new(
        plans: Arc<dyn PlanSource>,
        gate: Arc<dyn AuthorizationGate>,
        audit: AuditTrail,
        clock: Arc<dyn Clock>,
        config: &AdmissionConfig,
    ) -> Self {
        Self {
            ledgers: LockTable::new(config.lock_shards),
            index: Mutex::new(HashMap::new()),
            plans,
            gate,
            audit,
            clock,
            settings: Settings {
                sweep_on_reserve: config.sweep_on_reserve,
                default_ttl: config.default_reservation_ttl(),
            },
        }
    }

    /// Claim `requested` units of `resource` for `actor` in `tenant`.
    ///
    /// Unknown tenant/resource pairs fail with `NotFound`; they are never
    /// created with a zero limit. Locked resources and insufficient capacity
    /// come back as [`ReserveOutcome::Denied`].
    pub async fn reserve(
        &self,
        tenant: &TenantId,
        resource: &ResourceType,
        actor: &Actor,
        requested: u64,
    ) -> Result<ReserveOutcome, AdmissionError> {
        let result = self.reserve_locked(tenant, resource, actor, requested).await;
        let base = |outcome| {
            AuditRecord::new(AuditAction::Reserve, actor, Some(tenant), outcome)
                .with("resource", resource.as_str())
                .with("requested", requested)
        };
        let record = match &result {
            Ok(ReserveOutcome::Admitted(a)) => base(AuditOutcome::Admitted)
                .with("reservation_id", a.reservation_id.to_string())
                .with("available_after", a.available_after)
                .with("limit", a.limit),
            Ok(ReserveOutcome::Denied(d)) => {
                let record =
                    base(AuditOutcome::Denied(d.code().into())).with("message", d.to_string());
                match d {
                    QuotaDenial::QuotaExceeded { available, limit, .. } => {
                        record.with("available", *available).with("limit", *limit)
                    }
                    QuotaDenial::FeatureLocked { .. } => record,
                }
            }
            Err(e) => base(AuditOutcome::Failed(e.code().into())).with("error", e.to_string()),
        };
        self.audit.emit(record).await;
        result
    }

    async fn reserve_locked(
        &self,
        tenant: &TenantId,
        resource: &ResourceType,
        actor: &Actor,
        requested: u64,
    ) -> Result<ReserveOutcome, AdmissionError> {
        if requested == 0 {
            return Err(AdmissionError::validation("requested_amount", "must be > 0"));
        }
        let (limit, ttl) = match self.plans.resource_access(tenant, resource) {
            None => return Err(AdmissionError::not_found(format!("ledger {tenant}/{resource}"))),
            Some(ResourceAccess::Locked) => {
                debug!(%tenant, %resource, "reserve denied: feature locked");
                let denial = QuotaDenial::FeatureLocked { resource: resource.clone() };
                return Ok(ReserveOutcome::Denied(denial));
            }
            Some(ResourceAccess::Granted { limit, reservation_ttl_secs }) => {
                let ttl = reservation_ttl_secs.map(Duration::from_secs);
                (limit, ttl.unwrap_or(self.settings.default_ttl))
            }
        };

        let key = LedgerKey::new(tenant.clone(), resource.clone());
        let (mut state, created) =
            self.ledgers.lock_or_insert_with(&key, || LedgerState::new(limit)).await;
        if created {
            debug!(ledger = %key, limit, "ledger created");
        }
        let now = self.clock.now_millis();

        // Stale claims are freed before the plan limit is applied, so a
        // downgrade is only held up by usage that is still live.
        if self.settings.sweep_on_reserve {
            let (expired, freed) = state.expire_stale(now, millis(ttl));
            if expired > 0 {
                info!(ledger = %key, expired, freed, "expired stale reservations before reserve");
            }
        }

        let applied = state.ledger.refresh_limit(limit);
        if applied != limit {
            warn!(
                ledger = %key,
                plan_limit = limit,
                applied,
                "plan limit below current usage; holding at usage"
            );
        }

        let ledger = state.ledger;
        if !state.ledger.try_reserve(requested) {
            let available = ledger.available();
            debug!(ledger = %key, requested, available, "reserve denied: quota exceeded");
            return Ok(ReserveOutcome::Denied(QuotaDenial::QuotaExceeded {
                requested,
                available,
                current_usage: ledger.used(),
                limit: ledger.limit(),
            }));
        }

        let id = ReservationId::new();
        state.reservations.insert(
            id,
            Reservation {
                id,
                tenant: tenant.clone(),
                resource: resource.clone(),
                requested,
                actor: actor.clone(),
                status: ReservationStatus::Pending,
                created_at_millis: now,
                finalized_at_millis: None,
                committed: None,
            },
        );
        self.index.lock().unwrap_or_else(PoisonError::into_inner).insert(id, key.clone());

        let after = state.ledger;
        debug!(
            ledger = %key,
            reservation = %id,
            requested,
            available_after = after.available(),
            "reserved"
        );
        Ok(ReserveOutcome::Admitted(Admission {
            reservation_id: id,
            available_after: after.available(),
            current_usage: after.used(),
            limit: after.limit(),
        }))
    }

    /// Commit a PENDING reservation.
    ///
    /// `actual` is the true consumption; it is clamped to the original claim
    /// (overage needs a fresh Reserve) and the difference returns to the
    /// ledger. Only the reserving actor or [`Actor::System`] may confirm.
    pub async fn confirm(
        &self,
        tenant: &TenantId,
        reservation: ReservationId,
        actor: &Actor,
        actual: Option<u64>,
    ) -> Result<Confirmation, AdmissionError> {
        let result = self
            .finalize(tenant, reservation, actor, |state, r, now| {
                let committed = actual.unwrap_or(r.requested).min(r.requested);
                state.ledger.commit(r.requested, committed);
                r.status = ReservationStatus::Confirmed;
                r.finalized_at_millis = Some(now);
                r.committed = Some(committed);
                committed
            })
            .await
            .map(|(committed, requested, usage)| Confirmation {
                reservation_id: reservation,
                committed,
                returned: requested - committed,
                usage,
            });

        let base = |outcome| {
            AuditRecord::new(AuditAction::Confirm, actor, Some(tenant), outcome)
                .with("reservation_id", reservation.to_string())
        };
        let record = match &result {
            Ok(c) => {
                let (committed, returned) = (c.committed, c.returned);
                info!(%tenant, %reservation, committed, returned, "reservation confirmed");
                base(AuditOutcome::Admitted)
                    .with("committed", committed)
                    .with("returned", returned)
            }
            Err(e) => base(AuditOutcome::Failed(e.code().into())).with("error", e.to_string()),
        };
        self.audit.emit(record).await;
        result
    }

    /// Cancel a PENDING reservation, returning its claim to the ledger.
    pub async fn release(
        &self,
        tenant: &TenantId,
        reservation: ReservationId,
        actor: &Actor,
    ) -> Result<Release, AdmissionError> {
        let result = self
            .finalize(tenant, reservation, actor, |state, r, now| {
                state.ledger.release(r.requested);
                r.status = ReservationStatus::Released;
                r.finalized_at_millis = Some(now);
                r.requested
            })
            .await
            .map(|(freed, _, usage)| Release { reservation_id: reservation, freed, usage });

        let base = |outcome| {
            AuditRecord::new(AuditAction::Release, actor, Some(tenant), outcome)
                .with("reservation_id", reservation.to_string())
        };
        let record = match &result {
            Ok(r) => {
                info!(%tenant, %reservation, freed = r.freed, "reservation released");
                base(AuditOutcome::Admitted).with("freed", r.freed)
            }
            Err(e) => base(AuditOutcome::Failed(e.code().into())).with("error", e.to_string()),
        };
        self.audit.emit(record).await;
        result
    }

    /// Shared Confirm/Release path: locate, lock, check owner and state,
    /// then apply `transition` while still holding the lock.
    async fn finalize<F>(
        &self,
        tenant: &TenantId,
        id: ReservationId,
        actor: &Actor,
        transition: F,
    ) -> Result<(u64, u64, UsageSnapshot), AdmissionError>
    where
        F: FnOnce(&mut LedgerState, &mut Reservation, u64) -> u64,
    {
        let not_found = || AdmissionError::not_found(format!("reservation {id}"));
        let key = self.index.lock().unwrap_or_else(PoisonError::into_inner).get(&id).cloned();
        // Another tenant's reservation is reported exactly like a missing one.
        let key = key.filter(|k| &k.tenant == tenant).ok_or_else(not_found)?;
        let mut state = self.ledgers.lock(&key).await.ok_or_else(not_found)?;
        let now = self.clock.now_millis();

        let mut reservation = state.reservations.get(&id).cloned().ok_or_else(not_found)?;
        if !actor.is_system() && &reservation.actor != actor {
            let owner = &reservation.actor;
            let reason = format!("reservation {id} belongs to {owner}");
            return Err(AdmissionError::unauthorized(actor, reason));
        }
        if reservation.status.is_terminal() {
            let status = reservation.status;
            return Err(AdmissionError::AlreadyFinalized { reservation: id, status });
        }

        let amount = transition(&mut *state, &mut reservation, now);
        let requested = reservation.requested;
        state.reservations.insert(id, reservation);
        Ok((amount, requested, state.snapshot()))
    }

    /// Expire PENDING reservations older than `ttl`, in one tenant or (system
    /// actor only) all tenants.
    ///
    /// A user actor must name a tenant and hold at least [`Role::Admin`]
    /// there. A Confirm/Release that loses the race on a swept reservation
    /// fails with `AlreadyFinalized`.
    pub async fn sweep(
        &self,
        actor: &Actor,
        tenant: Option<&TenantId>,
        ttl: Duration,
    ) -> Result<SweepReport, AdmissionError> {
        let result = self.sweep_locked(actor, tenant, ttl).await;
        let base = |outcome| {
            AuditRecord::new(AuditAction::Sweep, actor, tenant, outcome)
                .with("ttl_secs", ttl.as_secs())
        };
        let record = match &result {
            Ok(report) => base(AuditOutcome::Admitted)
                .with("ledgers", report.ledgers)
                .with("expired", report.expired)
                .with("freed", report.freed),
            Err(e) => base(AuditOutcome::Failed(e.code().into())).with("error", e.to_string()),
        };
        self.audit.emit(record).await;
        result
    }

    async fn sweep_locked(
        &self,
        actor: &Actor,
        tenant: Option<&TenantId>,
        ttl: Duration,
    ) -> Result<SweepReport, AdmissionError> {
        match (actor, tenant) {
            (Actor::System, _) => {}
            (Actor::User(_), Some(t)) => {
                require_role(self.gate.as_ref(), t, actor, Role::Admin).await?
            }
            (Actor::User(_), None) => {
                let reason = "sweeping every tenant requires the system actor";
                return Err(AdmissionError::unauthorized(actor, reason));
            }
        }

        let keys = self.ledgers.keys_where(|k| tenant.map_or(true, |t| &k.tenant == t));
        let ttl_millis = millis(ttl);
        let mut report = SweepReport::default();
        for key in keys {
            let Some(mut state) = self.ledgers.lock(&key).await else { continue };
            let (expired, freed) = state.expire_stale(self.clock.now_millis(), ttl_millis);
            drop(state);
            report.ledgers += 1;
            report.expired += expired;
            report.freed += freed;
            if expired > 0 {
                info!(ledger = %key, expired, freed, "swept stale reservations");
            }
        }
        Ok(report)
    }

    /// Drop CONFIRMED/RELEASED/EXPIRED records finalized at least `retention`
    /// ago. Afterwards their ids report `NotFound` instead of
    /// `AlreadyFinalized`.
    pub async fn purge_finalized(&self, retention: Duration) -> usize {
        let retention_millis = millis(retention);
        let mut purged = 0;
        for key in self.ledgers.keys_where(|_| true) {
            let Some(mut state) = self.ledgers.lock(&key).await else { continue };
            let ids = state.purge_finalized(self.clock.now_millis(), retention_millis);
            drop(state);
            if ids.is_empty() {
                continue;
            }
            purged += ids.len();
            let mut index = self.index.lock().unwrap_or_else(PoisonError::into_inner);
            for id in ids {
                index.remove(&id);
            }
        }
        if purged > 0 {
            debug!(purged, "purged finalized reservations");
        }
        purged
    }

    /// Display read of a ledger. `None` until the first Reserve creates it.
    pub async fn usage(&self, tenant: &TenantId, resource: &ResourceType) -> Option<UsageSnapshot> {
        let key = LedgerKey::new(tenant.clone(), resource.clone());
        let state = self.ledgers.lock(&key).await?;
        Some(state.snapshot())
    }

    /// Snapshot of one reservation.
    pub async fn get(
        &self,
        tenant: &TenantId,
        id: ReservationId,
    ) -> Result<Reservation, AdmissionError> {
        let not_found = || AdmissionError::not_found(format!("reservation {id}"));
        let key = self.index.lock().unwrap_or_else(PoisonError::into_inner).get(&id).cloned();
        let key = key.filter(|k| &k.tenant == tenant).ok_or_else(not_found)?;
        let state = self.ledgers.lock(&key).await.ok_or_else(not_found)?;
        state.reservations.get(&id).cloned().ok_or_else(not_found)
    }

    /// Number of audit records the sink failed to accept.
    pub fn audit_failures(&self) -> u64 {
        self.audit.failures()
    }
}
