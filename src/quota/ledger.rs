use crate::identity::{Actor, ReservationId, ResourceType, TenantId};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// Ledger key: one row per tenant and resource type.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LedgerKey {
    /// Owning tenant.
    pub tenant: TenantId,
    /// Metered resource.
    pub resource: ResourceType,
}

impl LedgerKey {
    /// Build a key.
    pub fn new(tenant: TenantId, resource: ResourceType) -> Self {
        Self { tenant, resource }
    }
}

impl fmt::Display for LedgerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.tenant, self.resource)
    }
}

/// Limit and usage for one ledger.
///
/// `committed + reserved <= limit` holds after every mutation made through
/// these methods.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuotaLedger {
    limit: u64,
    committed: u64,
    reserved: u64,
}

impl QuotaLedger {
    /// Fresh ledger with nothing used.
    pub fn new(limit: u64) -> Self {
        Self { limit, committed: 0, reserved: 0 }
    }

    /// Current limit.
    pub fn limit(&self) -> u64 {
        self.limit
    }

    /// Confirmed usage.
    pub fn committed(&self) -> u64 {
        self.committed
    }

    /// Claimed by PENDING reservations.
    pub fn reserved(&self) -> u64 {
        self.reserved
    }

    /// `committed + reserved`.
    pub fn used(&self) -> u64 {
        self.committed.saturating_add(self.reserved)
    }

    /// `limit - committed - reserved`.
    pub fn available(&self) -> u64 {
        self.limit.saturating_sub(self.used())
    }

    /// Whether the capacity invariant holds.
    pub fn within_limit(&self) -> bool {
        self.used() <= self.limit
    }

    /// Claim `amount` if it fits.
    pub(crate) fn try_reserve(&mut self, amount: u64) -> bool {
        if amount > self.available() {
            return false;
        }
        self.reserved += amount;
        debug_assert!(self.within_limit());
        true
    }

    /// Give a pending claim back.
    pub(crate) fn release(&mut self, amount: u64) {
        debug_assert!(amount <= self.reserved, "releasing more than reserved");
        self.reserved = self.reserved.saturating_sub(amount);
    }

    /// Turn a pending claim of `reserved` into `actual` committed usage.
    /// `actual` must not exceed `reserved`.
    pub(crate) fn commit(&mut self, reserved: u64, actual: u64) {
        debug_assert!(actual <= reserved);
        self.release(reserved);
        self.committed += actual.min(reserved);
        debug_assert!(self.within_limit());
    }

    /// Move the limit toward `target` without dropping below current usage.
    /// Returns the limit actually applied.
    pub(crate) fn refresh_limit(&mut self, target: u64) -> u64 {
        self.limit = target.max(self.used());
        self.limit
    }
}

/// Reservation lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReservationStatus {
    /// Claim held, awaiting Confirm or Release.
    Pending,
    /// Consumption committed.
    Confirmed,
    /// Cancelled by the caller.
    Released,
    /// Reclaimed by a sweep.
    Expired,
}

impl ReservationStatus {
    /// Whether the reservation has left PENDING.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, ReservationStatus::Pending)
    }

    /// Stable label.
    pub fn as_str(&self) -> &'static str {
        match self {
            ReservationStatus::Pending => "pending",
            ReservationStatus::Confirmed => "confirmed",
            ReservationStatus::Released => "released",
            ReservationStatus::Expired => "expired",
        }
    }
}

impl fmt::Display for ReservationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A provisional claim against a ledger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reservation {
    /// Id handed to the caller.
    pub id: ReservationId,
    /// Owning tenant.
    pub tenant: TenantId,
    /// Metered resource.
    pub resource: ResourceType,
    /// Amount claimed at Reserve time.
    pub requested: u64,
    /// Actor that made the claim.
    pub actor: Actor,
    /// Lifecycle state.
    pub status: ReservationStatus,
    /// Creation time, ms since epoch.
    pub created_at_millis: u64,
    /// Time the reservation left PENDING.
    pub finalized_at_millis: Option<u64>,
    /// Amount committed on Confirm.
    pub committed: Option<u64>,
}

impl Reservation {
    /// Age at `now`.
    pub fn age_millis(&self, now: u64) -> u64 {
        now.saturating_sub(self.created_at_millis)
    }
}

/// Everything guarded by one ledger lock: the usage row and the
/// reservations drawn against it.
#[derive(Debug)]
pub(crate) struct LedgerState {
    pub(crate) ledger: QuotaLedger,
    pub(crate) reservations: HashMap<ReservationId, Reservation>,
}

impl LedgerState {
    pub(crate) fn new(limit: u64) -> Self {
        Self { ledger: QuotaLedger::new(limit), reservations: HashMap::new() }
    }

    pub(crate) fn pending_count(&self) -> usize {
        self.reservations.values().filter(|r| r.status == ReservationStatus::Pending).count()
    }

    /// Expire PENDING reservations older than `ttl_millis`. Returns
    /// `(expired, freed)`.
    pub(crate) fn expire_stale(&mut self, now: u64, ttl_millis: u64) -> (usize, u64) {
        let mut expired = 0;
        let mut freed = 0;
        for reservation in self.reservations.values_mut() {
            let pending = reservation.status == ReservationStatus::Pending;
            if pending && reservation.age_millis(now) > ttl_millis {
                reservation.status = ReservationStatus::Expired;
                reservation.finalized_at_millis = Some(now);
                self.ledger.release(reservation.requested);
                expired += 1;
                freed += reservation.requested;
            }
        }
        (expired, freed)
    }

    /// Drop terminal reservations finalized at least `retention_millis` ago.
    pub(crate) fn purge_finalized(
        &mut self,
        now: u64,
        retention_millis: u64,
    ) -> Vec<ReservationId> {
        let due = |at: u64| now.saturating_sub(at) >= retention_millis;
        let stale: Vec<ReservationId> = self
            .reservations
            .values()
            .filter(|r| r.status.is_terminal() && r.finalized_at_millis.map_or(false, due))
            .map(|r| r.id)
            .collect();
        for id in &stale {
            self.reservations.remove(id);
        }
        stale
    }

    pub(crate) fn snapshot(&self) -> UsageSnapshot {
        UsageSnapshot {
            limit: self.ledger.limit(),
            committed: self.ledger.committed(),
            reserved: self.ledger.reserved(),
            available: self.ledger.available(),
            pending: self.pending_count(),
        }
    }
}

/// Point-in-time view of a ledger, for display ("X of Y used").
///
/// Taken under the row lock but stale as soon as it is returned; never base
/// an admission decision on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageSnapshot {
    /// Ledger limit.
    pub limit: u64,
    /// Confirmed usage.
    pub committed: u64,
    /// Pending claims.
    pub reserved: u64,
    /// Remaining capacity.
    pub available: u64,
    /// Number of PENDING reservations.
    pub pending: usize,
}

impl UsageSnapshot {
    /// `committed + reserved`.
    pub fn used(&self) -> u64 {
        self.committed.saturating_add(self.reserved)
    }
}

impl fmt::Display for UsageSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} of {} used ({} reserved across {} pending)",
            self.used(),
            self.limit,
            self.reserved,
            self.pending
        )
    }
}
