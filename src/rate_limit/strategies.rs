use crate::audit::{AuditAction, AuditOutcome, AuditRecord, AuditTrail};
use crate::clock::Clock;
use crate::error::AdmissionError;
use crate::identity::{Actor, ActorId, Endpoint, TenantId};
use crate::rate_limit::store::{InMemoryWindowStore, WindowKey, WindowStore};
use crate::rate_limit::{RateDecision, RateDenial, RateLimiter};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// A fixed-window rate limiter.
///
/// Counts requests per `(tenant, actor, endpoint, window_start)` where
/// `window_start = now - now % window`. Every check is one atomic
/// [`WindowStore::increment`]; the decision is made on the count it returns.
pub struct FixedWindowLimiter<S = InMemoryWindowStore> {
    store: Arc<S>,
    audit: AuditTrail,
    clock: Arc<dyn Clock>,
}

impl<S> std::fmt::Debug for FixedWindowLimiter<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FixedWindowLimiter").field("clock", &self.clock).finish_non_exhaustive()
    }
}

impl<S> FixedWindowLimiter<S>
where
    S: WindowStore + 'static,
{
    /// Create a limiter backed by `store`.
    pub fn new(store: S, audit: AuditTrail, clock: Arc<dyn Clock>) -> Self {
        Self { store: Arc::new(store), audit, clock }
    }

    /// Shared handle to the backing store.
    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// Delete counters whose window started more than `older_than` ago.
    ///
    /// Storage hygiene only: a counter whose window is still current is kept
    /// regardless of the cutoff.
    pub async fn cleanup(&self, older_than: Duration) -> Result<usize, AdmissionError> {
        let now = self.clock.now_millis();
        let cutoff = now.saturating_sub(u64::try_from(older_than.as_millis()).unwrap_or(u64::MAX));
        let removed = self
            .store
            .purge(cutoff, now)
            .await
            .map_err(|e| AdmissionError::Store(e.to_string()))?;
        if removed > 0 {
            debug!(removed, cutoff, "purged rate limit windows");
        }
        Ok(removed)
    }

    async fn decide(
        &self,
        tenant: &TenantId,
        actor: &ActorId,
        endpoint: &Endpoint,
        max_requests: u64,
        window_secs: u64,
    ) -> Result<RateDecision, AdmissionError> {
        if max_requests == 0 {
            return Err(AdmissionError::validation("max_requests", "must be > 0"));
        }
        if window_secs == 0 {
            return Err(AdmissionError::validation("window_secs", "must be > 0"));
        }
        let window_millis = window_secs.saturating_mul(1_000);
        let now = self.clock.now_millis();
        let window_start = now - now % window_millis;
        let resets_at = window_start.saturating_add(window_millis);

        let key = WindowKey {
            tenant: tenant.clone(),
            actor: actor.clone(),
            endpoint: endpoint.clone(),
            window_start_millis: window_start,
        };
        let count = self
            .store
            .increment(&key, resets_at)
            .await
            .map_err(|e| AdmissionError::Store(e.to_string()))?;

        if count <= max_requests {
            debug!(%tenant, %actor, %endpoint, count, max_requests, "rate check allowed");
            Ok(RateDecision::Allowed {
                count,
                remaining: max_requests - count,
                resets_at_millis: resets_at,
            })
        } else {
            warn!(%tenant, %actor, %endpoint, count, max_requests, "rate limit exceeded");
            Ok(RateDecision::Denied(RateDenial {
                count,
                limit: max_requests,
                retry_after: Duration::from_millis(resets_at - now),
            }))
        }
    }
}

impl FixedWindowLimiter<InMemoryWindowStore> {
    /// Limiter over a fresh in-memory store.
    pub fn in_memory(audit: AuditTrail, clock: Arc<dyn Clock>) -> Self {
        Self::new(InMemoryWindowStore::new(), audit, clock)
    }
}

#[async_trait]
impl<S> RateLimiter for FixedWindowLimiter<S>
where
    S: WindowStore + 'static,
{
    async fn check_and_increment(
        &self,
        tenant: &TenantId,
        actor: &ActorId,
        endpoint: &Endpoint,
        max_requests: u64,
        window_secs: u64,
    ) -> Result<RateDecision, AdmissionError> {
        let result = self.decide(tenant, actor, endpoint, max_requests, window_secs).await;

        let principal = Actor::User(actor.clone());
        let base = |outcome| {
            AuditRecord::new(AuditAction::RateCheck, &principal, Some(tenant), outcome)
                .with("endpoint", endpoint.as_str())
                .with("max_requests", max_requests)
                .with("window_secs", window_secs)
        };
        let record = match &result {
            Ok(RateDecision::Allowed { count, remaining, .. }) => base(AuditOutcome::Admitted)
                .with("count", *count)
                .with("remaining", *remaining),
            Ok(RateDecision::Denied(d)) => base(AuditOutcome::Denied("rate_limited".into()))
                .with("count", d.count)
                .with("retry_after_secs", d.retry_after.as_secs())
                .with("message", d.to_string()),
            Err(e) => base(AuditOutcome::Failed(e.code().into())).with("error", e.to_string()),
        };
        self.audit.emit(record).await;
        result
    }
}
