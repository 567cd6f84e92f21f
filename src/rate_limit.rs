//! Fixed-window rate limiting.
//!
//! This module provides the building blocks for per-actor endpoint budgets:
//! - [`RateLimiter`]: the check-and-increment interface.
//! - [`FixedWindowLimiter`]: the fixed-window implementation (in `strategies`).
//! - [`WindowStore`]: atomic window counters (in `store`), in memory by default.
//! - [`RateLimitLayer`]: Tower middleware that enforces a budget per request.
//!
//! # Window semantics
//!
//! The window start is the current time truncated to the window size, so
//! windows are anchored to clock boundaries. A burst of `max_requests` just
//! before a boundary followed by another `max_requests` just after is
//! admitted: up to twice the nominal rate across a boundary. This is accepted
//! for upload throttling; use the token guard's sliding window where a
//! stricter bound is needed.

use crate::error::AdmissionError;
use crate::identity::{ActorId, Endpoint, TenantId};
use std::fmt;
use std::time::Duration;

pub mod middleware;
pub mod store;
pub mod strategies;
pub use middleware::{RateLimitLayer, RateLimitService};
pub use store::{InMemoryWindowStore, WindowKey, WindowStore};
pub use strategies::FixedWindowLimiter;

/// Why a rate check was refused.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateDenial {
    /// Post-increment count for the window.
    pub count: u64,
    /// Window budget.
    pub limit: u64,
    /// Time until the current window ends.
    /// Useful for `Retry-After` headers.
    pub retry_after: Duration,
}

impl fmt::Display for RateDenial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} of {} requests used this window; retry in {}s",
            self.count.min(self.limit),
            self.limit,
            self.retry_after.as_secs().max(1)
        )
    }
}

/// The decision returned by a rate limiter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RateDecision {
    /// The request is allowed to proceed.
    Allowed {
        /// Post-increment count for the window.
        count: u64,
        /// Requests left in this window.
        /// Useful for `X-RateLimit-Remaining` headers.
        remaining: u64,
        /// End of the current window, ms since epoch.
        resets_at_millis: u64,
    },
    /// The request is denied.
    Denied(RateDenial),
}

impl RateDecision {
    /// Helper to check if allowed.
    pub fn is_allowed(&self) -> bool {
        matches!(self, RateDecision::Allowed { .. })
    }

    /// Post-increment count, whichever way the decision went.
    pub fn count(&self) -> u64 {
        match self {
            RateDecision::Allowed { count, .. } => *count,
            RateDecision::Denied(d) => d.count,
        }
    }

    /// The denial, if any.
    pub fn denial(&self) -> Option<&RateDenial> {
        match self {
            RateDecision::Allowed { .. } => None,
            RateDecision::Denied(d) => Some(d),
        }
    }
}

/// Core interface for rate limiting logic.
///
/// Decouples the middleware from the window algorithm and its storage.
#[async_trait::async_trait]
pub trait RateLimiter: Send + Sync {
    /// Count one request by `actor` of `tenant` against `endpoint` and decide it.
    ///
    /// Counters are partitioned by tenant. The budget is passed per call; it
    /// comes from the tenant's plan, not from limiter state.
    async fn check_and_increment(
        &self,
        tenant: &TenantId,
        actor: &ActorId,
        endpoint: &Endpoint,
        max_requests: u64,
        window_secs: u64,
    ) -> Result<RateDecision, AdmissionError>;
}
