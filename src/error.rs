//! Error types for the admission core.
//!
//! Expected denials (quota exhausted, rate limited, feature locked, token
//! expired/revoked) are *not* errors; they come back as the `Denied` arm of the
//! operation's result enum. [`AdmissionError`] is reserved for contract
//! violations and infrastructure failures that should abort the caller's
//! enclosing transaction.

use crate::config::ConfigError;
use crate::identity::{Actor, ReservationId};
use crate::quota::ReservationStatus;
use crate::rate_limit::RateDenial;

/// Hard failures returned by core operations.
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
#[non_exhaustive]
pub enum AdmissionError {
    /// Malformed argument (non-positive amount, bad id, zero window).
    #[error("invalid {field}: {reason}")]
    Validation {
        /// Argument that failed validation.
        field: &'static str,
        /// Human-readable reason.
        reason: String,
    },
    /// Unknown tenant/resource pair, reservation, or token.
    #[error("{what} not found")]
    NotFound {
        /// Description of the missing entity.
        what: String,
    },
    /// Confirm/Release against a reservation that already left PENDING.
    #[error("reservation {reservation} already finalized ({status})")]
    AlreadyFinalized {
        /// Reservation that was targeted.
        reservation: ReservationId,
        /// The terminal status it is in.
        status: ReservationStatus,
    },
    /// Actor mismatch or missing privilege for an administrative operation.
    #[error("unauthorized {actor}: {reason}")]
    Unauthorized {
        /// The actor that attempted the operation.
        actor: Actor,
        /// Why the attempt was refused.
        reason: String,
    },
    /// Backing store failed (e.g. an external window counter backend).
    #[error("store: {0}")]
    Store(String),
    /// Configuration could not be loaded or validated.
    #[error("config: {0}")]
    Config(#[from] ConfigError),
}

impl AdmissionError {
    pub(crate) fn validation(field: &'static str, reason: impl Into<String>) -> Self {
        Self::Validation { field, reason: reason.into() }
    }

    pub(crate) fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound { what: what.into() }
    }

    pub(crate) fn unauthorized(actor: &Actor, reason: impl Into<String>) -> Self {
        Self::Unauthorized { actor: actor.clone(), reason: reason.into() }
    }

    /// Check if this error is an argument validation failure.
    pub fn is_validation(&self) -> bool {
        matches!(self, Self::Validation { .. })
    }

    /// Check if this error reports a missing entity.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    /// Check if this error is a double finalization.
    pub fn is_already_finalized(&self) -> bool {
        matches!(self, Self::AlreadyFinalized { .. })
    }

    /// Check if this error is an authorization failure.
    pub fn is_unauthorized(&self) -> bool {
        matches!(self, Self::Unauthorized { .. })
    }

    /// Stable machine-readable code, used in audit records.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Validation { .. } => "validation_error",
            Self::NotFound { .. } => "not_found",
            Self::AlreadyFinalized { .. } => "already_finalized",
            Self::Unauthorized { .. } => "unauthorized",
            Self::Store(_) => "store_error",
            Self::Config(_) => "config_error",
        }
    }
}

/// Error produced by [`RateLimitService`](crate::rate_limit::RateLimitService).
#[derive(Debug, Clone)]
pub enum GuardError<E> {
    /// The request was over its window budget.
    RateLimited(RateDenial),
    /// The limiter itself failed (bad policy, store outage).
    Admission(AdmissionError),
    /// The wrapped service failed.
    Inner(E),
}

impl<E: std::fmt::Display> std::fmt::Display for GuardError<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::RateLimited(denial) => write!(f, "rate limited: {}", denial),
            Self::Admission(e) => write!(f, "admission: {}", e),
            Self::Inner(e) => write!(f, "{}", e),
        }
    }
}

impl<E: std::error::Error + 'static> std::error::Error for GuardError<E> {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Admission(e) => Some(e),
            Self::Inner(e) => Some(e),
            Self::RateLimited(_) => None,
        }
    }
}

impl<E> GuardError<E> {
    /// Check if the request was rejected by the window counter.
    pub fn is_rate_limited(&self) -> bool {
        matches!(self, Self::RateLimited(_))
    }

    /// Get the inner error if this is an Inner variant.
    pub fn into_inner(self) -> Option<E> {
        match self {
            Self::Inner(e) => Some(e),
            _ => None,
        }
    }

    /// Access the denial details if rate limited.
    pub fn denial(&self) -> Option<&RateDenial> {
        match self {
            Self::RateLimited(d) => Some(d),
            _ => None,
        }
    }
}
