//! Bearer access tokens with lifecycle checks and a sliding access window.
//!
//! A token grants a holder outside the tenant (a share link, an emergency
//! card) access to one resource and carries the config payload needed to
//! serve it. Validation checks, in order and short-circuiting: shape,
//! existence, revocation, expiry, then the access budget. The budget check is
//! one locked read-modify-write on the token row.

use crate::identity::{TenantId, TokenId};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

pub mod guard;
pub mod secret;

pub use guard::{AccessToken, IssuedToken, Revocation, TokenAccessGuard};
pub use secret::{TokenSecret, TOKEN_LEN, TOKEN_PREFIX};

/// Why a token was refused.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum TokenDenial {
    /// Wrong prefix, length or alphabet; no lookup was made.
    Malformed,
    /// No token with this secret.
    NotFound,
    /// Revoked; wins over every other state.
    Revoked {
        /// Revocation time, ms since epoch.
        revoked_at_millis: u64,
    },
    /// Past its expiry.
    Expired {
        /// Expiry time, ms since epoch.
        expired_at_millis: u64,
    },
    /// Over its access budget for the current window.
    RateLimited {
        /// Post-increment access count.
        count: u64,
        /// Accesses allowed per window.
        threshold: u64,
        /// When the window can next reset, ms since epoch.
        resets_at_millis: u64,
    },
}

impl TokenDenial {
    /// Stable reason code.
    pub fn code(&self) -> &'static str {
        match self {
            TokenDenial::Malformed => "malformed_token",
            TokenDenial::NotFound => "token_not_found",
            TokenDenial::Revoked { .. } => "revoked",
            TokenDenial::Expired { .. } => "expired",
            TokenDenial::RateLimited { .. } => "rate_limited",
        }
    }
}

impl fmt::Display for TokenDenial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TokenDenial::Malformed => f.write_str("token is malformed"),
            TokenDenial::NotFound => f.write_str("token not recognized"),
            TokenDenial::Revoked { .. } => f.write_str("token has been revoked"),
            TokenDenial::Expired { .. } => f.write_str("token has expired"),
            TokenDenial::RateLimited { count, threshold, .. } => {
                write!(f, "{} of {threshold} accesses used this window", count.min(threshold))
            }
        }
    }
}

/// Result of [`TokenAccessGuard::validate`].
#[derive(Debug, Clone, PartialEq)]
pub enum TokenVerdict {
    /// Access granted.
    Granted {
        /// Token that was used.
        token_id: TokenId,
        /// Tenant the token belongs to.
        tenant: TenantId,
        /// Feature flags for the granted resource.
        config: Value,
        /// Accesses counted in the current window, this one included.
        access_count: u64,
        /// Accesses left in the current window.
        remaining: u64,
    },
    /// Access refused.
    Denied {
        /// Why.
        reason: TokenDenial,
        /// Token id, once the secret has been matched.
        token_id: Option<TokenId>,
    },
}

impl TokenVerdict {
    /// Helper to check if granted.
    pub fn is_granted(&self) -> bool {
        matches!(self, TokenVerdict::Granted { .. })
    }

    /// Denied because the token is malformed or unknown.
    pub fn is_unrecognized(&self) -> bool {
        matches!(self.denial(), Some(TokenDenial::Malformed | TokenDenial::NotFound))
    }

    /// The denial reason, if any.
    pub fn denial(&self) -> Option<&TokenDenial> {
        match self {
            TokenVerdict::Granted { .. } => None,
            TokenVerdict::Denied { reason, .. } => Some(reason),
        }
    }

    /// The config payload, if granted.
    pub fn config(&self) -> Option<&Value> {
        match self {
            TokenVerdict::Granted { config, .. } => Some(config),
            TokenVerdict::Denied { .. } => None,
        }
    }
}
