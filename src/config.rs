//! Core configuration.
//!
//! Per-tenant limits live in the [`PlanCatalog`](crate::plan::PlanCatalog);
//! this module holds the deployment-wide knobs: shard counts, TTL defaults,
//! retention windows and the default token throttle.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Errors produced when loading or validating configuration.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// The document could not be parsed.
    #[error("parse error: {0}")]
    Parse(String),
    /// A field was out of range.
    #[error("{field} {reason}")]
    Invalid {
        /// Offending field.
        field: &'static str,
        /// What was wrong with it.
        reason: String,
    },
}

impl ConfigError {
    fn must_be_positive(field: &'static str) -> Self {
        ConfigError::Invalid { field, reason: "must be > 0".into() }
    }
}

/// Sliding-window throttle applied to access tokens.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenPolicy {
    /// Accesses permitted per window.
    pub rate_threshold: u64,
    /// Window length counted from the first access of the window.
    pub window_secs: u64,
}

impl TokenPolicy {
    /// Create a validated policy.
    pub fn new(rate_threshold: u64, window_secs: u64) -> Result<Self, ConfigError> {
        let policy = Self { rate_threshold, window_secs };
        policy.validate()?;
        Ok(policy)
    }

    /// Check both values are non-zero.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.rate_threshold == 0 {
            return Err(ConfigError::must_be_positive("token.rate_threshold"));
        }
        if self.window_secs == 0 {
            return Err(ConfigError::must_be_positive("token.window_secs"));
        }
        Ok(())
    }

    /// Window as a `Duration`.
    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }
}

impl Default for TokenPolicy {
    fn default() -> Self {
        Self { rate_threshold: 100, window_secs: 3_600 }
    }
}

/// Deployment-wide admission settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AdmissionConfig {
    /// Shards in each lock table.
    pub lock_shards: usize,
    /// Expire this ledger's stale reservations before evaluating a Reserve.
    pub sweep_on_reserve: bool,
    /// Reservation TTL when the plan does not set one.
    pub default_reservation_ttl_secs: u64,
    /// How long CONFIRMED/RELEASED/EXPIRED records are kept.
    pub finalized_retention_secs: u64,
    /// How long rate-limit window rows are kept.
    pub window_retention_secs: u64,
    /// Janitor pass interval.
    pub janitor_interval_secs: u64,
    /// Default token throttle.
    pub token: TokenPolicy,
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            lock_shards: 64,
            sweep_on_reserve: true,
            default_reservation_ttl_secs: 3_600,
            finalized_retention_secs: 86_400,
            window_retention_secs: 86_400,
            janitor_interval_secs: 300,
            token: TokenPolicy::default(),
        }
    }
}

impl AdmissionConfig {
    /// Parse a JSON document and validate it. Missing fields take defaults.
    pub fn from_json_str(raw: &str) -> Result<Self, ConfigError> {
        let cfg: Self = serde_json::from_str(raw).map_err(|e| ConfigError::Parse(e.to_string()))?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Check ranges.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.lock_shards == 0 {
            return Err(ConfigError::must_be_positive("lock_shards"));
        }
        if self.default_reservation_ttl_secs == 0 {
            return Err(ConfigError::must_be_positive("default_reservation_ttl_secs"));
        }
        if self.janitor_interval_secs == 0 {
            return Err(ConfigError::must_be_positive("janitor_interval_secs"));
        }
        self.token.validate()
    }

    /// Default reservation TTL as a `Duration`.
    pub fn default_reservation_ttl(&self) -> Duration {
        Duration::from_secs(self.default_reservation_ttl_secs)
    }

    /// Janitor interval as a `Duration`.
    pub fn janitor_interval(&self) -> Duration {
        Duration::from_secs(self.janitor_interval_secs)
    }
}
