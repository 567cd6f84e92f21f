//! Tenant plans: which resources a tier may use, with what limits.
//!
//! The catalog is the "external configuration store" seen by the core. It is
//! read on every Reserve (outside any row lock) and may be swapped at runtime
//! when an operator publishes new tiers; readers never block on a swap.

use crate::config::{ConfigError, TokenPolicy};
use crate::identity::{Endpoint, ResourceType, TenantId};
use arc_swap::ArcSwap;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

/// What a tier grants for one resource type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "access", rename_all = "snake_case")]
pub enum ResourceAccess {
    /// Metered access up to `limit` units.
    Granted {
        /// Ledger limit.
        limit: u64,
        /// Per-resource reservation TTL; falls back to the core default.
        #[serde(default)]
        reservation_ttl_secs: Option<u64>,
    },
    /// The tier does not include this resource at all.
    Locked,
}

/// Fixed-window budget for one endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointPolicy {
    /// Requests permitted per window.
    pub max_requests: u64,
    /// Window granularity in seconds.
    pub window_secs: u64,
}

impl EndpointPolicy {
    /// Create a policy.
    pub const fn new(max_requests: u64, window_secs: u64) -> Self {
        Self { max_requests, window_secs }
    }

    /// Window as a `Duration`.
    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }
}

/// Limits for one tier.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TierPlan {
    /// Resource grants keyed by resource type.
    #[serde(default)]
    pub resources: HashMap<String, ResourceAccess>,
    /// Endpoint budgets keyed by endpoint name.
    #[serde(default)]
    pub endpoints: HashMap<String, EndpointPolicy>,
    /// Token throttle override for the tier.
    #[serde(default)]
    pub token: Option<TokenPolicy>,
}

impl TierPlan {
    /// Empty tier.
    pub fn new() -> Self {
        Self::default()
    }

    /// Grant `resource` up to `limit`.
    pub fn grant(mut self, resource: &str, limit: u64, reservation_ttl_secs: Option<u64>) -> Self {
        self.resources
            .insert(resource.to_string(), ResourceAccess::Granted { limit, reservation_ttl_secs });
        self
    }

    /// Lock `resource` for this tier.
    pub fn lock(mut self, resource: &str) -> Self {
        self.resources.insert(resource.to_string(), ResourceAccess::Locked);
        self
    }

    /// Budget `endpoint`.
    pub fn endpoint(mut self, endpoint: &str, policy: EndpointPolicy) -> Self {
        self.endpoints.insert(endpoint.to_string(), policy);
        self
    }

    /// Override the token throttle.
    pub fn token(mut self, policy: TokenPolicy) -> Self {
        self.token = Some(policy);
        self
    }
}

/// The whole plan document: tiers plus tenant -> tier assignments.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PlanDocument {
    /// Tiers by name.
    #[serde(default)]
    pub tiers: HashMap<String, TierPlan>,
    /// Tenant -> tier name.
    #[serde(default)]
    pub tenants: HashMap<String, String>,
}

impl PlanDocument {
    /// Empty document.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace a tier.
    pub fn tier(mut self, name: &str, plan: TierPlan) -> Self {
        self.tiers.insert(name.to_string(), plan);
        self
    }

    /// Assign `tenant` to `tier`.
    pub fn assign(mut self, tenant: &TenantId, tier: &str) -> Self {
        self.tenants.insert(tenant.as_str().to_string(), tier.to_string());
        self
    }

    /// Check tenant assignments and endpoint budgets.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (tenant, tier) in &self.tenants {
            TenantId::new(tenant.as_str()).map_err(|e| ConfigError::Invalid {
                field: "tenants",
                reason: e.to_string(),
            })?;
            if !self.tiers.contains_key(tier) {
                return Err(ConfigError::Invalid {
                    field: "tenants",
                    reason: format!("tenant '{tenant}' references unknown tier '{tier}'"),
                });
            }
        }
        for (name, tier) in &self.tiers {
            for (endpoint, policy) in &tier.endpoints {
                if policy.max_requests == 0 || policy.window_secs == 0 {
                    return Err(ConfigError::Invalid {
                        field: "endpoints",
                        reason: format!(
                            "tier '{name}' endpoint '{endpoint}' needs non-zero budget and window"
                        ),
                    });
                }
            }
            for (resource, access) in &tier.resources {
                if let ResourceAccess::Granted { reservation_ttl_secs: Some(0), .. } = access {
                    return Err(ConfigError::Invalid {
                        field: "resources",
                        reason: format!(
                            "tier '{name}' resource '{resource}' has a zero reservation ttl"
                        ),
                    });
                }
            }
            if let Some(token) = &tier.token {
                token.validate()?;
            }
        }
        Ok(())
    }

    fn tier_for(&self, tenant: &TenantId) -> Option<&TierPlan> {
        self.tenants.get(tenant.as_str()).and_then(|tier| self.tiers.get(tier))
    }
}

/// Where the core looks up per-tenant limits.
pub trait PlanSource: Send + Sync + std::fmt::Debug {
    /// Grant for a tenant/resource pair; `None` if the pair is unknown.
    fn resource_access(&self, tenant: &TenantId, resource: &ResourceType) -> Option<ResourceAccess>;

    /// Budget for a tenant/endpoint pair; `None` if not budgeted.
    fn endpoint_policy(&self, tenant: &TenantId, endpoint: &Endpoint) -> Option<EndpointPolicy>;

    /// Token throttle for a tenant; `None` means use the core default.
    fn token_policy(&self, _tenant: &TenantId) -> Option<TokenPolicy> {
        None
    }
}

/// Live, swappable plan catalog. Clones share the same document.
#[derive(Debug, Clone)]
pub struct PlanCatalog {
    inner: Arc<ArcSwap<PlanDocument>>,
}

impl PlanCatalog {
    /// Wrap a validated document.
    pub fn new(doc: PlanDocument) -> Result<Self, ConfigError> {
        doc.validate()?;
        Ok(Self { inner: Arc::new(ArcSwap::from_pointee(doc)) })
    }

    /// Parse and validate a JSON plan document.
    pub fn from_json_str(raw: &str) -> Result<Self, ConfigError> {
        let doc: PlanDocument =
            serde_json::from_str(raw).map_err(|e| ConfigError::Parse(e.to_string()))?;
        Self::new(doc)
    }

    /// Publish a new document. In-flight lookups finish against the old one.
    pub fn replace(&self, doc: PlanDocument) -> Result<(), ConfigError> {
        doc.validate()?;
        self.inner.store(Arc::new(doc));
        tracing::info!(tiers = self.inner.load().tiers.len(), "plan catalog replaced");
        Ok(())
    }

    /// Snapshot the current document.
    pub fn snapshot(&self) -> Arc<PlanDocument> {
        self.inner.load_full()
    }
}

impl PlanSource for PlanCatalog {
    fn resource_access(
        &self,
        tenant: &TenantId,
        resource: &ResourceType,
    ) -> Option<ResourceAccess> {
        let doc = self.inner.load();
        doc.tier_for(tenant)?.resources.get(resource.as_str()).copied()
    }

    fn endpoint_policy(&self, tenant: &TenantId, endpoint: &Endpoint) -> Option<EndpointPolicy> {
        let doc = self.inner.load();
        doc.tier_for(tenant)?.endpoints.get(endpoint.as_str()).copied()
    }

    fn token_policy(&self, tenant: &TenantId) -> Option<TokenPolicy> {
        let doc = self.inner.load();
        doc.tier_for(tenant)?.token
    }
}
