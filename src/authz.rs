//! Authorization gate consulted before admission.
//!
//! Upstream business logic calls the gate before invoking the core. The core
//! itself only consults it for administrative operations (sweeping a tenant,
//! issuing or revoking access tokens).

use crate::error::AdmissionError;
use crate::identity::{Actor, ActorId, TenantId};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

/// Membership role inside a tenant, totally ordered by privilege.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    /// Not a member.
    None,
    /// Read-only member.
    Viewer,
    /// May create content.
    Contributor,
    /// May manage the tenant.
    Admin,
    /// Owns the tenant.
    Owner,
}

/// Pluggable membership/role lookup.
#[async_trait]
pub trait AuthorizationGate: Send + Sync {
    /// Unique name of this gate, used in logs.
    fn name(&self) -> &'static str;

    /// Role of `actor` in `tenant`; [`Role::None`] if not a member.
    async fn role_level(&self, tenant: &TenantId, actor: &ActorId) -> Result<Role, AdmissionError>;

    /// Whether `actor` belongs to `tenant` at all.
    async fn is_member(&self, tenant: &TenantId, actor: &ActorId) -> Result<bool, AdmissionError> {
        Ok(self.role_level(tenant, actor).await? > Role::None)
    }

    /// Whether `actor` holds at least `min` in `tenant`.
    async fn has_minimum_role(
        &self,
        tenant: &TenantId,
        actor: &ActorId,
        min: Role,
    ) -> Result<bool, AdmissionError> {
        Ok(self.role_level(tenant, actor).await? >= min)
    }
}

/// Fail with `Unauthorized` unless `actor` is the system actor or holds
/// `min` in `tenant`.
pub async fn require_role(
    gate: &dyn AuthorizationGate,
    tenant: &TenantId,
    actor: &Actor,
    min: Role,
) -> Result<(), AdmissionError> {
    let id = match actor {
        Actor::System => return Ok(()),
        Actor::User(id) => id,
    };
    if gate.has_minimum_role(tenant, id, min).await? {
        Ok(())
    } else {
        tracing::debug!(gate = gate.name(), %tenant, %actor, ?min, "role check failed");
        Err(AdmissionError::unauthorized(actor, format!("requires {min:?} in tenant {tenant}")))
    }
}

/// In-memory membership table (tests, single-process deployments).
#[derive(Debug, Default)]
pub struct StaticAuthorizationGate {
    roles: RwLock<HashMap<(TenantId, ActorId), Role>>,
}

impl StaticAuthorizationGate {
    /// Empty table: nobody is a member of anything.
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style grant.
    pub fn with_role(self, tenant: &TenantId, actor: &ActorId, role: Role) -> Self {
        self.set_role(tenant, actor, role);
        self
    }

    /// Set (or with [`Role::None`], clear) a membership.
    pub fn set_role(&self, tenant: &TenantId, actor: &ActorId, role: Role) {
        let mut roles = self.roles.write().unwrap_or_else(PoisonError::into_inner);
        let key = (tenant.clone(), actor.clone());
        if role == Role::None {
            roles.remove(&key);
        } else {
            roles.insert(key, role);
        }
    }
}

#[async_trait]
impl AuthorizationGate for StaticAuthorizationGate {
    fn name(&self) -> &'static str {
        "static"
    }

    async fn role_level(&self, tenant: &TenantId, actor: &ActorId) -> Result<Role, AdmissionError> {
        let roles = self.roles.read().unwrap_or_else(PoisonError::into_inner);
        Ok(roles.get(&(tenant.clone(), actor.clone())).copied().unwrap_or(Role::None))
    }
}

/// Gate that refuses every non-system actor. Used when no gate is wired.
#[derive(Debug, Default, Clone, Copy)]
pub struct DenyAllGate;

#[async_trait]
impl AuthorizationGate for DenyAllGate {
    fn name(&self) -> &'static str {
        "deny_all"
    }

    async fn role_level(
        &self,
        _tenant: &TenantId,
        _actor: &ActorId,
    ) -> Result<Role, AdmissionError> {
        Ok(Role::None)
    }
}
