use super::secret::{well_formed, SecretHash, TokenSecret};
use super::{TokenDenial, TokenVerdict};
use crate::audit::{AuditAction, AuditOutcome, AuditRecord, AuditTrail};
use crate::authz::{require_role, AuthorizationGate, Role};
use crate::clock::Clock;
use crate::config::TokenPolicy;
use crate::error::AdmissionError;
use crate::identity::{Actor, TenantId, TokenId};
use crate::lock::LockTable;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Stored token record. The secret itself is never kept, only its hash.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccessToken {
    /// Public id, used for revocation and audit.
    pub id: TokenId,
    /// Owning tenant.
    pub tenant: TenantId,
    /// Expiry, ms since epoch; `None` never expires.
    pub expires_at_millis: Option<u64>,
    /// Set once on revocation, never cleared.
    pub revoked_at_millis: Option<u64>,
    /// Accesses in the current window.
    pub access_count: u64,
    /// Anchor of the current window; `None` before the first access.
    pub window_start_millis: Option<u64>,
    /// Feature flags returned on a granted validation.
    pub config: Value,
    /// Issue time, ms since epoch.
    pub created_at_millis: u64,
    /// Administrator (or system) that issued the token.
    pub created_by: Actor,
}

impl AccessToken {
    /// Whether the token is past its expiry at `now`.
    pub fn is_expired(&self, now: u64) -> bool {
        self.expires_at_millis.map_or(false, |at| at <= now)
    }
}

/// A newly issued token. `secret` is the only copy of the bearer string.
#[derive(Debug, Clone)]
pub struct IssuedToken {
    /// Public id.
    pub id: TokenId,
    /// Bearer secret.
    pub secret: TokenSecret,
    /// Expiry, ms since epoch.
    pub expires_at_millis: Option<u64>,
}

/// Result of [`TokenAccessGuard::revoke`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Revocation {
    /// Revoked token.
    pub token_id: TokenId,
    /// When it was (first) revoked.
    pub revoked_at_millis: u64,
    /// `false` if it was already revoked; the original time is kept.
    pub newly_revoked: bool,
}

/// Validates bearer tokens and manages their lifecycle.
pub struct TokenAccessGuard {
    tokens: LockTable<SecretHash, AccessToken>,
    directory: Mutex<HashMap<TokenId, (SecretHash, TenantId)>>,
    gate: Arc<dyn AuthorizationGate>,
    audit: AuditTrail,
    clock: Arc<dyn Clock>,
}

impl fmt::Debug for TokenAccessGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenAccessGuard")
            .field("tokens", &self.tokens.len())
            .finish_non_exhaustive()
    }
}

impl TokenAccessGuard {
    /// Create a guard with `shards` lock shards.
    pub fn new(
        gate: Arc<dyn AuthorizationGate>,
        audit: AuditTrail,
        clock: Arc<dyn Clock>,
        shards: usize,
    ) -> Self {
        Self {
            tokens: LockTable::new(shards),
            directory: Mutex::new(HashMap::new()),
            gate,
            audit,
            clock,
        }
    }

    /// Validate `raw` and count the access against `policy`.
    ///
    /// Every refusal is a [`TokenVerdict::Denied`]; only an unusable policy is
    /// an error. The counter moves even on a denied access, so a client that
    /// keeps hammering stays over budget until the window resets.
    pub async fn validate(
        &self,
        raw: &str,
        policy: TokenPolicy,
    ) -> Result<TokenVerdict, AdmissionError> {
        if let Err(e) = policy.validate() {
            let err = AdmissionError::validation("token_policy", e.to_string());
            let outcome = AuditOutcome::Failed(err.code().into());
            let principal = "token:unknown";
            let record = AuditRecord::new(AuditAction::TokenValidate, principal, None, outcome)
                .with("error", err.to_string());
            self.audit.emit(record).await;
            return Err(err);
        }
        let (verdict, tenant) = self.evaluate(raw, policy).await;

        let principal = match &verdict {
            TokenVerdict::Granted { token_id, .. }
            | TokenVerdict::Denied { token_id: Some(token_id), .. } => format!("token:{token_id}"),
            TokenVerdict::Denied { token_id: None, .. } => "token:unknown".to_string(),
        };
        let record = match &verdict {
            TokenVerdict::Granted { access_count, remaining, .. } => {
                let outcome = AuditOutcome::Admitted;
                AuditRecord::new(AuditAction::TokenValidate, principal, tenant.as_ref(), outcome)
                    .with("access_count", *access_count)
                    .with("remaining", *remaining)
            }
            TokenVerdict::Denied { reason, .. } => {
                let outcome = AuditOutcome::Denied(reason.code().into());
                AuditRecord::new(AuditAction::TokenValidate, principal, tenant.as_ref(), outcome)
                    .with("message", reason.to_string())
            }
        };
        self.audit.emit(record).await;
        Ok(verdict)
    }

    async fn evaluate(&self, raw: &str, policy: TokenPolicy) -> (TokenVerdict, Option<TenantId>) {
        let denied = |reason, token_id| TokenVerdict::Denied { reason, token_id };
        if !well_formed(raw) {
            return (denied(TokenDenial::Malformed, None), None);
        }
        let Some(mut token) = self.tokens.lock(&SecretHash::of(raw)).await else {
            return (denied(TokenDenial::NotFound, None), None);
        };
        let now = self.clock.now_millis();
        let id = token.id;
        let tenant = token.tenant.clone();

        if let Some(revoked_at_millis) = token.revoked_at_millis {
            return (denied(TokenDenial::Revoked { revoked_at_millis }, Some(id)), Some(tenant));
        }
        if let Some(expired_at_millis) = token.expires_at_millis.filter(|at| *at <= now) {
            return (denied(TokenDenial::Expired { expired_at_millis }, Some(id)), Some(tenant));
        }

        let window = u64::try_from(policy.window().as_millis()).unwrap_or(u64::MAX);
        let current_start = token.window_start_millis;
        let anchor = match current_start {
            Some(start) if now.saturating_sub(start) <= window => {
                token.access_count = token.access_count.saturating_add(1);
                start
            }
            _ => {
                token.access_count = 1;
                token.window_start_millis = Some(now);
                now
            }
        };
        // Decide on the count written above, under the same lock hold.
        let count = token.access_count;
        if count > policy.rate_threshold {
            let threshold = policy.rate_threshold;
            warn!(token = %id, count, threshold, "token access rate exceeded");
            let resets_at_millis = anchor.saturating_add(window);
            let reason = TokenDenial::RateLimited { count, threshold, resets_at_millis };
            return (denied(reason, Some(id)), Some(tenant));
        }
        let config = token.config.clone();
        drop(token);

        debug!(token = %id, count, "token access granted");
        let verdict = TokenVerdict::Granted {
            token_id: id,
            tenant: tenant.clone(),
            config,
            access_count: count,
            remaining: policy.rate_threshold - count,
        };
        (verdict, Some(tenant))
    }

    /// Tenant of the token behind `raw`, if any. The tenant of a token never
    /// changes, so callers may use this to pick the tenant's token policy.
    pub async fn tenant_of(&self, raw: &str) -> Option<TenantId> {
        if !well_formed(raw) {
            return None;
        }
        let token = self.tokens.lock(&SecretHash::of(raw)).await?;
        Some(token.tenant.clone())
    }

    /// Issue a token for `tenant`. Requires [`Role::Admin`] or the system
    /// actor.
    pub async fn issue(
        &self,
        actor: &Actor,
        tenant: &TenantId,
        expires_in: Option<Duration>,
        config: Value,
    ) -> Result<IssuedToken, AdmissionError> {
        let result = self.issue_inner(actor, tenant, expires_in, config).await;
        let base =
            |outcome| AuditRecord::new(AuditAction::TokenIssue, actor, Some(tenant), outcome);
        let record = match &result {
            Ok(issued) => {
                info!(%tenant, token = %issued.id, "access token issued");
                base(AuditOutcome::Admitted)
                    .with("token_id", issued.id.to_string())
                    .with("expires_at", issued.expires_at_millis)
            }
            Err(e) => base(AuditOutcome::Failed(e.code().into())).with("error", e.to_string()),
        };
        self.audit.emit(record).await;
        result
    }

    async fn issue_inner(
        &self,
        actor: &Actor,
        tenant: &TenantId,
        expires_in: Option<Duration>,
        config: Value,
    ) -> Result<IssuedToken, AdmissionError> {
        if expires_in == Some(Duration::ZERO) {
            return Err(AdmissionError::validation("expires_in", "must be > 0 when set"));
        }
        require_role(self.gate.as_ref(), tenant, actor, Role::Admin).await?;

        let now = self.clock.now_millis();
        let expires_at_millis = expires_in
            .map(|d| now.saturating_add(u64::try_from(d.as_millis()).unwrap_or(u64::MAX)));
        let secret = TokenSecret::generate();
        let hash = secret.hash();
        let id = TokenId::new();
        let token = AccessToken {
            id,
            tenant: tenant.clone(),
            expires_at_millis,
            revoked_at_millis: None,
            access_count: 0,
            window_start_millis: None,
            config,
            created_at_millis: now,
            created_by: actor.clone(),
        };
        if !self.tokens.insert_new(hash, token) {
            return Err(AdmissionError::Store("token secret collision".into()));
        }
        self.directory
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, (hash, tenant.clone()));
        Ok(IssuedToken { id, secret, expires_at_millis })
    }

    /// Revoke a token. One-way: revoking again keeps the first time.
    /// Requires [`Role::Admin`] or the system actor.
    pub async fn revoke(
        &self,
        actor: &Actor,
        tenant: &TenantId,
        id: TokenId,
    ) -> Result<Revocation, AdmissionError> {
        let result = self.revoke_inner(actor, tenant, id).await;
        let base = |outcome| {
            AuditRecord::new(AuditAction::TokenRevoke, actor, Some(tenant), outcome)
                .with("token_id", id.to_string())
        };
        let record = match &result {
            Ok(r) => {
                if r.newly_revoked {
                    info!(%tenant, token = %id, "access token revoked");
                }
                base(AuditOutcome::Admitted).with("newly_revoked", r.newly_revoked)
            }
            Err(e) => base(AuditOutcome::Failed(e.code().into())).with("error", e.to_string()),
        };
        self.audit.emit(record).await;
        result
    }

    async fn revoke_inner(
        &self,
        actor: &Actor,
        tenant: &TenantId,
        id: TokenId,
    ) -> Result<Revocation, AdmissionError> {
        require_role(self.gate.as_ref(), tenant, actor, Role::Admin).await?;
        let hash = self.hash_in_tenant(tenant, id)?;
        let mut token = self
            .tokens
            .lock(&hash)
            .await
            .ok_or_else(|| AdmissionError::not_found(format!("token {id}")))?;
        match token.revoked_at_millis {
            Some(at) => {
                Ok(Revocation { token_id: id, revoked_at_millis: at, newly_revoked: false })
            }
            None => {
                let now = self.clock.now_millis();
                token.revoked_at_millis = Some(now);
                Ok(Revocation { token_id: id, revoked_at_millis: now, newly_revoked: true })
            }
        }
    }

    /// Snapshot of a token record.
    pub async fn get(&self, tenant: &TenantId, id: TokenId) -> Result<AccessToken, AdmissionError> {
        let hash = self.hash_in_tenant(tenant, id)?;
        let token = self
            .tokens
            .lock(&hash)
            .await
            .ok_or_else(|| AdmissionError::not_found(format!("token {id}")))?;
        Ok(token.clone())
    }

    fn hash_in_tenant(&self, tenant: &TenantId, id: TokenId) -> Result<SecretHash, AdmissionError> {
        let directory = self.directory.lock().unwrap_or_else(PoisonError::into_inner);
        match directory.get(&id) {
            Some((hash, owner)) if owner == tenant => Ok(*hash),
            _ => Err(AdmissionError::not_found(format!("token {id}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::MemoryAuditSink;
    use crate::authz::StaticAuthorizationGate;
    use crate::clock::ManualClock;
    use crate::identity::ActorId;
    use serde_json::json;

    struct Fixture {
        guard: TokenAccessGuard,
        clock: ManualClock,
        audit: MemoryAuditSink,
        tenant: TenantId,
    }

    fn fixture() -> Fixture {
        let tenant = TenantId::new("circle-1").unwrap();
        let gate = StaticAuthorizationGate::new()
            .with_role(&tenant, &ActorId::new("admin").unwrap(), Role::Admin)
            .with_role(&tenant, &ActorId::new("viewer").unwrap(), Role::Viewer);
        let clock = ManualClock::starting_at(10_000_000);
        let audit = MemoryAuditSink::new();
        let guard = TokenAccessGuard::new(
            Arc::new(gate),
            AuditTrail::new(Arc::new(audit.clone()), Arc::new(clock.clone())),
            Arc::new(clock.clone()),
            8,
        );
        Fixture { guard, clock, audit, tenant }
    }

    fn policy(threshold: u64) -> TokenPolicy {
        TokenPolicy::new(threshold, 3600).unwrap()
    }

    #[tokio::test]
    async fn issue_requires_admin() {
        let f = fixture();
        let viewer = Actor::user("viewer").unwrap();
        let err = f.guard.issue(&viewer, &f.tenant, None, json!({})).await.unwrap_err();
        assert!(err.is_unauthorized());
        let admin = Actor::user("admin").unwrap();
        assert!(f.guard.issue(&admin, &f.tenant, None, json!({})).await.is_ok());
        assert!(f.guard.issue(&Actor::System, &f.tenant, None, json!({})).await.is_ok());
    }

    #[tokio::test]
    async fn granted_validation_returns_config() {
        let f = fixture();
        let issued = f
            .guard
            .issue(
                &Actor::System,
                &f.tenant,
                Some(Duration::from_secs(60)),
                json!({"download": false}),
            )
            .await
            .unwrap();
        let verdict = f.guard.validate(issued.secret.expose(), policy(5)).await.unwrap();
        match verdict {
            TokenVerdict::Granted { token_id, tenant, config, access_count, remaining } => {
                assert_eq!(token_id, issued.id);
                assert_eq!(tenant, f.tenant);
                assert_eq!(config, json!({"download": false}));
                assert_eq!((access_count, remaining), (1, 4));
            }
            other => panic!("expected grant, got {other:?}"),
        }
        let record = f.audit.records_for(AuditAction::TokenValidate).await.remove(0);
        assert_eq!(record.principal, format!("token:{}", issued.id));
    }

    #[tokio::test]
    async fn malformed_and_unknown_tokens_are_denied() {
        let f = fixture();
        let malformed = f.guard.validate("not-a-token", policy(5)).await.unwrap();
        assert_eq!(malformed.denial(), Some(&TokenDenial::Malformed));
        let unknown = TokenSecret::generate();
        let verdict = f.guard.validate(unknown.expose(), policy(5)).await.unwrap();
        assert_eq!(verdict.denial(), Some(&TokenDenial::NotFound));
    }

    #[tokio::test]
    async fn expiry_is_inclusive() {
        let f = fixture();
        let ttl = Some(Duration::from_secs(60));
        let issued = f.guard.issue(&Actor::System, &f.tenant, ttl, json!({})).await.unwrap();
        f.clock.advance(Duration::from_secs(60));
        let verdict = f.guard.validate(issued.secret.expose(), policy(5)).await.unwrap();
        assert_eq!(verdict.denial().map(TokenDenial::code), Some("expired"));
    }

    #[tokio::test]
    async fn denied_accesses_still_count() {
        let f = fixture();
        let issued = f.guard.issue(&Actor::System, &f.tenant, None, json!({})).await.unwrap();
        for _ in 0..2 {
            let verdict = f.guard.validate(issued.secret.expose(), policy(2)).await.unwrap();
            assert!(verdict.is_granted());
        }
        let third = f.guard.validate(issued.secret.expose(), policy(2)).await.unwrap();
        assert!(matches!(
            third.denial(),
            Some(TokenDenial::RateLimited { count: 3, threshold: 2, .. })
        ));
        assert_eq!(f.guard.get(&f.tenant, issued.id).await.unwrap().access_count, 3);
    }

    #[tokio::test]
    async fn revoke_is_one_way_and_tenant_scoped() {
        let f = fixture();
        let issued = f.guard.issue(&Actor::System, &f.tenant, None, json!({})).await.unwrap();
        let other = TenantId::new("circle-2").unwrap();
        let err = f.guard.revoke(&Actor::System, &other, issued.id).await.unwrap_err();
        assert!(err.is_not_found());

        let first = f.guard.revoke(&Actor::System, &f.tenant, issued.id).await.unwrap();
        assert!(first.newly_revoked);
        f.clock.advance(Duration::from_secs(5));
        let again = f.guard.revoke(&Actor::System, &f.tenant, issued.id).await.unwrap();
        assert!(!again.newly_revoked);
        assert_eq!(again.revoked_at_millis, first.revoked_at_millis);
    }

    #[tokio::test]
    async fn zero_threshold_policy_is_an_audited_error() {
        let f = fixture();
        let bad = TokenPolicy { rate_threshold: 0, window_secs: 3600 };
        assert!(f.guard.validate("tsk_x", bad).await.unwrap_err().is_validation());

        let records = f.audit.records_for(AuditAction::TokenValidate).await;
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].outcome, AuditOutcome::Failed("validation_error".into()));
        assert_eq!(records[0].principal, "token:unknown");
        assert!(records[0].tenant.is_none());
    }
}
