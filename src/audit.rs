//! Audit trail for admission decisions.
//!
//! Components emit through [`AuditTrail`], never leaving it to callers, so an
//! admitted or denied decision cannot go unrecorded. A record is emitted after
//! the row lock is released; sink failures are logged and counted but do not
//! undo a decision that has already been applied.

use crate::clock::Clock;
use crate::identity::TenantId;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::info;

/// Operation being audited.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    /// Quota reservation attempt.
    Reserve,
    /// Reservation confirmation.
    Confirm,
    /// Reservation release.
    Release,
    /// Stale reservation sweep.
    Sweep,
    /// Fixed-window rate check.
    RateCheck,
    /// Access token validation.
    TokenValidate,
    /// Access token creation.
    TokenIssue,
    /// Access token revocation.
    TokenRevoke,
}

impl AuditAction {
    /// Stable label.
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditAction::Reserve => "reserve",
            AuditAction::Confirm => "confirm",
            AuditAction::Release => "release",
            AuditAction::Sweep => "sweep",
            AuditAction::RateCheck => "rate_check",
            AuditAction::TokenValidate => "token_validate",
            AuditAction::TokenIssue => "token_issue",
            AuditAction::TokenRevoke => "token_revoke",
        }
    }
}

impl fmt::Display for AuditAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of the audited operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", content = "code", rename_all = "snake_case")]
pub enum AuditOutcome {
    /// The operation was admitted / applied.
    Admitted,
    /// An expected denial (quota, rate, lifecycle).
    Denied(String),
    /// A hard failure (contract violation, store error).
    Failed(String),
}

impl AuditOutcome {
    /// Check if the operation was admitted.
    pub fn is_admitted(&self) -> bool {
        matches!(self, AuditOutcome::Admitted)
    }
}

impl fmt::Display for AuditOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AuditOutcome::Admitted => f.write_str("admitted"),
            AuditOutcome::Denied(code) => write!(f, "denied: {code}"),
            AuditOutcome::Failed(code) => write!(f, "failed: {code}"),
        }
    }
}

/// One append-only audit entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditRecord {
    /// Decision time, ms since epoch.
    pub at_millis: u64,
    /// Who acted: `user:<id>`, `system`, or `token:<id>` for bearer tokens.
    pub principal: String,
    /// Tenant the decision applied to, when known.
    pub tenant: Option<TenantId>,
    /// Operation.
    pub action: AuditAction,
    /// Outcome.
    pub outcome: AuditOutcome,
    /// Decision context (amounts, limits, ids).
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

impl AuditRecord {
    /// New record stamped at time zero; [`AuditTrail`] stamps the real time.
    pub fn new(
        action: AuditAction,
        principal: impl fmt::Display,
        tenant: Option<&TenantId>,
        outcome: AuditOutcome,
    ) -> Self {
        Self {
            at_millis: 0,
            principal: principal.to_string(),
            tenant: tenant.cloned(),
            action,
            outcome,
            metadata: Map::new(),
        }
    }

    /// Attach a metadata field.
    pub fn with(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.to_string(), value.into());
        self
    }
}

/// Errors raised by audit sinks.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
#[error("audit sink: {0}")]
pub struct AuditError(pub String);

/// Audit sink interface.
#[async_trait]
pub trait AuditSink: Send + Sync {
    /// Append an audit record.
    async fn record(&self, record: AuditRecord) -> Result<(), AuditError>;
}

/// Simple audit sink that logs via tracing.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingAuditSink;

#[async_trait]
impl AuditSink for TracingAuditSink {
    async fn record(&self, record: AuditRecord) -> Result<(), AuditError> {
        let tenant = record.tenant.as_ref().map(TenantId::as_str).unwrap_or("-");
        let metadata = Value::Object(record.metadata);
        info!(
            target: "turnstile::audit",
            at = record.at_millis,
            principal = %record.principal,
            tenant,
            action = %record.action,
            outcome = %record.outcome,
            %metadata,
            "audit"
        );
        Ok(())
    }
}

/// Bounded in-memory audit sink (tests/diagnostics). Evicts the oldest entry
/// once full.
#[derive(Debug, Clone)]
pub struct MemoryAuditSink {
    records: Arc<Mutex<VecDeque<AuditRecord>>>,
    capacity: usize,
    evicted: Arc<AtomicU64>,
}

impl MemoryAuditSink {
    /// Sink holding up to 10 000 records.
    pub fn new() -> Self {
        Self::with_capacity(10_000)
    }

    /// Sink holding up to `capacity` records (at least one).
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            records: Arc::new(Mutex::new(VecDeque::new())),
            capacity: capacity.max(1),
            evicted: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Retrieve recorded audit records, oldest first.
    pub async fn records(&self) -> Vec<AuditRecord> {
        self.records.lock().await.iter().cloned().collect()
    }

    /// Records for one action.
    pub async fn records_for(&self, action: AuditAction) -> Vec<AuditRecord> {
        self.records.lock().await.iter().filter(|r| r.action == action).cloned().collect()
    }

    /// Number of records evicted due to capacity.
    pub fn evicted(&self) -> u64 {
        self.evicted.load(Ordering::Relaxed)
    }
}

impl Default for MemoryAuditSink {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl AuditSink for MemoryAuditSink {
    async fn record(&self, record: AuditRecord) -> Result<(), AuditError> {
        let mut guard = self.records.lock().await;
        if guard.len() >= self.capacity {
            guard.pop_front();
            self.evicted.fetch_add(1, Ordering::Relaxed);
        }
        guard.push_back(record);
        Ok(())
    }
}

/// Fans each record out to every inner sink. All sinks are attempted; the
/// first error is returned.
#[derive(Clone, Default)]
pub struct MulticastAuditSink {
    sinks: Vec<Arc<dyn AuditSink>>,
}

impl MulticastAuditSink {
    /// Empty fan-out.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a sink.
    pub fn with(mut self, sink: Arc<dyn AuditSink>) -> Self {
        self.sinks.push(sink);
        self
    }
}

#[async_trait]
impl AuditSink for MulticastAuditSink {
    async fn record(&self, record: AuditRecord) -> Result<(), AuditError> {
        let mut first_err = None;
        for sink in &self.sinks {
            if let Err(e) = sink.record(record.clone()).await {
                first_err.get_or_insert(e);
            }
        }
        first_err.map_or(Ok(()), Err)
    }
}

/// Stamps and emits audit records on behalf of the core components.
#[derive(Clone)]
pub struct AuditTrail {
    sink: Arc<dyn AuditSink>,
    clock: Arc<dyn Clock>,
    failures: Arc<AtomicU64>,
}

impl fmt::Debug for AuditTrail {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuditTrail").field("failures", &self.failures()).finish_non_exhaustive()
    }
}

impl AuditTrail {
    /// Trail writing to `sink`, stamping with `clock`.
    pub fn new(sink: Arc<dyn AuditSink>, clock: Arc<dyn Clock>) -> Self {
        Self { sink, clock, failures: Arc::new(AtomicU64::new(0)) }
    }

    /// Emit a record. Sink errors are logged and counted, never returned.
    pub async fn emit(&self, mut record: AuditRecord) {
        record.at_millis = self.clock.now_millis();
        let action = record.action;
        if let Err(e) = self.sink.record(record).await {
            self.failures.fetch_add(1, Ordering::Relaxed);
            tracing::error!(error = %e, %action, "audit sink rejected record");
        }
    }

    /// Number of records the sink failed to accept.
    pub fn failures(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }
}
