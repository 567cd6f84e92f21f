//! Periodic maintenance: stale reservation sweep, window cleanup and
//! retention of finalized reservations.
//!
//! None of this is needed for correctness. The sweep is the backstop for
//! callers that never Release; the other two passes bound memory.

use crate::config::AdmissionConfig;
use crate::identity::Actor;
use crate::quota::{ReservationManager, SweepReport};
use crate::rate_limit::FixedWindowLimiter;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info};

/// What one maintenance pass did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct JanitorReport {
    /// Stale reservation sweep.
    pub sweep: SweepReport,
    /// Rate-limit windows removed.
    pub windows_removed: usize,
    /// Finalized reservations purged.
    pub purged: usize,
    /// Steps that failed (logged).
    pub failures: usize,
}

/// Runs maintenance passes over the reservation manager and rate limiter.
#[derive(Debug)]
pub struct Janitor {
    reservations: Arc<ReservationManager>,
    limiter: Arc<FixedWindowLimiter>,
    reservation_ttl: Duration,
    window_retention: Duration,
    finalized_retention: Duration,
    interval: Duration,
}

impl Janitor {
    /// Janitor using the intervals and retentions from `config`.
    pub fn new(
        reservations: Arc<ReservationManager>,
        limiter: Arc<FixedWindowLimiter>,
        config: &AdmissionConfig,
    ) -> Self {
        Self {
            reservations,
            limiter,
            reservation_ttl: config.default_reservation_ttl(),
            window_retention: Duration::from_secs(config.window_retention_secs),
            finalized_retention: Duration::from_secs(config.finalized_retention_secs),
            interval: config.janitor_interval(),
        }
    }

    /// One pass. A failing step is logged and counted; the others still run.
    pub async fn run_once(&self) -> JanitorReport {
        let mut report = JanitorReport::default();

        match self.reservations.sweep(&Actor::System, None, self.reservation_ttl).await {
            Ok(sweep) => report.sweep = sweep,
            Err(e) => {
                error!(error = %e, "janitor sweep failed");
                report.failures += 1;
            }
        }
        match self.limiter.cleanup(self.window_retention).await {
            Ok(removed) => report.windows_removed = removed,
            Err(e) => {
                error!(error = %e, "janitor window cleanup failed");
                report.failures += 1;
            }
        }
        report.purged = self.reservations.purge_finalized(self.finalized_retention).await;

        debug!(?report, "janitor pass complete");
        report
    }

    /// Run passes every interval on the current runtime until shut down.
    /// The first pass runs immediately.
    pub fn spawn(self: Arc<Self>) -> JanitorHandle {
        let (shutdown, mut stop) = watch::channel(false);
        let passes = Arc::new(AtomicU64::new(0));
        let counter = passes.clone();
        let interval = self.interval;

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            info!(interval_secs = interval.as_secs(), "janitor started");
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        self.run_once().await;
                        counter.fetch_add(1, Ordering::Relaxed);
                    }
                    changed = stop.changed() => {
                        if changed.is_err() || *stop.borrow() {
                            break;
                        }
                    }
                }
            }
            info!("janitor stopped");
        });

        JanitorHandle { shutdown, task, passes }
    }
}

/// Handle to a spawned janitor.
#[derive(Debug)]
pub struct JanitorHandle {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
    passes: Arc<AtomicU64>,
}

impl JanitorHandle {
    /// Completed passes so far.
    pub fn passes(&self) -> u64 {
        self.passes.load(Ordering::Relaxed)
    }

    /// Stop the loop and wait for the current pass to finish.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        if let Err(e) = self.task.await {
            error!(error = %e, "janitor task ended abnormally");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::{AuditTrail, MemoryAuditSink};
    use crate::authz::DenyAllGate;
    use crate::clock::ManualClock;
    use crate::identity::{ActorId, Endpoint, ResourceType, TenantId};
    use crate::plan::{PlanCatalog, PlanDocument, TierPlan};
    use crate::rate_limit::RateLimiter;

    fn janitor(clock: &ManualClock) -> (Janitor, TenantId) {
        let tenant = TenantId::new("circle-1").unwrap();
        let plans = PlanCatalog::new(
            PlanDocument::new()
                .tier("free", TierPlan::new().grant("video", 100, None))
                .assign(&tenant, "free"),
        )
        .unwrap();
        let config = AdmissionConfig {
            default_reservation_ttl_secs: 60,
            window_retention_secs: 60,
            finalized_retention_secs: 60,
            ..AdmissionConfig::default()
        };
        let audit = AuditTrail::new(Arc::new(MemoryAuditSink::new()), Arc::new(clock.clone()));
        let manager = ReservationManager::new(
            Arc::new(plans),
            Arc::new(DenyAllGate),
            audit.clone(),
            Arc::new(clock.clone()),
            &config,
        );
        let limiter = FixedWindowLimiter::in_memory(audit, Arc::new(clock.clone()));
        (Janitor::new(Arc::new(manager), Arc::new(limiter), &config), tenant)
    }

    #[tokio::test]
    async fn run_once_sweeps_cleans_and_purges() {
        let clock = ManualClock::starting_at(0);
        let (janitor, tenant) = janitor(&clock);
        let video = ResourceType::new("video").unwrap();
        let alice = Actor::user("alice").unwrap();
        janitor.reservations.reserve(&tenant, &video, &alice, 10).await.unwrap();
        let (actor, upload) = (ActorId::new("alice").unwrap(), Endpoint::new("upload").unwrap());
        janitor.limiter.check_and_increment(&tenant, &actor, &upload, 5, 60).await.unwrap();

        clock.advance(Duration::from_secs(61));
        let first = janitor.run_once().await;
        assert_eq!(first.sweep.expired, 1);
        assert_eq!(first.windows_removed, 1);
        assert_eq!(first.purged, 0, "just expired, still within retention");

        clock.advance(Duration::from_secs(60));
        let second = janitor.run_once().await;
        assert_eq!(second.purged, 1);
        assert_eq!(second.failures, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn spawned_loop_ticks_until_shutdown() {
        let clock = ManualClock::starting_at(0);
        let (janitor, _) = janitor(&clock);
        let handle = Arc::new(janitor).spawn();

        tokio::time::sleep(Duration::from_secs(301)).await;
        let passes = handle.passes();
        assert!(passes >= 2, "expected the immediate pass and one tick, got {passes}");
        handle.shutdown().await;
    }
}
