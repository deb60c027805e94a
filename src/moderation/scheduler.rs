//! Background expiry sweeps and store health checks

use crate::SCHEDULER_TARGET;
use crate::moderation::{
    AUTO_RELEASE_REASON, AuditEntry, AuthorizationCache, BackingStore, EligibilityEnforcer,
    ModerationAction, ModerationService, Notifier, Operator, RateLimiter, RetryPolicy, Sanction,
    SanctionKind, StoreError,
};
use chrono::Utc;
use dashmap::DashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::{self, Receiver, Sender};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

/// Requests the scheduler task accepts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerRequest {
    SweepNow,
    HealthCheck,
    /// Stop the task after the current tick
    Shutdown,
}

/// Cadences and thresholds for the background task
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchedulerSettings {
    pub expiry_every: Duration,
    pub health_every: Duration,
    pub cleanup_every: Duration,
    /// Rate buckets unused this long are dropped
    pub limiter_idle: Duration,
    /// Eligibility warnings older than this are dropped
    pub warning_max_age: Duration,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            expiry_every: Duration::from_secs(60),
            health_every: Duration::from_secs(300),
            cleanup_every: Duration::from_secs(300),
            limiter_idle: Duration::from_secs(300),
            warning_max_age: Duration::from_secs(1800),
        }
    }
}

/// Counts from one sweep
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub expired: usize,
    pub released: usize,
    /// Claimed by a concurrent sweep, or already released
    pub skipped: usize,
    pub failed: usize,
}

/// Removes a sanction id from the in-flight set when dropped
struct Claim<'a> {
    set: &'a DashSet<String>,
    id: String,
}

impl Drop for Claim<'_> {
    fn drop(&mut self) {
        self.set.remove(&self.id);
    }
}

fn release_action(kind: SanctionKind) -> ModerationAction {
    let reason = Some(AUTO_RELEASE_REASON.to_string());
    match kind {
        SanctionKind::Ban => ModerationAction::unban(reason),
        SanctionKind::Mute => ModerationAction::unmute(reason),
    }
}

/// Releases expired sanctions and keeps the authorization cache healthy
pub struct ExpiryScheduler {
    store: Arc<dyn BackingStore>,
    cache: Arc<AuthorizationCache>,
    service: Arc<ModerationService>,
    notifier: Arc<Notifier>,
    limiter: Arc<RateLimiter>,
    eligibility: Option<Arc<EligibilityEnforcer>>,
    retry: RetryPolicy,
    settings: SchedulerSettings,
    in_flight: DashSet<String>,
}

impl std::fmt::Debug for ExpiryScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExpiryScheduler")
            .field("settings", &self.settings)
            .field("in_flight", &self.in_flight.len())
            .finish_non_exhaustive()
    }
}

impl ExpiryScheduler {
    #[must_use]
    pub fn new(
        store: Arc<dyn BackingStore>,
        cache: Arc<AuthorizationCache>,
        service: Arc<ModerationService>,
        notifier: Arc<Notifier>,
        limiter: Arc<RateLimiter>,
        retry: RetryPolicy,
        settings: SchedulerSettings,
    ) -> Self {
        Self {
            store,
            cache,
            service,
            notifier,
            limiter,
            eligibility: None,
            retry,
            settings,
            in_flight: DashSet::new(),
        }
    }

    /// Also prune eligibility state on the cleanup cadence
    #[must_use]
    pub fn with_eligibility(mut self, eligibility: Arc<EligibilityEnforcer>) -> Self {
        self.eligibility = Some(eligibility);
        self
    }

    /// Spawn the background task, returning its request channel and handle
    pub fn start(self: Arc<Self>) -> (Sender<SchedulerRequest>, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(16);
        let handle = tokio::spawn(async move { self.run(rx).await });
        (tx, handle)
    }

    pub async fn run(&self, mut rx: Receiver<SchedulerRequest>) {
        info!(
            target: SCHEDULER_TARGET,
            expiry_every = ?self.settings.expiry_every,
            health_every = ?self.settings.health_every,
            "Starting expiry scheduler"
        );

        let mut expiry = tokio::time::interval(self.settings.expiry_every);
        let mut health = delayed_interval(self.settings.health_every);
        let mut cleanup = delayed_interval(self.settings.cleanup_every);
        for interval in [&mut expiry, &mut health, &mut cleanup] {
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        }

        loop {
            tokio::select! {
                request = rx.recv() => match request {
                    Some(SchedulerRequest::SweepNow) => {
                        self.sweep().await;
                    }
                    Some(SchedulerRequest::HealthCheck) => {
                        self.check_store_health().await;
                    }
                    Some(SchedulerRequest::Shutdown) | None => {
                        info!(target: SCHEDULER_TARGET, "Expiry scheduler stopping");
                        break;
                    }
                },
                _ = expiry.tick() => {
                    self.sweep().await;
                }
                _ = health.tick() => {
                    self.check_store_health().await;
                }
                _ = cleanup.tick() => {
                    self.cleanup();
                }
            }
        }
    }

    /// Release every active sanction whose expiry has passed
    pub async fn sweep(&self) -> SweepReport {
        let mut report = SweepReport::default();
        let now = Utc::now();

        let store = Arc::clone(&self.store);
        let expired = match self
            .retry
            .run("list_expired_active_sanctions", move || {
                let store = Arc::clone(&store);
                async move { store.list_expired_active_sanctions(now).await }
            })
            .await
        {
            Ok(expired) => expired,
            Err(e) => {
                error!(target: SCHEDULER_TARGET, error = %e, "Failed to list expired sanctions");
                return report;
            }
        };
        report.expired = expired.len();
        if expired.is_empty() {
            debug!(target: SCHEDULER_TARGET, "No expired sanctions");
            return report;
        }

        let destinations = match self.service.resolve_destinations().await {
            Ok(destinations) => destinations,
            Err(e) => {
                error!(target: SCHEDULER_TARGET, error = %e, "Failed to resolve destinations for sweep");
                report.failed = expired.len();
                return report;
            }
        };

        for sanction in expired {
            if !self.in_flight.insert(sanction.id.clone()) {
                debug!(target: SCHEDULER_TARGET, sanction_id = %sanction.id, "Release already in flight");
                report.skipped += 1;
                continue;
            }
            let _claim = Claim {
                set: &self.in_flight,
                id: sanction.id.clone(),
            };

            match self.release(&sanction, &destinations).await {
                Some(true) => report.released += 1,
                Some(false) => report.skipped += 1,
                None => report.failed += 1,
            }
        }

        info!(
            target: SCHEDULER_TARGET,
            expired = report.expired,
            released = report.released,
            skipped = report.skipped,
            failed = report.failed,
            "Sweep complete"
        );
        report
    }

    /// `Some(true)` when released now, `Some(false)` when someone else got there first
    async fn release(&self, sanction: &Sanction, destinations: &[u64]) -> Option<bool> {
        let action = release_action(sanction.kind);
        let report = self
            .service
            .executor()
            .execute(&action, sanction.subject.id, destinations)
            .await;

        if !report.is_success() {
            error!(
                target: SCHEDULER_TARGET,
                sanction_id = %sanction.id,
                subject = sanction.subject.id,
                error = report.first_error().unwrap_or("no destinations"),
                "Scheduled release failed, will retry next sweep"
            );
            return None;
        }

        match self
            .store
            .mark_released(&sanction.id, AUTO_RELEASE_REASON, None)
            .await
        {
            Ok(true) => {
                info!(
                    target: SCHEDULER_TARGET,
                    sanction_id = %sanction.id,
                    subject = sanction.subject.id,
                    kind = %sanction.kind,
                    "Expired sanction released"
                );
                let system = Operator::system();
                self.notifier
                    .sanction_released(
                        sanction.kind,
                        &sanction.subject,
                        &system,
                        AUTO_RELEASE_REASON,
                        Some(&report),
                    )
                    .await;

                let entry = AuditEntry::new(
                    report.action,
                    sanction.subject.clone(),
                    sanction.origin.clone(),
                    system,
                    action.params(),
                )
                .with_counts(report.succeeded.len(), report.failed.len());
                if let Err(e) = self.store.record_audit(entry).await {
                    warn!(target: SCHEDULER_TARGET, error = %e, "Failed to record audit entry");
                }
                Some(true)
            }
            Ok(false) => {
                debug!(target: SCHEDULER_TARGET, sanction_id = %sanction.id, "Sanction already released");
                Some(false)
            }
            Err(e) => {
                error!(
                    target: SCHEDULER_TARGET,
                    sanction_id = %sanction.id,
                    error = %e,
                    "Released in destinations but could not mark released"
                );
                None
            }
        }
    }

    /// Ping the store and refresh the authorization cache when it is healthy
    pub async fn check_store_health(&self) -> bool {
        let store = Arc::clone(&self.store);
        let reachable = self
            .retry
            .run("is_reachable", move || {
                let store = Arc::clone(&store);
                async move {
                    if store.is_reachable().await {
                        Ok(())
                    } else {
                        Err(StoreError::Unavailable("health check failed".to_string()))
                    }
                }
            })
            .await
            .is_ok();

        if !reachable {
            warn!(
                target: SCHEDULER_TARGET,
                "Backing store unreachable, authorization stays fail-open on the stale cache"
            );
            return false;
        }

        match self.cache.refresh_from(self.store.as_ref(), &self.retry).await {
            Ok(Some(count)) => debug!(target: SCHEDULER_TARGET, count, "Cache refreshed by health check"),
            Ok(None) => {}
            Err(e) => warn!(target: SCHEDULER_TARGET, error = %e, "Health check refresh failed"),
        }
        true
    }

    fn cleanup(&self) {
        let buckets = self.limiter.cleanup(self.settings.limiter_idle);
        let warnings = self
            .eligibility
            .as_ref()
            .map_or(0, |e| e.prune(self.settings.warning_max_age));
        debug!(target: SCHEDULER_TARGET, buckets, warnings, "Cleanup complete");
    }
}

fn delayed_interval(period: Duration) -> tokio::time::Interval {
    tokio::time::interval_at(Instant::now() + period, period)
}
