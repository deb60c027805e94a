//! Subject-level moderation
//!
//! The service resolves the authorized destination set, fans an action out
//! through the executor, and dispatches the durable record, audit entry and
//! notification afterwards, off the response path. The fan-out and its side
//! effects all run on one task tracker, so a drain at shutdown waits for a
//! half-applied action to finish and be recorded.

use crate::AUDIT_TARGET;
use crate::moderation::{
    AuditEntry, AuthorizationCache, BackingStore, ConcurrentActionExecutor, FanOutOutcome,
    FanOutReport, ModerationAction, ModerationActionType, ModerationError, ModerationResult,
    Notifier, Operator, Origin, RetryPolicy, Sanction, SanctionKind, Subject,
};
use std::fmt::Write as _;
use std::sync::Arc;
use tokio_util::task::TaskTracker;
use tracing::{error, info, warn};

/// One logical action against one subject
#[derive(Debug, Clone)]
pub struct ModerationRequest {
    pub action: ModerationAction,
    pub subject: Subject,
    pub origin: Origin,
    pub operator: Operator,
}

impl ModerationRequest {
    pub fn new(action: ModerationAction, subject: Subject, origin: Origin, operator: Operator) -> Self {
        Self {
            action,
            subject,
            origin,
            operator,
        }
    }
}

/// Result for one subject of a batch
#[derive(Debug, Clone)]
pub struct SubjectOutcome {
    pub subject: Subject,
    /// `None` when the destination set could not be resolved
    pub report: Option<FanOutReport>,
    pub error: Option<String>,
}

impl SubjectOutcome {
    #[must_use]
    pub fn outcome(&self) -> FanOutOutcome {
        self.report
            .as_ref()
            .map_or(FanOutOutcome::Failed, FanOutReport::outcome)
    }

    fn failure_text(&self) -> String {
        self.error
            .clone()
            .or_else(|| {
                self.report
                    .as_ref()
                    .and_then(|r| r.first_error().map(ToString::to_string))
            })
            .unwrap_or_else(|| "no authorized destinations".to_string())
    }
}

/// Terminal outcome of a command, for the requester
#[derive(Debug, Clone)]
pub struct BatchSummary {
    pub action: ModerationActionType,
    pub outcomes: Vec<SubjectOutcome>,
}

impl BatchSummary {
    #[must_use]
    pub fn succeeded(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|o| o.outcome() != FanOutOutcome::Failed)
            .count()
    }

    #[must_use]
    pub fn is_success(&self) -> bool {
        self.succeeded() > 0
    }

    /// Human-readable outcome: success, partial or failure
    #[must_use]
    pub fn render(&self) -> String {
        let action = self.action;
        match self.outcomes.as_slice() {
            [] => format!("{action}: nothing to do"),
            [single] => {
                let name = &single.subject.display_name;
                match (single.outcome(), &single.report) {
                    (FanOutOutcome::Success, Some(report)) => format!(
                        "{action} applied to {name} in {} destination(s)",
                        report.succeeded.len()
                    ),
                    (FanOutOutcome::Partial, Some(report)) => format!(
                        "{action} applied to {name} in {} destination(s), {} failed",
                        report.succeeded.len(),
                        report.failed.len()
                    ),
                    _ => format!("{action} failed for {name}: {}", single.failure_text()),
                }
            }
            outcomes => {
                let mut text = format!(
                    "{action}: {}/{} succeeded",
                    self.succeeded(),
                    outcomes.len()
                );
                for outcome in outcomes {
                    if outcome.outcome() == FanOutOutcome::Failed {
                        let _ = write!(
                            text,
                            "\n- {}: {}",
                            outcome.subject.display_name,
                            outcome.failure_text()
                        );
                    }
                }
                text
            }
        }
    }
}

/// Orchestrates fan-out and its side effects
///
/// Clones share the same tracker.
#[derive(Clone)]
pub struct ModerationService {
    store: Arc<dyn BackingStore>,
    cache: Arc<AuthorizationCache>,
    executor: Arc<ConcurrentActionExecutor>,
    notifier: Arc<Notifier>,
    retry: RetryPolicy,
    tracker: TaskTracker,
}

impl std::fmt::Debug for ModerationService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModerationService")
            .field("executor", &self.executor)
            .field("in_flight", &self.tracker.len())
            .finish_non_exhaustive()
    }
}

impl ModerationService {
    #[must_use]
    pub fn new(
        store: Arc<dyn BackingStore>,
        cache: Arc<AuthorizationCache>,
        executor: Arc<ConcurrentActionExecutor>,
        notifier: Arc<Notifier>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            store,
            cache,
            executor,
            notifier,
            retry,
            tracker: TaskTracker::new(),
        }
    }

    #[must_use]
    pub fn executor(&self) -> &Arc<ConcurrentActionExecutor> {
        &self.executor
    }

    /// The authorized destination set, from the cache while fresh
    ///
    /// # Errors
    /// Returns a store error when the cache is stale and the store stays unreachable
    pub async fn resolve_destinations(&self) -> ModerationResult<Vec<u64>> {
        if let Some(destinations) = self.cache.snapshot() {
            return Ok(destinations);
        }

        let store = Arc::clone(&self.store);
        let destinations = self
            .retry
            .run("list_authorized_destinations", move || {
                let store = Arc::clone(&store);
                async move { store.list_authorized_destinations().await }
            })
            .await?;

        let ids: Vec<u64> = destinations.into_iter().map(|d| d.id).collect();
        self.cache.set_all(ids.iter().copied());
        Ok(ids)
    }

    /// Apply one request across every authorized destination
    ///
    /// Returns once the live action has been applied; recording happens in the
    /// background. The fan-out runs on the tracker, so it completes even if the
    /// caller is dropped during shutdown.
    ///
    /// # Errors
    /// Returns an error if shutdown has started or the destination set cannot be resolved
    pub async fn enforce(&self, request: ModerationRequest) -> ModerationResult<FanOutReport> {
        if self.tracker.is_closed() {
            warn!(
                action = %request.action.get_type(),
                subject = request.subject.id,
                "Rejecting moderation request during shutdown"
            );
            return Err(ModerationError::ShuttingDown);
        }

        let service = self.clone();
        self.tracker
            .spawn(async move { service.apply(request).await })
            .await
            .map_err(|e| ModerationError::Other(format!("Moderation task failed: {e}")))?
    }

    async fn apply(&self, request: ModerationRequest) -> ModerationResult<FanOutReport> {
        let destinations = match self.resolve_destinations().await {
            Ok(destinations) => destinations,
            Err(e) => {
                error!(
                    action = %request.action.get_type(),
                    subject = request.subject.id,
                    error = %e,
                    "Could not resolve destinations"
                );
                self.dispatch_failure(&request, e.to_string());
                return Err(e);
            }
        };

        let report = self
            .executor
            .execute(&request.action, request.subject.id, &destinations)
            .await;

        if report.is_success() {
            self.dispatch_success(request, report.clone());
        } else {
            let message = report
                .first_error()
                .unwrap_or("no authorized destinations")
                .to_string();
            self.record_audit(&request, &report, Some(message.clone()));
            self.dispatch_failure(&request, message);
        }

        Ok(report)
    }

    /// Apply the same action to several subjects in turn
    pub async fn enforce_batch(
        &self,
        action: ModerationAction,
        subjects: Vec<Subject>,
        origin: Origin,
        operator: Operator,
    ) -> BatchSummary {
        let action_type = action.get_type();
        let mut outcomes = Vec::with_capacity(subjects.len());

        for subject in subjects {
            let request =
                ModerationRequest::new(action.clone(), subject.clone(), origin.clone(), operator.clone());
            let outcome = match self.enforce(request).await {
                Ok(report) => SubjectOutcome {
                    subject,
                    report: Some(report),
                    error: None,
                },
                Err(e) => SubjectOutcome {
                    subject,
                    report: None,
                    error: Some(e.to_string()),
                },
            };
            outcomes.push(outcome);
        }

        BatchSummary {
            action: action_type,
            outcomes,
        }
    }

    fn record_audit(&self, request: &ModerationRequest, report: &FanOutReport, error: Option<String>) {
        let mut entry = AuditEntry::new(
            report.action,
            request.subject.clone(),
            request.origin.clone(),
            request.operator.clone(),
            request.action.params(),
        )
        .with_counts(report.succeeded.len(), report.failed.len());
        entry.error = error;

        let store = Arc::clone(&self.store);
        self.tracker.spawn(async move {
            write_audit(store.as_ref(), entry).await;
        });
    }

    fn dispatch_failure(&self, request: &ModerationRequest, message: String) {
        let notifier = Arc::clone(&self.notifier);
        let action = request.action.get_type();
        let subject = request.subject.clone();
        let operator = request.operator.clone();
        self.tracker.spawn(async move {
            notifier
                .operation_failed(action, &subject, &operator, &message)
                .await;
        });
    }

    fn dispatch_success(&self, request: ModerationRequest, report: FanOutReport) {
        let store = Arc::clone(&self.store);
        let notifier = Arc::clone(&self.notifier);
        let retry = self.retry;

        self.tracker.spawn(async move {
            if let Some(kind) = request.action.creates_sanction() {
                record_sanction(store.as_ref(), &notifier, &retry, kind, &request, &report).await;
            } else if let Some(kind) = request.action.releases_sanction() {
                release_sanctions(store.as_ref(), &notifier, kind, &request, &report).await;
            } else {
                notifier
                    .kicked(&request.subject, &request.origin, &request.operator, &report)
                    .await;
            }

            let entry = AuditEntry::new(
                report.action,
                request.subject.clone(),
                request.origin.clone(),
                request.operator.clone(),
                request.action.params(),
            )
            .with_counts(report.succeeded.len(), report.failed.len());
            write_audit(store.as_ref(), entry).await;
        });
    }

    /// Stop taking requests and wait for in-flight fan-outs and their side effects
    pub async fn drain(&self) {
        self.tracker.close();
        info!(in_flight = self.tracker.len(), "Draining moderation work");
        self.tracker.wait().await;
    }
}

async fn write_audit(store: &dyn BackingStore, entry: AuditEntry) {
    info!(
        target: AUDIT_TARGET,
        action = entry.action.as_str(),
        subject = entry.subject.id,
        operator = entry.operator.id,
        succeeded = entry.succeeded,
        failed = entry.failed,
        success = entry.success,
        "Moderation action"
    );
    if let Err(e) = store.record_audit(entry).await {
        warn!(error = %e, "Failed to record audit entry");
    }
}

async fn record_sanction(
    store: &dyn BackingStore,
    notifier: &Notifier,
    retry: &RetryPolicy,
    kind: SanctionKind,
    request: &ModerationRequest,
    report: &FanOutReport,
) {
    let sanction = Sanction::new(
        kind,
        request.subject.clone(),
        request.origin.clone(),
        request.operator.clone(),
        request.action.params(),
    );

    let pending = &sanction;
    let result = retry
        .run("create_sanction", move || store.create_sanction(pending.clone()))
        .await;
    match result {
        Ok(()) => info!(
            sanction_id = %sanction.id,
            kind = %kind,
            subject = sanction.subject.id,
            expire_at = ?sanction.expire_at,
            "Sanction recorded"
        ),
        Err(e) => error!(
            subject = sanction.subject.id,
            kind = %kind,
            error = %e,
            "Sanction applied but could not be recorded"
        ),
    }

    notifier.sanction_applied(&sanction, report).await;
}

async fn release_sanctions(
    store: &dyn BackingStore,
    notifier: &Notifier,
    kind: SanctionKind,
    request: &ModerationRequest,
    report: &FanOutReport,
) {
    let reason = request.action.params().reason_or_default();
    match store.active_sanctions_for(request.subject.id, kind).await {
        Ok(active) => {
            for sanction in active {
                match store
                    .mark_released(&sanction.id, reason, Some(request.operator.id))
                    .await
                {
                    Ok(true) => info!(sanction_id = %sanction.id, "Sanction released by operator"),
                    Ok(false) => {}
                    Err(e) => warn!(sanction_id = %sanction.id, error = %e, "Failed to mark sanction released"),
                }
            }
        }
        Err(e) => warn!(
            subject = request.subject.id,
            error = %e,
            "Failed to look up active sanctions"
        ),
    }

    notifier
        .sanction_released(kind, &request.subject, &request.operator, reason, Some(report))
        .await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::moderation::{
        ActionHandlerRegistry, ChatPermissions, ChatTransport, Destination, MemoryStore,
        MockBackingStore, MockChatTransport, RateLimiter, SanctionStatus, StoreError,
    };
    use async_trait::async_trait;
    use chrono::{DateTime, Utc};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    const TTL: Duration = Duration::from_secs(1800);
    const NOTIFY: u64 = 900;

    struct Harness {
        service: ModerationService,
        store: Arc<MemoryStore>,
    }

    async fn harness(transport: MockChatTransport, destinations: &[u64]) -> Harness {
        harness_with(Arc::new(transport), destinations).await
    }

    async fn harness_with(transport: Arc<dyn ChatTransport>, destinations: &[u64]) -> Harness {
        let store = Arc::new(MemoryStore::new());
        for id in destinations {
            store
                .authorize_destination(Destination::authorized(*id, format!("d{id}"), None))
                .await
                .unwrap();
        }
        let cache = Arc::new(AuthorizationCache::new(TTL));
        let executor = Arc::new(ConcurrentActionExecutor::new(
            Arc::clone(&transport),
            Arc::new(ActionHandlerRegistry::new()),
            Arc::new(RateLimiter::new(5, Duration::from_secs(1))),
            5,
        ));
        let notifier = Arc::new(Notifier::new(transport, [1]));
        notifier.set_channel(NOTIFY);
        let service = ModerationService::new(
            store.clone(),
            cache,
            executor,
            notifier,
            RetryPolicy::default(),
        );
        Harness { service, store }
    }

    /// Removals take a while to land
    #[derive(Default)]
    struct SlowTransport {
        removed: AtomicUsize,
    }

    #[async_trait]
    impl ChatTransport for SlowTransport {
        async fn apply_restriction(
            &self,
            _destination: u64,
            _subject: u64,
            _permissions: ChatPermissions,
            _until: Option<DateTime<Utc>>,
        ) -> ModerationResult<()> {
            Ok(())
        }

        async fn lift_restriction(&self, _destination: u64, _subject: u64) -> ModerationResult<()> {
            Ok(())
        }

        async fn remove_member(&self, _destination: u64, _subject: u64) -> ModerationResult<()> {
            tokio::time::sleep(Duration::from_millis(300)).await;
            self.removed.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn unban_member(&self, _destination: u64, _subject: u64) -> ModerationResult<()> {
            Ok(())
        }

        async fn leave_destination(&self, _destination: u64) -> ModerationResult<()> {
            Ok(())
        }

        async fn send_message(&self, _destination: u64, _text: &str) -> ModerationResult<()> {
            Ok(())
        }

        async fn send_direct_message(&self, _user: u64, _text: &str) -> ModerationResult<()> {
            Ok(())
        }

        async fn is_destination_moderator(
            &self,
            _destination: u64,
            _user: u64,
        ) -> ModerationResult<bool> {
            Ok(false)
        }
    }

    fn request(action: ModerationAction) -> ModerationRequest {
        ModerationRequest::new(
            action,
            Subject::new(42, "spammer"),
            Origin::new(Some(1), "d1"),
            Operator::new(1, "root"),
        )
    }

    #[tokio::test]
    async fn test_partial_success_records_sanction() {
        let mut transport = MockChatTransport::new();
        transport.expect_remove_member().times(3).returning(|destination, _| {
            if destination == 2 {
                Err(ModerationError::Transport("missing rights".to_string()))
            } else {
                Ok(())
            }
        });
        transport
            .expect_send_message()
            .withf(|destination, text| *destination == NOTIFY && text.contains("Member banned"))
            .times(1)
            .returning(|_, _| Ok(()));

        let h = harness(transport, &[1, 2, 3]).await;
        let report = h
            .service
            .enforce(request(ModerationAction::ban(1800, Some("spam".to_string()))))
            .await
            .unwrap();
        h.service.drain().await;

        assert_eq!(report.outcome(), FanOutOutcome::Partial);
        assert_eq!(report.failed.len(), 1);

        let bans = h.store.active_sanctions_for(42, SanctionKind::Ban).await.unwrap();
        assert_eq!(bans.len(), 1);
        assert_eq!(bans[0].duration_secs, Some(1800));
        assert_eq!(bans[0].reason, "spam");

        let audit = h.store.audit_entries();
        assert_eq!(audit.len(), 1);
        assert_eq!((audit[0].succeeded, audit[0].failed), (2, 1));

        let summary = BatchSummary {
            action: ModerationActionType::Ban,
            outcomes: vec![SubjectOutcome {
                subject: Subject::new(42, "spammer"),
                report: Some(report),
                error: None,
            }],
        };
        assert_eq!(
            summary.render(),
            "Ban applied to spammer in 2 destination(s), 1 failed"
        );
    }

    #[tokio::test]
    async fn test_total_failure_writes_no_sanction() {
        let mut transport = MockChatTransport::new();
        transport
            .expect_apply_restriction()
            .times(2)
            .returning(|_, _, _, _| Err(ModerationError::Transport("forbidden".to_string())));
        transport
            .expect_send_message()
            .withf(|_, text| text.contains("Operation failed"))
            .times(1)
            .returning(|_, _| Ok(()));

        let h = harness(transport, &[1, 2]).await;
        let report = h
            .service
            .enforce(request(ModerationAction::mute(600, None)))
            .await
            .unwrap();
        h.service.drain().await;

        assert_eq!(report.outcome(), FanOutOutcome::Failed);
        assert!(h.store.active_sanctions_for(42, SanctionKind::Mute).await.unwrap().is_empty());
        let audit = h.store.audit_entries();
        assert_eq!(audit.len(), 1);
        assert!(!audit[0].success);
        assert_eq!(audit[0].error.as_deref(), Some("Transport error: forbidden"));
    }

    #[tokio::test]
    async fn test_interactive_release_marks_sanctions() {
        let mut transport = MockChatTransport::new();
        transport.expect_unban_member().times(1).returning(|_, _| Ok(()));
        transport
            .expect_send_message()
            .withf(|_, text| text.contains("Ban lifted"))
            .times(1)
            .returning(|_, _| Ok(()));

        let h = harness(transport, &[1]).await;
        let existing = Sanction::new(
            SanctionKind::Ban,
            Subject::new(42, "spammer"),
            Origin::default(),
            Operator::new(1, "root"),
            &crate::moderation::ActionParams::new(None),
        );
        let id = existing.id.clone();
        h.store.create_sanction(existing).await.unwrap();

        h.service
            .enforce(request(ModerationAction::unban(Some("appeal".to_string()))))
            .await
            .unwrap();
        h.service.drain().await;

        let released = h.store.get_sanction(&id).unwrap();
        assert_eq!(released.status, SanctionStatus::Released);
        let release = released.release.unwrap();
        assert_eq!(release.reason, "appeal");
        assert_eq!(release.actor_id, Some(1));
    }

    #[tokio::test]
    async fn test_kick_notifies_without_sanction() {
        let mut transport = MockChatTransport::new();
        transport.expect_remove_member().times(2).returning(|_, _| Ok(()));
        transport.expect_unban_member().times(2).returning(|_, _| Ok(()));
        transport
            .expect_send_message()
            .withf(|_, text| text.contains("Member kicked"))
            .times(1)
            .returning(|_, _| Ok(()));

        let h = harness(transport, &[1, 2]).await;
        let report = h
            .service
            .enforce(request(ModerationAction::kick(None)))
            .await
            .unwrap();
        h.service.drain().await;

        assert_eq!(report.outcome(), FanOutOutcome::Success);
        assert!(h.store.active_sanctions_for(42, SanctionKind::Ban).await.unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_unresolvable_destinations_fail() {
        let mut store = MockBackingStore::new();
        store
            .expect_list_authorized_destinations()
            .times(3)
            .returning(|| Err(StoreError::Unavailable("down".to_string())));

        let mut transport = MockChatTransport::new();
        transport
            .expect_send_message()
            .withf(|_, text| text.contains("Operation failed"))
            .times(1)
            .returning(|_, _| Ok(()));
        let transport: Arc<dyn ChatTransport> = Arc::new(transport);

        let cache = Arc::new(AuthorizationCache::new(TTL));
        let executor = Arc::new(ConcurrentActionExecutor::new(
            Arc::clone(&transport),
            Arc::new(ActionHandlerRegistry::new()),
            Arc::new(RateLimiter::new(5, Duration::from_secs(1))),
            5,
        ));
        let notifier = Arc::new(Notifier::new(transport, [1]));
        notifier.set_channel(NOTIFY);
        let service = ModerationService::new(
            Arc::new(store),
            cache,
            executor,
            notifier,
            RetryPolicy::default(),
        );

        let summary = service
            .enforce_batch(
                ModerationAction::ban(None, None),
                vec![Subject::new(42, "spammer")],
                Origin::default(),
                Operator::new(1, "root"),
            )
            .await;
        service.drain().await;

        assert!(!summary.is_success());
        assert!(summary.render().starts_with("Ban failed for spammer: Backing store unavailable"));
    }

    #[tokio::test]
    async fn test_batch_render() {
        let mut transport = MockChatTransport::new();
        transport.expect_remove_member().returning(|_, subject| {
            if subject == 43 {
                Err(ModerationError::Transport("not a member".to_string()))
            } else {
                Ok(())
            }
        });
        transport.expect_send_message().returning(|_, _| Ok(()));

        let h = harness(transport, &[1]).await;
        let summary = h
            .service
            .enforce_batch(
                ModerationAction::ban(None, None),
                vec![Subject::new(42, "a"), Subject::new(43, "b"), Subject::new(44, "c")],
                Origin::new(Some(1), "d1"),
                Operator::new(1, "root"),
            )
            .await;
        h.service.drain().await;

        assert_eq!(summary.succeeded(), 2);
        assert_eq!(
            summary.render(),
            "Ban: 2/3 succeeded\n- b: Transport error: not a member"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_drain_waits_for_in_flight_fan_out() {
        let transport = Arc::new(SlowTransport::default());
        let h = harness_with(transport.clone(), &[1, 2]).await;

        let service = h.service.clone();
        let pending = tokio::spawn(async move {
            service
                .enforce(request(ModerationAction::ban(600, None)))
                .await
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(transport.removed.load(Ordering::SeqCst), 0);

        // The command task may be cancelled; the fan-out must still land
        pending.abort();
        h.service.drain().await;

        assert_eq!(transport.removed.load(Ordering::SeqCst), 2);
        let bans = h.store.active_sanctions_for(42, SanctionKind::Ban).await.unwrap();
        assert_eq!(bans.len(), 1);
        assert_eq!(h.store.audit_entries().len(), 1);

        let rejected = h.service.enforce(request(ModerationAction::kick(None))).await;
        assert!(matches!(rejected, Err(ModerationError::ShuttingDown)));
    }
}
