//! Bounded fan-out of one action across many destinations
//!
//! A fixed number of workers pull destinations from a shared queue. Every call
//! waits on the per-destination rate limiter first, and a failure in one
//! destination never stops the others.

use crate::moderation::{
    ActionHandlerRegistry, ChatTransport, ModerationAction, ModerationActionType, RateLimiter,
};
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

/// A destination where the action did not land
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DestinationFailure {
    pub destination: u64,
    pub error: String,
}

/// Subject-level result of a fan-out
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FanOutOutcome {
    /// Every destination succeeded
    Success,
    /// At least one destination succeeded and at least one failed
    Partial,
    /// No destination succeeded
    Failed,
}

impl fmt::Display for FanOutOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Success => write!(f, "success"),
            Self::Partial => write!(f, "partial"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// Per-destination results of one fan-out
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FanOutReport {
    pub action: ModerationActionType,
    pub subject: u64,
    pub succeeded: Vec<u64>,
    pub failed: Vec<DestinationFailure>,
}

impl FanOutReport {
    fn empty(action: ModerationActionType, subject: u64) -> Self {
        Self {
            action,
            subject,
            succeeded: Vec::new(),
            failed: Vec::new(),
        }
    }

    #[must_use]
    pub fn outcome(&self) -> FanOutOutcome {
        match (self.succeeded.is_empty(), self.failed.is_empty()) {
            (true, _) => FanOutOutcome::Failed,
            (false, true) => FanOutOutcome::Success,
            (false, false) => FanOutOutcome::Partial,
        }
    }

    /// Partial success counts as success at the subject level
    #[must_use]
    pub fn is_success(&self) -> bool {
        !self.succeeded.is_empty()
    }

    #[must_use]
    pub fn total(&self) -> usize {
        self.succeeded.len() + self.failed.len()
    }

    /// First failure message, used for error notifications
    #[must_use]
    pub fn first_error(&self) -> Option<&str> {
        self.failed.first().map(|f| f.error.as_str())
    }
}

/// Applies an action to a destination set with bounded parallelism
pub struct ConcurrentActionExecutor {
    transport: Arc<dyn ChatTransport>,
    registry: Arc<ActionHandlerRegistry>,
    limiter: Arc<RateLimiter>,
    width: usize,
}

impl fmt::Debug for ConcurrentActionExecutor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConcurrentActionExecutor")
            .field("width", &self.width)
            .finish_non_exhaustive()
    }
}

impl ConcurrentActionExecutor {
    #[must_use]
    pub fn new(
        transport: Arc<dyn ChatTransport>,
        registry: Arc<ActionHandlerRegistry>,
        limiter: Arc<RateLimiter>,
        width: usize,
    ) -> Self {
        Self {
            transport,
            registry,
            limiter,
            width: width.max(1),
        }
    }

    #[must_use]
    pub fn width(&self) -> usize {
        self.width
    }

    /// Apply `action` to `subject` in every destination
    ///
    /// Duplicate destinations are applied once. An empty set yields a failed report.
    pub async fn execute(
        &self,
        action: &ModerationAction,
        subject: u64,
        destinations: &[u64],
    ) -> FanOutReport {
        let action_type = action.get_type();
        let mut report = FanOutReport::empty(action_type, subject);

        let mut seen = HashSet::with_capacity(destinations.len());
        let queue: Vec<u64> = destinations
            .iter()
            .copied()
            .filter(|d| seen.insert(*d))
            .collect();

        if queue.is_empty() {
            warn!(action = %action_type, subject, "No destinations to act on");
            return report;
        }

        let workers = self.width.min(queue.len());
        let (tx, rx) = mpsc::channel::<u64>(workers * 2);
        let rx = Arc::new(Mutex::new(rx));

        let mut set = JoinSet::new();
        for worker in 0..workers {
            let rx = Arc::clone(&rx);
            let transport = Arc::clone(&self.transport);
            let registry = Arc::clone(&self.registry);
            let limiter = Arc::clone(&self.limiter);
            let action = action.clone();

            set.spawn(async move {
                let mut results = Vec::new();
                loop {
                    let next = rx.lock().await.recv().await;
                    let Some(destination) = next else { break };

                    limiter.wait(destination).await;
                    let result = registry
                        .execute(transport.as_ref(), destination, subject, &action)
                        .await;
                    if let Err(e) = &result {
                        warn!(
                            worker,
                            destination,
                            subject,
                            action = %action.get_type(),
                            error = %e,
                            "Action failed in destination"
                        );
                    }
                    results.push((destination, result.map_err(|e| e.to_string())));
                }
                results
            });
        }

        for destination in queue {
            if tx.send(destination).await.is_err() {
                error!(destination, "Fan-out queue closed early");
                report.failed.push(DestinationFailure {
                    destination,
                    error: "worker pool stopped".to_string(),
                });
            }
        }
        drop(tx);

        while let Some(joined) = set.join_next().await {
            match joined {
                Ok(results) => {
                    for (destination, result) in results {
                        match result {
                            Ok(()) => report.succeeded.push(destination),
                            Err(error) => {
                                report.failed.push(DestinationFailure { destination, error });
                            }
                        }
                    }
                }
                Err(e) => error!(error = %e, "Fan-out worker panicked"),
            }
        }

        report.succeeded.sort_unstable();
        report.failed.sort_by_key(|f| f.destination);

        if report.is_success() {
            info!(
                action = %action_type,
                subject,
                succeeded = report.succeeded.len(),
                failed = report.failed.len(),
                "Fan-out complete"
            );
        } else {
            warn!(
                action = %action_type,
                subject,
                failed = report.failed.len(),
                "Fan-out failed in every destination"
            );
        }
        debug!(outcome = %report.outcome(), "Fan-out outcome");

        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::moderation::{
        ChatPermissions, MockChatTransport, ModerationError, ModerationResult,
    };
    use async_trait::async_trait;
    use chrono::{DateTime, Utc};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn executor(transport: Arc<dyn ChatTransport>, width: usize) -> ConcurrentActionExecutor {
        ConcurrentActionExecutor::new(
            transport,
            Arc::new(ActionHandlerRegistry::new()),
            Arc::new(RateLimiter::new(5, Duration::from_secs(1))),
            width,
        )
    }

    #[tokio::test]
    async fn test_partial_failure_is_subject_success() {
        let mut transport = MockChatTransport::new();
        transport.expect_remove_member().times(3).returning(|destination, _| {
            if destination == 2 {
                Err(ModerationError::Transport("missing rights".to_string()))
            } else {
                Ok(())
            }
        });

        let report = executor(Arc::new(transport), 5)
            .execute(&ModerationAction::ban(None, None), 42, &[1, 2, 3])
            .await;

        assert_eq!(report.succeeded, vec![1, 3]);
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].destination, 2);
        assert_eq!(report.outcome(), FanOutOutcome::Partial);
        assert!(report.is_success());
        assert_eq!(report.first_error(), Some("Transport error: missing rights"));
    }

    #[tokio::test]
    async fn test_total_failure() {
        let mut transport = MockChatTransport::new();
        transport
            .expect_lift_restriction()
            .times(2)
            .returning(|_, _| Err(ModerationError::Transport("gone".to_string())));

        let report = executor(Arc::new(transport), 5)
            .execute(&ModerationAction::unmute(None), 42, &[1, 2])
            .await;

        assert_eq!(report.outcome(), FanOutOutcome::Failed);
        assert!(!report.is_success());
        assert_eq!(report.total(), 2);
    }

    #[tokio::test]
    async fn test_empty_and_duplicate_destinations() {
        let mut transport = MockChatTransport::new();
        transport.expect_unban_member().times(2).returning(|_, _| Ok(()));
        let executor = executor(Arc::new(transport), 5);

        let report = executor
            .execute(&ModerationAction::unban(None), 42, &[])
            .await;
        assert_eq!(report.outcome(), FanOutOutcome::Failed);
        assert_eq!(report.total(), 0);

        let report = executor
            .execute(&ModerationAction::unban(None), 42, &[7, 8, 7])
            .await;
        assert_eq!(report.succeeded, vec![7, 8]);
        assert_eq!(report.outcome(), FanOutOutcome::Success);
    }

    /// Records the peak number of concurrent removals
    #[derive(Default)]
    struct CountingTransport {
        in_flight: AtomicUsize,
        peak: AtomicUsize,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl ChatTransport for CountingTransport {
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
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(50)).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            self.calls.fetch_add(1, Ordering::SeqCst);
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

    #[tokio::test(start_paused = true)]
    async fn test_worker_pool_is_bounded() {
        let transport = Arc::new(CountingTransport::default());
        let destinations: Vec<u64> = (1..=40).collect();

        let report = executor(transport.clone(), 4)
            .execute(&ModerationAction::ban(None, None), 42, &destinations)
            .await;

        assert_eq!(report.succeeded.len(), 40);
        assert_eq!(transport.calls.load(Ordering::SeqCst), 40);
        assert!(transport.peak.load(Ordering::SeqCst) <= 4);
        assert!(transport.peak.load(Ordering::SeqCst) > 1);
    }
}
