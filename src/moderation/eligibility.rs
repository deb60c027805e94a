//! Forced departure from unauthorized destinations
//!
//! A destination found unauthorized moves `unseen -> warned -> departed`.
//! The warning (and the departure that follows it) happens at most once per
//! cache epoch, and a warned destination is only re-armed once the re-warn
//! interval has also passed, so routine cache refreshes do not repeat it.
//! After a departure the destination stays quiet for a cooldown, so a quick
//! re-add does not loop through warn and leave again.

use crate::moderation::{AuthorizationCache, ChatTransport, DestinationInfo, Notifier, PermissionChecker};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WarnState {
    Warned { epoch: u64, at: Instant },
    Departed { at: Instant },
}

/// What the enforcer did for one inbound event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EligibilityVerdict {
    /// The pinned notification destination
    Exempt,
    Authorized,
    /// Already handled in this epoch, or cooling down after a departure
    AlreadyWarned,
    /// A root operator is present; warned but kept
    RootPresent,
    Departed,
    /// Warned, but leaving failed
    DepartureFailed,
}

pub struct EligibilityEnforcer {
    permissions: Arc<PermissionChecker>,
    cache: Arc<AuthorizationCache>,
    transport: Arc<dyn ChatTransport>,
    notifier: Arc<Notifier>,
    states: DashMap<u64, WarnState>,
    cooldown: Duration,
    rewarn_after: Duration,
}

impl std::fmt::Debug for EligibilityEnforcer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EligibilityEnforcer")
            .field("tracked", &self.states.len())
            .field("cooldown", &self.cooldown)
            .field("rewarn_after", &self.rewarn_after)
            .finish_non_exhaustive()
    }
}

impl EligibilityEnforcer {
    #[must_use]
    pub fn new(
        permissions: Arc<PermissionChecker>,
        cache: Arc<AuthorizationCache>,
        transport: Arc<dyn ChatTransport>,
        notifier: Arc<Notifier>,
        cooldown: Duration,
        rewarn_after: Duration,
    ) -> Self {
        Self {
            permissions,
            cache,
            transport,
            notifier,
            states: DashMap::new(),
            cooldown,
            rewarn_after,
        }
    }

    /// Check a destination that just produced an event from `author`
    pub async fn check(&self, destination: &DestinationInfo, author: Option<u64>) -> EligibilityVerdict {
        let id = destination.id;

        if self.cache.is_notification(id) {
            return EligibilityVerdict::Exempt;
        }

        if self.permissions.is_destination_authorized(id).await {
            self.states.remove(&id);
            return EligibilityVerdict::Authorized;
        }

        if !self.claim(id) {
            return EligibilityVerdict::AlreadyWarned;
        }

        if let Some(root) = author.filter(|a| self.permissions.is_root(*a)) {
            warn!(
                destination = id,
                name = %destination.name,
                root,
                "Root operator present in unauthorized destination, staying"
            );
            self.notifier.root_present(root, destination).await;
            return EligibilityVerdict::RootPresent;
        }

        warn!(destination = id, name = %destination.name, "Unauthorized destination, leaving");
        self.notifier.unauthorized_destination(destination).await;

        match self.transport.leave_destination(id).await {
            Ok(()) => {
                self.states.insert(id, WarnState::Departed { at: Instant::now() });
                info!(destination = id, name = %destination.name, "Left unauthorized destination");
                EligibilityVerdict::Departed
            }
            Err(e) => {
                error!(destination = id, error = %e, "Failed to leave unauthorized destination");
                EligibilityVerdict::DepartureFailed
            }
        }
    }

    /// Atomically move `destination` into the warned state, if it may be warned now
    fn claim(&self, destination: u64) -> bool {
        let epoch = self.cache.epoch();
        let now = Instant::now();
        let warned = WarnState::Warned { epoch, at: now };

        match self.states.entry(destination) {
            Entry::Vacant(entry) => {
                entry.insert(warned);
                true
            }
            Entry::Occupied(mut entry) => {
                let rearm = match *entry.get() {
                    WarnState::Warned { epoch: seen, at } => {
                        seen != epoch && now.duration_since(at) >= self.rewarn_after
                    }
                    WarnState::Departed { at } => now.duration_since(at) >= self.cooldown,
                };
                if rearm {
                    entry.insert(warned);
                }
                rearm
            }
        }
    }

    /// Drop warnings older than `max_age` and departures past their cooldown
    pub fn prune(&self, max_age: Duration) -> usize {
        let now = Instant::now();
        let before = self.states.len();
        self.states.retain(|_, state| match *state {
            WarnState::Warned { at, .. } => now.duration_since(at) <= max_age,
            WarnState::Departed { at } => now.duration_since(at) < self.cooldown,
        });
        before.saturating_sub(self.states.len())
    }

    #[must_use]
    pub fn tracked(&self) -> usize {
        self.states.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::moderation::{MemoryStore, MockChatTransport, ModerationError, RetryPolicy};

    const TTL: Duration = Duration::from_secs(1800);
    const COOLDOWN: Duration = Duration::from_secs(600);
    const REWARN: Duration = Duration::from_secs(1800);
    const ROOT: u64 = 1;

    fn enforcer(transport: MockChatTransport, cache: Arc<AuthorizationCache>) -> Arc<EligibilityEnforcer> {
        let transport: Arc<dyn ChatTransport> = Arc::new(transport);
        let permissions = Arc::new(PermissionChecker::new(
            [ROOT],
            true,
            Arc::clone(&cache),
            Arc::new(MemoryStore::new()),
            Arc::clone(&transport),
            RetryPolicy::default(),
        ));
        let notifier = Arc::new(Notifier::new(Arc::clone(&transport), [ROOT]));
        Arc::new(EligibilityEnforcer::new(
            permissions,
            cache,
            transport,
            notifier,
            COOLDOWN,
            REWARN,
        ))
    }

    fn rogue() -> DestinationInfo {
        DestinationInfo::new(9, "Rogue", None)
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_warn_and_depart_once_under_burst() {
        let mut transport = MockChatTransport::new();
        transport
            .expect_send_direct_message()
            .times(1)
            .returning(|_, _| Ok(()));
        transport.expect_leave_destination().times(1).returning(|_| Ok(()));

        let cache = Arc::new(AuthorizationCache::new(TTL));
        cache.set_all([10]);
        let enforcer = enforcer(transport, cache);

        let mut handles = Vec::new();
        for _ in 0..20 {
            let enforcer = Arc::clone(&enforcer);
            handles.push(tokio::spawn(async move { enforcer.check(&rogue(), Some(5)).await }));
        }

        let mut departed = 0;
        for handle in handles {
            match handle.await.unwrap() {
                EligibilityVerdict::Departed => departed += 1,
                EligibilityVerdict::AlreadyWarned => {}
                other => panic!("unexpected verdict {other:?}"),
            }
        }
        assert_eq!(departed, 1);
    }

    #[tokio::test]
    async fn test_exempt_and_authorized() {
        let cache = Arc::new(AuthorizationCache::new(TTL));
        cache.set_all([10]);
        cache.pin_notification(9);
        let enforcer = enforcer(MockChatTransport::new(), cache);

        assert_eq!(enforcer.check(&rogue(), None).await, EligibilityVerdict::Exempt);
        assert_eq!(
            enforcer.check(&DestinationInfo::new(10, "Main", None), None).await,
            EligibilityVerdict::Authorized
        );
        assert_eq!(enforcer.tracked(), 0);
    }

    #[tokio::test]
    async fn test_root_present_is_never_departed() {
        let mut transport = MockChatTransport::new();
        transport
            .expect_send_direct_message()
            .withf(|user, _| *user == ROOT)
            .times(1)
            .returning(|_, _| Ok(()));
        transport.expect_leave_destination().times(0);

        let cache = Arc::new(AuthorizationCache::new(TTL));
        cache.set_all([]);
        let enforcer = enforcer(transport, cache);

        assert_eq!(enforcer.check(&rogue(), Some(ROOT)).await, EligibilityVerdict::RootPresent);
        // Same epoch: nothing more happens, whoever speaks next
        assert_eq!(enforcer.check(&rogue(), Some(ROOT)).await, EligibilityVerdict::AlreadyWarned);
        assert_eq!(enforcer.check(&rogue(), Some(5)).await, EligibilityVerdict::AlreadyWarned);
    }

    #[tokio::test(start_paused = true)]
    async fn test_departure_cooldown_before_rearm() {
        let mut transport = MockChatTransport::new();
        transport
            .expect_send_direct_message()
            .times(2)
            .returning(|_, _| Ok(()));
        transport.expect_leave_destination().times(2).returning(|_| Ok(()));

        let cache = Arc::new(AuthorizationCache::new(TTL));
        cache.set_all([]);
        let enforcer = enforcer(transport, Arc::clone(&cache));

        assert_eq!(enforcer.check(&rogue(), Some(5)).await, EligibilityVerdict::Departed);

        // Re-added quickly, even across a new epoch
        cache.set_all([]);
        tokio::time::advance(COOLDOWN / 2).await;
        assert_eq!(enforcer.check(&rogue(), Some(5)).await, EligibilityVerdict::AlreadyWarned);

        tokio::time::advance(COOLDOWN).await;
        assert_eq!(enforcer.check(&rogue(), Some(5)).await, EligibilityVerdict::Departed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_departure_retries_after_rewarn_interval() {
        let mut transport = MockChatTransport::new();
        transport
            .expect_send_direct_message()
            .times(2)
            .returning(|_, _| Ok(()));
        transport
            .expect_leave_destination()
            .times(2)
            .returning(|_| Err(ModerationError::Transport("forbidden".to_string())));

        let cache = Arc::new(AuthorizationCache::new(TTL));
        cache.set_all([]);
        let enforcer = enforcer(transport, Arc::clone(&cache));

        assert_eq!(
            enforcer.check(&rogue(), Some(5)).await,
            EligibilityVerdict::DepartureFailed
        );
        assert_eq!(enforcer.check(&rogue(), Some(5)).await, EligibilityVerdict::AlreadyWarned);

        // A routine refresh alone does not repeat the warning
        cache.set_all([]);
        assert_eq!(enforcer.check(&rogue(), Some(5)).await, EligibilityVerdict::AlreadyWarned);

        tokio::time::advance(REWARN).await;
        cache.set_all([]);
        assert_eq!(
            enforcer.check(&rogue(), Some(5)).await,
            EligibilityVerdict::DepartureFailed
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_root_warned_once_across_health_refreshes() {
        let mut transport = MockChatTransport::new();
        transport
            .expect_send_direct_message()
            .withf(|user, _| *user == ROOT)
            .times(2)
            .returning(|_, _| Ok(()));
        transport.expect_leave_destination().times(0);

        let cache = Arc::new(AuthorizationCache::new(TTL));
        cache.set_all([]);
        let enforcer = enforcer(transport, Arc::clone(&cache));

        assert_eq!(enforcer.check(&rogue(), Some(ROOT)).await, EligibilityVerdict::RootPresent);

        // Health checks refresh every five minutes while the root keeps talking
        for _ in 0..5 {
            tokio::time::advance(Duration::from_secs(300)).await;
            cache.set_all([]);
            assert_eq!(
                enforcer.check(&rogue(), Some(ROOT)).await,
                EligibilityVerdict::AlreadyWarned
            );
        }

        tokio::time::advance(Duration::from_secs(300)).await;
        cache.set_all([]);
        assert_eq!(enforcer.check(&rogue(), Some(ROOT)).await, EligibilityVerdict::RootPresent);
    }

    #[tokio::test(start_paused = true)]
    async fn test_prune() {
        let mut transport = MockChatTransport::new();
        transport.expect_send_direct_message().returning(|_, _| Ok(()));
        transport
            .expect_leave_destination()
            .returning(|_| Err(ModerationError::Transport("forbidden".to_string())));

        let cache = Arc::new(AuthorizationCache::new(TTL));
        cache.set_all([]);
        let enforcer = enforcer(transport, cache);

        enforcer.check(&rogue(), Some(5)).await;
        assert_eq!(enforcer.tracked(), 1);
        assert_eq!(enforcer.prune(Duration::from_secs(60)), 0);

        tokio::time::advance(Duration::from_secs(61)).await;
        assert_eq!(enforcer.prune(Duration::from_secs(60)), 1);
        assert_eq!(enforcer.tracked(), 0);
    }
}
