//! Who may act where
//!
//! [`PermissionChecker::check`] walks an ordered ladder and the first matching
//! rung decides. Every outcome carries a [`PermissionReason`] tag for logs.

use crate::moderation::{AuthorizationCache, BackingStore, ChatTransport, RetryPolicy};
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, error, info, warn};

/// What to assume when authorization cannot be determined
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailurePolicy {
    /// Treat the destination as authorized
    FailOpen,
    /// Treat the destination as unauthorized
    FailClosed,
}

impl FailurePolicy {
    #[must_use]
    pub const fn assume_authorized(self) -> bool {
        matches!(self, Self::FailOpen)
    }
}

/// Applied by both the permission ladder and the forced-departure path.
///
/// Wrongly leaving a legitimate destination is worse than briefly tolerating
/// an unauthorized one during a store outage.
pub const AUTHORIZATION_FAILURE_POLICY: FailurePolicy = FailurePolicy::FailOpen;

/// Why a permission decision came out the way it did
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PermissionReason {
    RootOperator,
    GlobalModerator,
    PrivateChannel,
    DestinationNotAuthorized,
    DestinationModeratorsDisabled,
    DestinationModerator,
    NoPermission,
    CheckError,
}

impl PermissionReason {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::RootOperator => "root_operator",
            Self::GlobalModerator => "global_moderator",
            Self::PrivateChannel => "private_channel_not_allowed",
            Self::DestinationNotAuthorized => "destination_not_authorized",
            Self::DestinationModeratorsDisabled => "destination_moderators_disabled",
            Self::DestinationModerator => "destination_moderator",
            Self::NoPermission => "no_permission",
            Self::CheckError => "check_error",
        }
    }
}

impl fmt::Display for PermissionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PermissionDecision {
    pub allowed: bool,
    pub reason: PermissionReason,
}

impl PermissionDecision {
    const fn allow(reason: PermissionReason) -> Self {
        Self {
            allowed: true,
            reason,
        }
    }

    const fn deny(reason: PermissionReason) -> Self {
        Self {
            allowed: false,
            reason,
        }
    }
}

/// Layered permission decisions plus destination eligibility
pub struct PermissionChecker {
    roots: HashSet<u64>,
    /// Toggled at runtime by root operators
    destination_moderators_enabled: AtomicBool,
    cache: Arc<AuthorizationCache>,
    store: Arc<dyn BackingStore>,
    transport: Arc<dyn ChatTransport>,
    retry: RetryPolicy,
}

impl fmt::Debug for PermissionChecker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PermissionChecker")
            .field("roots", &self.roots)
            .field(
                "destination_moderators_enabled",
                &self.destination_moderators_enabled(),
            )
            .finish_non_exhaustive()
    }
}

impl PermissionChecker {
    #[must_use]
    pub fn new(
        roots: impl IntoIterator<Item = u64>,
        destination_moderators_enabled: bool,
        cache: Arc<AuthorizationCache>,
        store: Arc<dyn BackingStore>,
        transport: Arc<dyn ChatTransport>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            roots: roots.into_iter().collect(),
            destination_moderators_enabled: AtomicBool::new(destination_moderators_enabled),
            cache,
            store,
            transport,
            retry,
        }
    }

    #[must_use]
    pub fn is_root(&self, actor: u64) -> bool {
        self.roots.contains(&actor)
    }

    pub fn roots(&self) -> impl Iterator<Item = u64> + '_ {
        self.roots.iter().copied()
    }

    #[must_use]
    pub fn destination_moderators_enabled(&self) -> bool {
        self.destination_moderators_enabled.load(Ordering::Acquire)
    }

    /// Allow or stop group-local moderators acting through the ladder
    pub fn set_destination_moderators_enabled(&self, enabled: bool) {
        let previous = self
            .destination_moderators_enabled
            .swap(enabled, Ordering::AcqRel);
        if previous != enabled {
            info!(enabled, "Destination moderators toggled");
        }
    }

    /// Decide whether `actor` may moderate from `destination`
    ///
    /// `destination == None` means the request came from a private channel.
    pub async fn check(&self, actor: u64, destination: Option<u64>) -> PermissionDecision {
        let decision = self.decide(actor, destination).await;
        debug!(
            actor,
            destination = ?destination,
            allowed = decision.allowed,
            reason = %decision.reason,
            "Permission decision"
        );
        decision
    }

    async fn decide(&self, actor: u64, destination: Option<u64>) -> PermissionDecision {
        if self.is_root(actor) {
            return PermissionDecision::allow(PermissionReason::RootOperator);
        }

        match self.store.is_global_moderator(actor).await {
            Ok(true) => return PermissionDecision::allow(PermissionReason::GlobalModerator),
            Ok(false) => {}
            Err(e) => warn!(actor, error = %e, "Global moderator lookup failed"),
        }

        let Some(destination) = destination else {
            return PermissionDecision::deny(PermissionReason::PrivateChannel);
        };

        if !self.is_destination_authorized(destination).await {
            return PermissionDecision::deny(PermissionReason::DestinationNotAuthorized);
        }

        if !self.destination_moderators_enabled() {
            return PermissionDecision::deny(PermissionReason::DestinationModeratorsDisabled);
        }

        match self
            .transport
            .is_destination_moderator(destination, actor)
            .await
        {
            Ok(true) => PermissionDecision::allow(PermissionReason::DestinationModerator),
            Ok(false) => PermissionDecision::deny(PermissionReason::NoPermission),
            Err(e) => {
                warn!(actor, destination, error = %e, "Destination role lookup failed");
                PermissionDecision::deny(PermissionReason::CheckError)
            }
        }
    }

    /// Whether `destination` is authorized, resolving store failures by policy
    ///
    /// The notification destination is always authorized. A cache miss goes
    /// to the store and schedules a background cache refresh.
    pub async fn is_destination_authorized(&self, destination: u64) -> bool {
        if self.cache.is_notification(destination) {
            return true;
        }

        let lookup = self.cache.is_authorized(destination);
        if lookup.cached {
            return lookup.authorized;
        }

        let store = Arc::clone(&self.store);
        let result = self
            .retry
            .run("is_destination_authorized", move || {
                let store = Arc::clone(&store);
                async move { store.is_destination_authorized(destination).await }
            })
            .await;

        match result {
            Ok(authorized) => {
                self.spawn_cache_refresh();
                authorized
            }
            Err(e) => {
                let assumed = AUTHORIZATION_FAILURE_POLICY.assume_authorized();
                error!(
                    destination,
                    error = %e,
                    policy = ?AUTHORIZATION_FAILURE_POLICY,
                    assumed,
                    "Could not determine destination authorization"
                );
                assumed
            }
        }
    }

    fn spawn_cache_refresh(&self) {
        let cache = Arc::clone(&self.cache);
        let store = Arc::clone(&self.store);
        let retry = self.retry;
        tokio::spawn(async move {
            if let Err(e) = cache.refresh_from(store.as_ref(), &retry).await {
                warn!(error = %e, "Background cache refresh failed");
            }
        });
    }
}
