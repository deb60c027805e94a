//! Cross-destination moderation core
//!
//! One logical action (ban, mute, kick and their reversals) is applied to a
//! subject in every authorized destination. The pieces:
//!
//! - [`AuthorizationCache`] and [`PermissionChecker`] decide who may act where.
//! - [`ConcurrentActionExecutor`] fans an action out with a bounded worker pool,
//!   throttled per destination by [`RateLimiter`].
//! - [`ModerationService`] turns a fan-out into durable records and notifications.
//! - [`ExpiryScheduler`] releases time-boxed sanctions.
//! - [`EligibilityEnforcer`] leaves destinations that were never authorized.

mod action;
mod auth_cache;
mod discord;
mod eligibility;
mod error;
mod executor;
mod handler;
mod notifier;
mod permission;
mod rate_limit;
mod record;
mod scheduler;
mod service;
mod store;
mod transport;

pub use action::{ActionParams, ModerationAction, ModerationActionType};
pub use auth_cache::{AuthorizationCache, CacheLookup, CacheStatus};
pub use discord::DiscordTransport;
pub use eligibility::{EligibilityEnforcer, EligibilityVerdict};
pub use error::{ModerationError, ModerationResult, StoreError, StoreResult};
pub use executor::{ConcurrentActionExecutor, DestinationFailure, FanOutOutcome, FanOutReport};
pub use handler::{ActionHandler, ActionHandlerRegistry};
pub use notifier::{DestinationInfo, Notifier};
pub use permission::{
    AUTHORIZATION_FAILURE_POLICY, FailurePolicy, PermissionChecker, PermissionDecision,
    PermissionReason,
};
pub use rate_limit::RateLimiter;
pub use record::{
    AUTO_RELEASE_REASON, AuditEntry, AuditQuery, Destination, Moderator, NotificationTarget,
    Operator, Origin, ReleaseInfo, RuntimeSettings, Sanction, SanctionKind, SanctionStatus,
    Subject,
};
pub use scheduler::{ExpiryScheduler, SchedulerRequest, SchedulerSettings, SweepReport};
pub use service::{BatchSummary, ModerationRequest, ModerationService, SubjectOutcome};
pub use store::{BackingStore, MemoryStore, RetryPolicy};
pub use transport::{ChatPermissions, ChatTransport};

#[cfg(test)]
pub use store::MockBackingStore;
#[cfg(test)]
pub use transport::MockChatTransport;
