//! Durable records and the sanction lifecycle
//!
//! Sanctions move `Active -> Released` exactly once and are never deleted;
//! destinations and audit entries are the other rows the core reads and writes.

use crate::moderation::{ActionParams, ModerationActionType, ModerationError, ModerationResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

/// Reason recorded when the scheduler releases an expired sanction
pub const AUTO_RELEASE_REASON: &str = "Expired, released automatically";

/// Kind of sanction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SanctionKind {
    Ban,
    Mute,
}

impl std::fmt::Display for SanctionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Ban => write!(f, "Ban"),
            Self::Mute => write!(f, "Mute"),
        }
    }
}

impl SanctionKind {
    /// Action type that lifts this kind of sanction
    #[must_use]
    pub fn release_action_type(self) -> ModerationActionType {
        match self {
            Self::Ban => ModerationActionType::Unban,
            Self::Mute => ModerationActionType::Unmute,
        }
    }
}

/// Sanction lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum SanctionStatus {
    /// In force
    #[default]
    Active,
    /// Lifted, either by an operator or by the scheduler
    Released,
}

impl std::fmt::Display for SanctionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Active => write!(f, "Active"),
            Self::Released => write!(f, "Released"),
        }
    }
}

/// Who the sanction targets
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Subject {
    pub id: u64,
    pub display_name: String,
}

impl Subject {
    pub fn new(id: u64, display_name: impl Into<String>) -> Self {
        Self {
            id,
            display_name: display_name.into(),
        }
    }
}

/// Who issued an action; `id == 0` is the system itself
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Operator {
    pub id: u64,
    pub display_name: String,
}

impl Operator {
    pub fn new(id: u64, display_name: impl Into<String>) -> Self {
        Self {
            id,
            display_name: display_name.into(),
        }
    }

    /// The scheduler acting on its own
    #[must_use]
    pub fn system() -> Self {
        Self::new(0, "System")
    }

    #[must_use]
    pub fn is_system(&self) -> bool {
        self.id == 0
    }
}

/// Where an action was requested from; `destination == None` is a private channel
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Origin {
    pub destination: Option<u64>,
    pub name: String,
}

impl Origin {
    pub fn new(destination: Option<u64>, name: impl Into<String>) -> Self {
        Self {
            destination,
            name: name.into(),
        }
    }
}

/// How and by whom a sanction was lifted
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReleaseInfo {
    pub reason: String,
    /// `None` when released by the scheduler
    pub actor_id: Option<u64>,
    pub released_at: DateTime<Utc>,
}

/// An active or historical ban or mute
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Sanction {
    /// Unique ID of this sanction
    pub id: String,
    pub kind: SanctionKind,
    pub subject: Subject,
    /// Destination the command was issued from, `None` for private channels
    pub origin: Origin,
    pub operator: Operator,
    pub reason: String,
    /// Requested duration in seconds, `None` for permanent
    pub duration_secs: Option<u32>,
    /// Absolute expiry, `None` for permanent
    pub expire_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub status: SanctionStatus,
    pub release: Option<ReleaseInfo>,
}

impl Sanction {
    /// Create a new active sanction issued now
    pub fn new(
        kind: SanctionKind,
        subject: Subject,
        origin: Origin,
        operator: Operator,
        params: &ActionParams,
    ) -> Self {
        Self::issued_at(kind, subject, origin, operator, params, Utc::now())
    }

    /// Create a new active sanction issued at `now`
    pub fn issued_at(
        kind: SanctionKind,
        subject: Subject,
        origin: Origin,
        operator: Operator,
        params: &ActionParams,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            kind,
            subject,
            origin,
            operator,
            reason: params.reason_or_default().to_string(),
            duration_secs: params.duration.filter(|d| *d > 0),
            expire_at: params.expires_at(now),
            created_at: now,
            status: SanctionStatus::Active,
            release: None,
        }
    }

    #[must_use]
    pub fn is_permanent(&self) -> bool {
        self.expire_at.is_none()
    }

    /// Check if this sanction is active and its expiry has passed
    #[must_use]
    pub fn is_due_for_release(&self, now: DateTime<Utc>) -> bool {
        self.status == SanctionStatus::Active && self.expire_at.is_some_and(|at| at <= now)
    }

    /// Check if this sanction currently restricts its subject
    #[must_use]
    pub fn is_in_force(&self, now: DateTime<Utc>) -> bool {
        self.status == SanctionStatus::Active && self.expire_at.is_none_or(|at| at > now)
    }

    /// Release this sanction, transitioning to Released
    ///
    /// # Errors
    /// Returns an error if the sanction is not Active
    pub fn release(
        &mut self,
        reason: impl Into<String>,
        actor_id: Option<u64>,
        now: DateTime<Utc>,
    ) -> ModerationResult<()> {
        if self.status != SanctionStatus::Active {
            return Err(ModerationError::InvalidStateTransition);
        }

        self.status = SanctionStatus::Released;
        self.release = Some(ReleaseInfo {
            reason: reason.into(),
            actor_id,
            released_at: now,
        });

        info!(
            sanction_id = %self.id,
            subject = %self.subject.id,
            kind = %self.kind,
            actor = ?actor_id,
            "Sanction released"
        );

        Ok(())
    }
}

/// A moderated group
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Destination {
    pub id: u64,
    pub display_name: String,
    /// Public handle or vanity name, if the group has one
    pub handle: Option<String>,
    pub authorized: bool,
    pub authorized_at: DateTime<Utc>,
}

impl Destination {
    pub fn authorized(id: u64, display_name: impl Into<String>, handle: Option<String>) -> Self {
        Self {
            id,
            display_name: display_name.into(),
            handle,
            authorized: true,
            authorized_at: Utc::now(),
        }
    }
}

/// One line of the append-only operation log
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    pub id: String,
    pub action: ModerationActionType,
    pub subject: Subject,
    pub origin: Origin,
    pub operator: Operator,
    pub reason: String,
    pub duration_secs: Option<u32>,
    /// Destinations where the action landed
    pub succeeded: usize,
    /// Destinations where the action failed
    pub failed: usize,
    pub success: bool,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl AuditEntry {
    pub fn new(
        action: ModerationActionType,
        subject: Subject,
        origin: Origin,
        operator: Operator,
        params: &ActionParams,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            action,
            subject,
            origin,
            operator,
            reason: params.reason_or_default().to_string(),
            duration_secs: params.duration,
            succeeded: 0,
            failed: 0,
            success: true,
            error: None,
            created_at: Utc::now(),
        }
    }

    /// Attach destination counts from a fan-out
    #[must_use]
    pub fn with_counts(mut self, succeeded: usize, failed: usize) -> Self {
        self.succeeded = succeeded;
        self.failed = failed;
        self.success = succeeded > 0;
        self
    }
}

/// Which slice of the operation log to read
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuditQuery {
    /// Entries targeting one member
    Subject(u64),
    /// Entries issued from one group
    Destination(u64),
    /// Entries whose fan-out failed everywhere
    Failed,
}

impl AuditQuery {
    #[must_use]
    pub fn matches(&self, entry: &AuditEntry) -> bool {
        match *self {
            Self::Subject(id) => entry.subject.id == id,
            Self::Destination(id) => entry.origin.destination == Some(id),
            Self::Failed => !entry.success,
        }
    }
}

/// A moderator allowed to act from any authorized group
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Moderator {
    pub id: u64,
    pub display_name: String,
    /// Root operator who granted the rights
    pub added_by: u64,
    pub added_at: DateTime<Utc>,
}

impl Moderator {
    pub fn new(id: u64, display_name: impl Into<String>, added_by: u64) -> Self {
        Self {
            id,
            display_name: display_name.into(),
            added_by,
            added_at: Utc::now(),
        }
    }
}

/// Where operator notifications are posted
///
/// `destination` is the group hosting `channel`; it is exempt from forced
/// departure. Messages are sent to `channel`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NotificationTarget {
    pub destination: u64,
    pub channel: u64,
}

impl NotificationTarget {
    #[must_use]
    pub const fn new(destination: u64, channel: u64) -> Self {
        Self {
            destination,
            channel,
        }
    }
}

/// Settings changed at runtime by root operators; they override the file config
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeSettings {
    pub notification: Option<NotificationTarget>,
    pub destination_moderators_enabled: Option<bool>,
}
