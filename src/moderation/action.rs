//! Moderation action types
//!
//! This module defines the actions that can be replayed across destinations,
//! with a consistent parameter structure shared by every variant.

use crate::moderation::SanctionKind;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Type of moderation action
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ModerationActionType {
    /// Remove and keep out
    Ban,
    /// Lift a ban
    Unban,
    /// Revoke the right to send messages
    Mute,
    /// Restore the right to send messages
    Unmute,
    /// Remove without keeping out
    Kick,
}

impl fmt::Display for ModerationActionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ban => write!(f, "Ban"),
            Self::Unban => write!(f, "Unban"),
            Self::Mute => write!(f, "Mute"),
            Self::Unmute => write!(f, "Unmute"),
            Self::Kick => write!(f, "Kick"),
        }
    }
}

impl ModerationActionType {
    /// Lowercase tag used in audit entries and log fields
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Ban => "ban",
            Self::Unban => "unban",
            Self::Mute => "mute",
            Self::Unmute => "unmute",
            Self::Kick => "kick",
        }
    }
}

/// Parameters common to every moderation action
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct ActionParams {
    /// Duration in seconds for timed sanctions, `None` for permanent
    pub duration: Option<u32>,

    /// Reason for the action (for audit logs)
    pub reason: Option<String>,
}

impl ActionParams {
    /// Create new action parameters with the specified duration
    pub fn new(duration: Option<u32>) -> Self {
        Self {
            duration,
            reason: None,
        }
    }

    /// Create new action parameters with the specified duration and reason
    pub fn with_reason(duration: Option<u32>, reason: impl Into<String>) -> Self {
        Self {
            duration,
            reason: Some(reason.into()),
        }
    }

    /// Get the duration or a default value
    pub fn duration_or_default(&self) -> u32 {
        self.duration.unwrap_or(0)
    }

    /// Check if the action has a duration (i.e., is timed)
    pub fn has_duration(&self) -> bool {
        self.duration.is_some_and(|d| d > 0)
    }

    /// Absolute expiry for a sanction issued at `now`, `None` when permanent
    pub fn expires_at(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.duration
            .filter(|d| *d > 0)
            .map(|d| now + Duration::seconds(i64::from(d)))
    }

    /// The reason, or an empty string
    pub fn reason_or_default(&self) -> &str {
        self.reason.as_deref().unwrap_or_default()
    }
}

/// Moderation actions that can be fanned out across destinations
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum ModerationAction {
    /// Remove and keep out, optionally for a limited time
    Ban(ActionParams),

    /// Revoke the right to send messages, optionally for a limited time
    Mute(ActionParams),

    /// Remove, then immediately lift the resulting ban
    Kick(ActionParams),

    /// Lift a ban
    Unban(ActionParams),

    /// Restore the right to send messages
    Unmute(ActionParams),
}

impl ModerationAction {
    /// Get the type of this action
    #[must_use]
    pub fn get_type(&self) -> ModerationActionType {
        match self {
            Self::Ban(_) => ModerationActionType::Ban,
            Self::Mute(_) => ModerationActionType::Mute,
            Self::Kick(_) => ModerationActionType::Kick,
            Self::Unban(_) => ModerationActionType::Unban,
            Self::Unmute(_) => ModerationActionType::Unmute,
        }
    }

    /// Parameters of this action
    #[must_use]
    pub fn params(&self) -> &ActionParams {
        match self {
            Self::Ban(params)
            | Self::Mute(params)
            | Self::Kick(params)
            | Self::Unban(params)
            | Self::Unmute(params) => params,
        }
    }

    /// Kind of sanction this action creates, if any
    #[must_use]
    pub fn creates_sanction(&self) -> Option<SanctionKind> {
        match self {
            Self::Ban(_) => Some(SanctionKind::Ban),
            Self::Mute(_) => Some(SanctionKind::Mute),
            Self::Kick(_) | Self::Unban(_) | Self::Unmute(_) => None,
        }
    }

    /// Kind of sanction this action releases, if any
    #[must_use]
    pub fn releases_sanction(&self) -> Option<SanctionKind> {
        match self {
            Self::Unban(_) => Some(SanctionKind::Ban),
            Self::Unmute(_) => Some(SanctionKind::Mute),
            Self::Ban(_) | Self::Mute(_) | Self::Kick(_) => None,
        }
    }

    /// The action that undoes this one, if it can be undone
    #[must_use]
    pub fn reversal(&self) -> Option<Self> {
        match self {
            Self::Ban(params) => Some(Self::unban(params.reason.clone())),
            Self::Mute(params) => Some(Self::unmute(params.reason.clone())),
            Self::Kick(_) | Self::Unban(_) | Self::Unmute(_) => None,
        }
    }

    /// Create a new `Ban` action
    pub fn ban(duration: impl Into<Option<u32>>, reason: impl Into<Option<String>>) -> Self {
        Self::Ban(ActionParams {
            duration: duration.into(),
            reason: reason.into(),
        })
    }

    /// Create a new `Mute` action
    pub fn mute(duration: impl Into<Option<u32>>, reason: impl Into<Option<String>>) -> Self {
        Self::Mute(ActionParams {
            duration: duration.into(),
            reason: reason.into(),
        })
    }

    /// Create a new `Kick` action
    pub fn kick(reason: impl Into<Option<String>>) -> Self {
        Self::Kick(ActionParams {
            duration: None,
            reason: reason.into(),
        })
    }

    /// Create a new `Unban` action
    pub fn unban(reason: impl Into<Option<String>>) -> Self {
        Self::Unban(ActionParams {
            duration: None,
            reason: reason.into(),
        })
    }

    /// Create a new `Unmute` action
    pub fn unmute(reason: impl Into<Option<String>>) -> Self {
        Self::Unmute(ActionParams {
            duration: None,
            reason: reason.into(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_action_type() {
        assert_eq!(
            ModerationAction::ban(None, None).get_type(),
            ModerationActionType::Ban
        );
        assert_eq!(
            ModerationAction::mute(300, None).get_type(),
            ModerationActionType::Mute
        );
        assert_eq!(
            ModerationAction::kick(None).get_type(),
            ModerationActionType::Kick
        );
        assert_eq!(
            ModerationAction::unban(None).get_type(),
            ModerationActionType::Unban
        );
        assert_eq!(
            ModerationAction::unmute(None).get_type(),
            ModerationActionType::Unmute
        );
    }

    #[test]
    fn test_sanction_mapping() {
        assert_eq!(
            ModerationAction::ban(3600, None).creates_sanction(),
            Some(SanctionKind::Ban)
        );
        assert_eq!(
            ModerationAction::mute(None, None).creates_sanction(),
            Some(SanctionKind::Mute)
        );
        assert_eq!(ModerationAction::kick(None).creates_sanction(), None);
        assert_eq!(
            ModerationAction::unmute(None).releases_sanction(),
            Some(SanctionKind::Mute)
        );
        assert_eq!(ModerationAction::ban(None, None).releases_sanction(), None);
    }

    #[test]
    fn test_reversal() {
        let reason = Some("spam".to_string());
        assert_eq!(
            ModerationAction::ban(60, reason.clone()).reversal(),
            Some(ModerationAction::unban(reason.clone()))
        );
        assert_eq!(
            ModerationAction::mute(60, None).reversal(),
            Some(ModerationAction::unmute(None))
        );
        assert!(ModerationAction::kick(reason).reversal().is_none());
        assert!(ModerationAction::unban(None).reversal().is_none());
    }

    #[test]
    fn test_action_params() {
        let params = ActionParams::new(Some(300));
        assert!(params.has_duration());
        assert_eq!(params.duration_or_default(), 300);

        let params = ActionParams::new(Some(0));
        assert!(!params.has_duration());

        let params = ActionParams::new(None);
        assert!(!params.has_duration());
        assert_eq!(params.duration_or_default(), 0);
        assert_eq!(params.reason_or_default(), "");

        let params = ActionParams::with_reason(Some(300), "Test reason");
        assert_eq!(params.reason, Some("Test reason".to_string()));
        assert_eq!(params.reason_or_default(), "Test reason");
    }

    #[test]
    fn test_expires_at() {
        let now = Utc::now();
        assert_eq!(
            ActionParams::new(Some(1800)).expires_at(now),
            Some(now + Duration::seconds(1800))
        );
        assert_eq!(ActionParams::new(Some(0)).expires_at(now), None);
        assert_eq!(ActionParams::new(None).expires_at(now), None);
    }
}
