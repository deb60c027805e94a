//! Moderation action handlers
//!
//! Each handler translates one action type into chat transport calls against a
//! single destination.

use crate::moderation::{
    ChatPermissions, ChatTransport, ModerationAction, ModerationActionType, ModerationError,
    ModerationResult,
};
use chrono::Utc;
use std::collections::HashMap;
use tracing::{info, warn};

/// Trait for handling moderation actions
#[async_trait::async_trait]
pub trait ActionHandler: Send + Sync {
    /// Apply the action to `subject` in `destination`
    async fn execute(
        &self,
        transport: &dyn ChatTransport,
        destination: u64,
        subject: u64,
        action: &ModerationAction,
    ) -> ModerationResult<()>;
}

/// Registry of action handlers
pub struct ActionHandlerRegistry {
    handlers: HashMap<ModerationActionType, Box<dyn ActionHandler>>,
}

impl Default for ActionHandlerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ActionHandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActionHandlerRegistry")
            .field("handlers", &self.handlers.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl ActionHandlerRegistry {
    /// Create a new registry with all handlers registered
    #[must_use]
    pub fn new() -> Self {
        let mut registry = Self {
            handlers: HashMap::new(),
        };

        registry.register(ModerationActionType::Ban, Box::new(BanHandler));
        registry.register(ModerationActionType::Unban, Box::new(UnbanHandler));
        registry.register(ModerationActionType::Mute, Box::new(MuteHandler));
        registry.register(ModerationActionType::Unmute, Box::new(UnmuteHandler));
        registry.register(ModerationActionType::Kick, Box::new(KickHandler));

        registry
    }

    /// Register a handler for an action type
    pub fn register(&mut self, action_type: ModerationActionType, handler: Box<dyn ActionHandler>) {
        self.handlers.insert(action_type, handler);
    }

    /// Get a handler for an action type
    #[must_use]
    pub fn get(&self, action_type: ModerationActionType) -> Option<&dyn ActionHandler> {
        self.handlers.get(&action_type).map(AsRef::as_ref)
    }

    /// Execute an action against one destination
    ///
    /// # Errors
    ///
    /// Returns a `ModerationError` if no handler is registered for the action
    /// type or the transport rejects the call.
    pub async fn execute(
        &self,
        transport: &dyn ChatTransport,
        destination: u64,
        subject: u64,
        action: &ModerationAction,
    ) -> ModerationResult<()> {
        let action_type = action.get_type();
        if let Some(handler) = self.get(action_type) {
            handler.execute(transport, destination, subject, action).await
        } else {
            Err(ModerationError::ValidationFailed(format!(
                "No handler registered for action type: {action_type}"
            )))
        }
    }
}

fn mismatch(expected: ModerationActionType, action: &ModerationAction) -> ModerationError {
    ModerationError::ValidationFailed(format!(
        "Expected {expected} action, got {}",
        action.get_type()
    ))
}

/// Handler for the Ban action type
struct BanHandler;

#[async_trait::async_trait]
impl ActionHandler for BanHandler {
    async fn execute(
        &self,
        transport: &dyn ChatTransport,
        destination: u64,
        subject: u64,
        action: &ModerationAction,
    ) -> ModerationResult<()> {
        let ModerationAction::Ban(params) = action else {
            return Err(mismatch(ModerationActionType::Ban, action));
        };

        transport.remove_member(destination, subject).await?;
        info!(
            destination,
            subject,
            duration = ?params.duration,
            "Banned member"
        );
        Ok(())
    }
}

/// Handler for the Unban action type
struct UnbanHandler;

#[async_trait::async_trait]
impl ActionHandler for UnbanHandler {
    async fn execute(
        &self,
        transport: &dyn ChatTransport,
        destination: u64,
        subject: u64,
        action: &ModerationAction,
    ) -> ModerationResult<()> {
        if !matches!(action, ModerationAction::Unban(_)) {
            return Err(mismatch(ModerationActionType::Unban, action));
        }

        transport.unban_member(destination, subject).await?;
        info!(destination, subject, "Unbanned member");
        Ok(())
    }
}

/// Handler for the Mute action type
struct MuteHandler;

#[async_trait::async_trait]
impl ActionHandler for MuteHandler {
    async fn execute(
        &self,
        transport: &dyn ChatTransport,
        destination: u64,
        subject: u64,
        action: &ModerationAction,
    ) -> ModerationResult<()> {
        let ModerationAction::Mute(params) = action else {
            return Err(mismatch(ModerationActionType::Mute, action));
        };

        let until = params.expires_at(Utc::now());
        transport
            .apply_restriction(destination, subject, ChatPermissions::muted(), until)
            .await?;
        info!(destination, subject, until = ?until, "Muted member");
        Ok(())
    }
}

/// Handler for the Unmute action type
struct UnmuteHandler;

#[async_trait::async_trait]
impl ActionHandler for UnmuteHandler {
    async fn execute(
        &self,
        transport: &dyn ChatTransport,
        destination: u64,
        subject: u64,
        action: &ModerationAction,
    ) -> ModerationResult<()> {
        if !matches!(action, ModerationAction::Unmute(_)) {
            return Err(mismatch(ModerationActionType::Unmute, action));
        }

        transport.lift_restriction(destination, subject).await?;
        info!(destination, subject, "Unmuted member");
        Ok(())
    }
}

/// Handler for the Kick action type
///
/// Removal leaves a ban behind on most platforms, so a successful kick is
/// followed by an unban. The member must be able to rejoin.
struct KickHandler;

#[async_trait::async_trait]
impl ActionHandler for KickHandler {
    async fn execute(
        &self,
        transport: &dyn ChatTransport,
        destination: u64,
        subject: u64,
        action: &ModerationAction,
    ) -> ModerationResult<()> {
        if !matches!(action, ModerationAction::Kick(_)) {
            return Err(mismatch(ModerationActionType::Kick, action));
        }

        transport.remove_member(destination, subject).await?;

        if let Err(e) = transport.unban_member(destination, subject).await {
            warn!(
                destination,
                subject,
                error = %e,
                "Kick succeeded but the compensating unban failed"
            );
        }

        info!(destination, subject, "Kicked member");
        Ok(())
    }
}
