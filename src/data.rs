use std::{ops::Deref, sync::Arc};

use crate::config::{Config, ConfigError};
use crate::moderation::{
    ActionHandlerRegistry, AuthorizationCache, BackingStore, ChatTransport,
    ConcurrentActionExecutor, EligibilityEnforcer, ExpiryScheduler, ModerationService,
    NotificationTarget, Notifier, PermissionChecker, RateLimiter, RetryPolicy, StoreResult,
};
use poise::serenity_prelude::prelude::TypeMapKey;
use tracing::{info, warn};

/// Shared state handed to commands and event handlers
#[derive(Clone)]
pub struct Data(pub Arc<DataInner>);

impl TypeMapKey for Data {
    type Value = Data;
}

impl std::fmt::Debug for Data {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Data")
            .field("roots", &self.config.root_operators)
            .field("cache", &self.cache.status())
            .finish_non_exhaustive()
    }
}

impl Deref for Data {
    type Target = DataInner;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

/// Every long-lived component, wired once at startup
pub struct DataInner {
    pub config: Config,
    pub store: Arc<dyn BackingStore>,
    pub transport: Arc<dyn ChatTransport>,
    pub cache: Arc<AuthorizationCache>,
    pub limiter: Arc<RateLimiter>,
    pub permissions: Arc<PermissionChecker>,
    pub notifier: Arc<Notifier>,
    pub service: Arc<ModerationService>,
    pub eligibility: Arc<EligibilityEnforcer>,
    pub scheduler: Arc<ExpiryScheduler>,
    pub retry: RetryPolicy,
}

impl Data {
    /// Wire the moderation core over a store and a transport
    ///
    /// # Errors
    /// Returns an error if a scheduler cadence is invalid
    pub fn build(
        config: Config,
        store: Arc<dyn BackingStore>,
        transport: Arc<dyn ChatTransport>,
    ) -> Result<Self, ConfigError> {
        let retry = config.retry();
        let settings = config.scheduler.settings(config.cache.ttl())?;

        let cache = Arc::new(AuthorizationCache::new(config.cache.ttl()));
        let limiter = Arc::new(RateLimiter::new(
            config.moderation.rate_limit_per_window,
            config.rate_window(),
        ));
        let executor = Arc::new(ConcurrentActionExecutor::new(
            Arc::clone(&transport),
            Arc::new(ActionHandlerRegistry::new()),
            Arc::clone(&limiter),
            config.moderation.worker_pool_width,
        ));
        let permissions = Arc::new(PermissionChecker::new(
            config.root_operators.iter().copied(),
            config.moderation.destination_moderators_enabled,
            Arc::clone(&cache),
            Arc::clone(&store),
            Arc::clone(&transport),
            retry,
        ));
        let notifier = Arc::new(Notifier::new(
            Arc::clone(&transport),
            config.root_operators.iter().copied(),
        ));
        let service = Arc::new(ModerationService::new(
            Arc::clone(&store),
            Arc::clone(&cache),
            executor,
            Arc::clone(&notifier),
            retry,
        ));
        let eligibility = Arc::new(EligibilityEnforcer::new(
            Arc::clone(&permissions),
            Arc::clone(&cache),
            Arc::clone(&transport),
            Arc::clone(&notifier),
            config.scheduler.departure_cooldown(),
            config.scheduler.rewarn_interval(),
        ));
        let scheduler = Arc::new(
            ExpiryScheduler::new(
                Arc::clone(&store),
                Arc::clone(&cache),
                Arc::clone(&service),
                Arc::clone(&notifier),
                Arc::clone(&limiter),
                retry,
                settings,
            )
            .with_eligibility(Arc::clone(&eligibility)),
        );

        Ok(Self(Arc::new(DataInner {
            config,
            store,
            transport,
            cache,
            limiter,
            permissions,
            notifier,
            service,
            eligibility,
            scheduler,
            retry,
        })))
    }

    /// Apply saved runtime settings and fill the authorization cache
    ///
    /// Saved settings win over the config file. If they cannot be read the
    /// config file values stay in effect.
    ///
    /// # Errors
    /// Returns the store error if the initial load fails after retries
    pub async fn preload(&self) -> StoreResult<usize> {
        let settings = match self.store.load_settings().await {
            Ok(settings) => settings,
            Err(e) => {
                warn!(error = %e, "Failed to load runtime settings, using config file values");
                Default::default()
            }
        };

        let notification = settings.notification.or(self.config.notification);
        if let Some(target) = notification {
            self.apply_notification(target);
        }
        if let Some(enabled) = settings.destination_moderators_enabled {
            self.permissions.set_destination_moderators_enabled(enabled);
        }

        let count = self
            .cache
            .refresh_from(self.store.as_ref(), &self.retry)
            .await?
            .unwrap_or_default();
        info!(count, notification = ?notification, "Authorization cache preloaded");
        Ok(count)
    }

    /// Exempt the hosting group and send notifications to the channel
    pub fn apply_notification(&self, target: NotificationTarget) {
        self.cache.pin_notification(target.destination);
        self.notifier.set_channel(target.channel);
    }

    #[must_use]
    pub fn is_root(&self, actor: u64) -> bool {
        self.permissions.is_root(actor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::moderation::{
        Destination, DestinationInfo, EligibilityVerdict, MemoryStore, MockChatTransport,
        RuntimeSettings,
    };

    #[tokio::test]
    async fn test_build_and_preload() {
        let store = Arc::new(MemoryStore::new());
        store
            .authorize_destination(Destination::authorized(7, "Main", None))
            .await
            .unwrap();

        let config = Config {
            root_operators: vec![1],
            notification: Some(NotificationTarget::new(50, 900)),
            ..Config::default()
        };
        let data = Data::build(config, store, Arc::new(MockChatTransport::new())).unwrap();

        assert_eq!(data.preload().await.unwrap(), 1);
        assert!(data.cache.is_authorized(7).authorized);
        assert!(data.cache.is_notification(50));
        assert_eq!(data.notifier.channel(), Some(900));
        assert!(data.is_root(1));
        assert!(!data.is_root(2));
        assert_eq!(data.service.executor().width(), 5);
    }

    #[test]
    fn test_bad_cadence_fails_build() {
        let mut config = Config::default();
        config.scheduler.expiry_cadence = "5 4 * * *".to_string();
        let result = Data::build(
            config,
            Arc::new(MemoryStore::new()),
            Arc::new(MockChatTransport::new()),
        );
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_notification_group_exempt_while_messages_go_to_channel() {
        let mut transport = MockChatTransport::new();
        transport.expect_leave_destination().times(0);
        transport.expect_send_direct_message().times(0);
        transport
            .expect_send_message()
            .withf(|channel, text| *channel == 900 && text.contains("Operation failed"))
            .times(1)
            .returning(|_, _| Ok(()));

        let config = Config {
            root_operators: vec![1],
            notification: Some(NotificationTarget::new(50, 900)),
            ..Config::default()
        };
        let data = Data::build(config, Arc::new(MemoryStore::new()), Arc::new(transport)).unwrap();
        data.preload().await.unwrap();

        // Group 50 hosts channel 900 and is not in the authorized set
        let verdict = data
            .eligibility
            .check(&DestinationInfo::new(50, "Ops", None), Some(5))
            .await;
        assert_eq!(verdict, EligibilityVerdict::Exempt);

        data.notifier
            .operation_failed(
                crate::moderation::ModerationActionType::Ban,
                &crate::moderation::Subject::new(42, "x"),
                &crate::moderation::Operator::new(1, "root"),
                "boom",
            )
            .await;
    }

    #[tokio::test]
    async fn test_saved_settings_override_config() {
        let store = Arc::new(MemoryStore::new());
        store
            .save_settings(RuntimeSettings {
                notification: Some(NotificationTarget::new(60, 901)),
                destination_moderators_enabled: Some(false),
            })
            .await
            .unwrap();

        let config = Config {
            notification: Some(NotificationTarget::new(50, 900)),
            ..Config::default()
        };
        let data = Data::build(config, store, Arc::new(MockChatTransport::new())).unwrap();
        data.preload().await.unwrap();

        assert!(data.cache.is_notification(60));
        assert!(!data.cache.is_notification(50));
        assert_eq!(data.notifier.channel(), Some(901));
        assert!(!data.permissions.destination_moderators_enabled());
    }
}
