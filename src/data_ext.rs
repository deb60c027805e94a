//! Root-operator administration on top of [`Data`]
//!
//! Global moderators, the authorized group list, the notification target, the
//! group-local moderator switch, and operation log queries. Commands stay thin
//! and call through this trait.

use crate::data::Data;
use crate::moderation::{AuditEntry, AuditQuery, Moderator, NotificationTarget, StoreResult};
use std::fmt::Write as _;
use tracing::info;

/// Most audit entries a single query returns
pub const MAX_LOG_ENTRIES: usize = 25;
pub const DEFAULT_LOG_ENTRIES: usize = 10;

/// Administration operations for root operators
#[allow(async_fn_in_trait)]
pub trait DataAdminExt {
    /// Grant global moderator rights; `false` if already granted
    async fn add_moderator(&self, id: u64, display_name: &str, added_by: u64) -> StoreResult<bool>;

    /// Revoke global moderator rights; `false` if there were none
    async fn remove_moderator(&self, id: u64) -> StoreResult<bool>;

    /// Every global moderator, one per line
    async fn moderators_report(&self) -> StoreResult<String>;

    /// Every authorized group, one per line
    async fn groups_report(&self) -> StoreResult<String>;

    /// Persist and apply a new notification target
    async fn set_notification(&self, target: NotificationTarget) -> StoreResult<()>;

    /// Persist and apply the group-local moderator switch
    async fn set_destination_moderators(&self, enabled: bool) -> StoreResult<()>;

    /// The newest matching operation log entries
    async fn audit_report(&self, query: AuditQuery, limit: Option<usize>) -> StoreResult<String>;
}

impl DataAdminExt for Data {
    async fn add_moderator(&self, id: u64, display_name: &str, added_by: u64) -> StoreResult<bool> {
        let added = self
            .store
            .add_global_moderator(Moderator::new(id, display_name, added_by))
            .await?;
        if added {
            info!(moderator = id, added_by, "Global moderator added");
        }
        Ok(added)
    }

    async fn remove_moderator(&self, id: u64) -> StoreResult<bool> {
        let removed = self.store.remove_global_moderator(id).await?;
        if removed {
            info!(moderator = id, "Global moderator removed");
        }
        Ok(removed)
    }

    async fn moderators_report(&self) -> StoreResult<String> {
        let moderators = self.store.list_global_moderators().await?;
        if moderators.is_empty() {
            return Ok("No global moderators".to_string());
        }

        let mut text = format!("Global moderators ({}):", moderators.len());
        for moderator in &moderators {
            let _ = write!(
                text,
                "\n- {} ({}), added by {} on {}",
                moderator.display_name,
                moderator.id,
                moderator.added_by,
                moderator.added_at.format("%Y-%m-%d"),
            );
        }
        Ok(text)
    }

    async fn groups_report(&self) -> StoreResult<String> {
        let mut groups = self.store.list_authorized_destinations().await?;
        if groups.is_empty() {
            return Ok("No authorized groups".to_string());
        }
        groups.sort_by_key(|g| g.id);

        let mut text = format!("Authorized groups ({}):", groups.len());
        for group in &groups {
            let _ = write!(text, "\n- {} ({})", group.display_name, group.id);
            if let Some(handle) = &group.handle {
                let _ = write!(text, " [{handle}]");
            }
        }
        Ok(text)
    }

    async fn set_notification(&self, target: NotificationTarget) -> StoreResult<()> {
        let mut settings = self.store.load_settings().await?;
        settings.notification = Some(target);
        self.store.save_settings(settings).await?;
        self.apply_notification(target);
        Ok(())
    }

    async fn set_destination_moderators(&self, enabled: bool) -> StoreResult<()> {
        let mut settings = self.store.load_settings().await?;
        settings.destination_moderators_enabled = Some(enabled);
        self.store.save_settings(settings).await?;
        self.permissions.set_destination_moderators_enabled(enabled);
        Ok(())
    }

    async fn audit_report(&self, query: AuditQuery, limit: Option<usize>) -> StoreResult<String> {
        let limit = limit
            .unwrap_or(DEFAULT_LOG_ENTRIES)
            .clamp(1, MAX_LOG_ENTRIES);
        let entries = self.store.query_audit(query, limit).await?;
        if entries.is_empty() {
            return Ok("No matching log entries".to_string());
        }

        let mut text = format!("Last {} log entries:", entries.len());
        for entry in &entries {
            let _ = write!(text, "\n{}", audit_line(entry));
        }
        Ok(text)
    }
}

fn audit_line(entry: &AuditEntry) -> String {
    let outcome = if entry.success {
        format!("ok {}/{}", entry.succeeded, entry.succeeded + entry.failed)
    } else {
        format!(
            "failed: {}",
            entry.error.as_deref().unwrap_or("no destination succeeded")
        )
    };
    format!(
        "`{}` {} {} ({}) by {} ({}), {outcome}",
        entry.created_at.format("%Y-%m-%d %H:%M"),
        entry.action,
        entry.subject.display_name,
        entry.subject.id,
        entry.operator.display_name,
        entry.operator.id,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::moderation::{
        ActionParams, AuditEntry, Destination, MemoryStore, MockChatTransport,
        ModerationActionType, Operator, Origin, Subject,
    };
    use crate::moderation::BackingStore;
    use std::sync::Arc;

    fn data(store: Arc<MemoryStore>) -> Data {
        let config = Config {
            root_operators: vec![1],
            ..Config::default()
        };
        Data::build(config, store, Arc::new(MockChatTransport::new())).unwrap()
    }

    #[tokio::test]
    async fn test_moderator_admin() {
        let store = Arc::new(MemoryStore::new());
        let data = data(Arc::clone(&store));

        assert_eq!(data.moderators_report().await.unwrap(), "No global moderators");
        assert!(data.add_moderator(5, "helper", 1).await.unwrap());
        assert!(!data.add_moderator(5, "helper", 1).await.unwrap());

        let report = data.moderators_report().await.unwrap();
        assert!(report.starts_with("Global moderators (1):"));
        assert!(report.contains("helper (5), added by 1"));

        // The ladder sees the new moderator straight away
        assert!(data.permissions.check(5, None).await.allowed);

        assert!(data.remove_moderator(5).await.unwrap());
        assert!(!data.remove_moderator(5).await.unwrap());
        assert!(!data.permissions.check(5, None).await.allowed);
    }

    #[tokio::test]
    async fn test_groups_report() {
        let store = Arc::new(MemoryStore::new());
        let data = data(Arc::clone(&store));
        assert_eq!(data.groups_report().await.unwrap(), "No authorized groups");

        store
            .authorize_destination(Destination::authorized(9, "Second", Some("second".to_string())))
            .await
            .unwrap();
        store
            .authorize_destination(Destination::authorized(3, "First", None))
            .await
            .unwrap();

        assert_eq!(
            data.groups_report().await.unwrap(),
            "Authorized groups (2):\n- First (3)\n- Second (9) [second]"
        );
    }

    #[tokio::test]
    async fn test_set_notification_exempts_group_and_targets_channel() {
        let store = Arc::new(MemoryStore::new());
        let data = data(Arc::clone(&store));

        data.set_notification(NotificationTarget::new(50, 900))
            .await
            .unwrap();

        assert!(data.cache.is_notification(50));
        assert!(!data.cache.is_notification(900));
        assert_eq!(data.notifier.channel(), Some(900));
        assert!(data.permissions.is_destination_authorized(50).await);

        let saved = store.load_settings().await.unwrap();
        assert_eq!(saved.notification, Some(NotificationTarget::new(50, 900)));
    }

    #[tokio::test]
    async fn test_destination_moderator_switch_persists() {
        let store = Arc::new(MemoryStore::new());
        let data = data(Arc::clone(&store));
        assert!(data.permissions.destination_moderators_enabled());

        data.set_destination_moderators(false).await.unwrap();
        assert!(!data.permissions.destination_moderators_enabled());
        assert_eq!(
            store.load_settings().await.unwrap().destination_moderators_enabled,
            Some(false)
        );

        // A restart picks the switch back up
        let restarted = self::data(Arc::clone(&store));
        assert!(restarted.permissions.destination_moderators_enabled());
        restarted.preload().await.unwrap();
        assert!(!restarted.permissions.destination_moderators_enabled());
    }

    #[tokio::test]
    async fn test_audit_report() {
        let store = Arc::new(MemoryStore::new());
        let data = data(Arc::clone(&store));
        assert_eq!(
            data.audit_report(AuditQuery::Failed, None).await.unwrap(),
            "No matching log entries"
        );

        for subject in 1..=30 {
            let mut entry = AuditEntry::new(
                ModerationActionType::Ban,
                Subject::new(subject, format!("m{subject}")),
                Origin::new(Some(7), "Main"),
                Operator::new(1, "root"),
                &ActionParams::new(None),
            )
            .with_counts(0, 1);
            entry.error = Some("forbidden".to_string());
            store.record_audit(entry).await.unwrap();
        }

        let report = data.audit_report(AuditQuery::Failed, Some(100)).await.unwrap();
        assert!(report.starts_with("Last 25 log entries:"));
        assert_eq!(report.lines().count(), 26);
        assert!(report.lines().nth(1).unwrap().contains("m30 (30) by root (1), failed: forbidden"));

        let report = data.audit_report(AuditQuery::Subject(3), None).await.unwrap();
        assert!(report.starts_with("Last 1 log entries:"));
    }
}
