//! Backing store for destinations, moderators, sanctions and the audit log
//!
//! The core only talks to [`BackingStore`]. [`MemoryStore`] is the bundled
//! implementation: `DashMap`s in memory, optionally mirrored to YAML snapshots.
//! Each write only rewrites the snapshot it touched, and the audit log is
//! appended to rather than rewritten.

use crate::moderation::{
    AuditEntry, AuditQuery, Destination, Moderator, RuntimeSettings, Sanction, SanctionKind,
    SanctionStatus, StoreError, StoreResult,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use parking_lot::Mutex;
use serde::{Serialize, de::DeserializeOwned};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

const DESTINATIONS_FILE: &str = "destinations.yaml";
const MODERATORS_FILE: &str = "moderators.yaml";
const SANCTIONS_FILE: &str = "sanctions.yaml";
const AUDIT_FILE: &str = "audit.yaml";
const SETTINGS_FILE: &str = "settings.yaml";

/// Durable rows the moderation core reads and writes
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait BackingStore: Send + Sync {
    /// All destinations currently holding an authorization grant
    async fn list_authorized_destinations(&self) -> StoreResult<Vec<Destination>>;

    async fn is_destination_authorized(&self, id: u64) -> StoreResult<bool>;

    async fn create_sanction(&self, sanction: Sanction) -> StoreResult<()>;

    /// Release an active sanction
    ///
    /// Returns `Ok(false)` without touching the row when the sanction is
    /// already released.
    async fn mark_released(
        &self,
        sanction_id: &str,
        reason: &str,
        actor_id: Option<u64>,
    ) -> StoreResult<bool>;

    /// Active sanctions whose expiry is at or before `now`
    async fn list_expired_active_sanctions(&self, now: DateTime<Utc>)
    -> StoreResult<Vec<Sanction>>;

    async fn is_reachable(&self) -> bool;

    async fn is_global_moderator(&self, actor: u64) -> StoreResult<bool>;

    /// Grant global moderator rights, returning `false` if already granted
    async fn add_global_moderator(&self, moderator: Moderator) -> StoreResult<bool>;

    /// Revoke global moderator rights, returning whether they existed
    async fn remove_global_moderator(&self, actor: u64) -> StoreResult<bool>;

    async fn list_global_moderators(&self) -> StoreResult<Vec<Moderator>>;

    async fn authorize_destination(&self, destination: Destination) -> StoreResult<()>;

    /// Remove an authorization grant, returning whether one existed
    async fn revoke_destination(&self, id: u64) -> StoreResult<bool>;

    async fn update_destination_metadata(
        &self,
        id: u64,
        display_name: &str,
        handle: Option<String>,
    ) -> StoreResult<()>;

    async fn active_sanctions_for(
        &self,
        subject: u64,
        kind: SanctionKind,
    ) -> StoreResult<Vec<Sanction>>;

    async fn record_audit(&self, entry: AuditEntry) -> StoreResult<()>;

    /// Matching audit entries, newest first, at most `limit` of them
    async fn query_audit(&self, query: AuditQuery, limit: usize) -> StoreResult<Vec<AuditEntry>>;

    async fn load_settings(&self) -> StoreResult<RuntimeSettings>;

    async fn save_settings(&self, settings: RuntimeSettings) -> StoreResult<()>;
}

/// Retry for transient store failures with linear backoff
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first
    pub max_attempts: u32,
    /// Delay before retry `n` is `base_delay * n`
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(100),
        }
    }
}

impl RetryPolicy {
    #[must_use]
    pub fn delay_for(&self, attempt: u32) -> Duration {
        self.base_delay * attempt
    }

    /// Run `op` until it succeeds, fails permanently, or attempts run out
    ///
    /// # Errors
    /// Returns the last error seen
    pub async fn run<T, F, Fut>(&self, operation: &str, mut op: F) -> StoreResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = StoreResult<T>>,
    {
        let mut attempt = 1;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_transient() && attempt < self.max_attempts => {
                    warn!(
                        operation,
                        attempt,
                        max_attempts = self.max_attempts,
                        error = %e,
                        "Transient store failure, retrying"
                    );
                    tokio::time::sleep(self.delay_for(attempt)).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

/// In-memory store with optional YAML snapshots
#[derive(Debug, Default)]
pub struct MemoryStore {
    destinations: DashMap<u64, Destination>,
    moderators: DashMap<u64, Moderator>,
    sanctions: DashMap<String, Sanction>,
    audit: Mutex<Vec<AuditEntry>>,
    settings: Mutex<RuntimeSettings>,
    data_dir: Option<PathBuf>,
    /// Serializes snapshot writers
    save_lock: tokio::sync::Mutex<()>,
}

impl MemoryStore {
    /// Memory-only store
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Load snapshots from `data_dir`, creating it if missing
    ///
    /// # Errors
    /// Returns an error if the directory cannot be created or a snapshot is malformed
    pub async fn load(data_dir: impl AsRef<Path>) -> StoreResult<Self> {
        let dir = data_dir.as_ref().to_path_buf();
        tokio::fs::create_dir_all(&dir).await?;

        let store = Self {
            data_dir: Some(dir.clone()),
            ..Self::default()
        };

        if let Some(destinations) = read_snapshot::<Vec<Destination>>(&dir, DESTINATIONS_FILE).await? {
            for destination in destinations {
                store.destinations.insert(destination.id, destination);
            }
        }
        if let Some(moderators) = read_snapshot::<Vec<Moderator>>(&dir, MODERATORS_FILE).await? {
            for moderator in moderators {
                store.moderators.insert(moderator.id, moderator);
            }
        }
        if let Some(sanctions) = read_snapshot::<Vec<Sanction>>(&dir, SANCTIONS_FILE).await? {
            for sanction in sanctions {
                store.sanctions.insert(sanction.id.clone(), sanction);
            }
        }
        if let Some(audit) = read_snapshot::<Vec<AuditEntry>>(&dir, AUDIT_FILE).await? {
            *store.audit.lock() = audit;
        }
        if let Some(settings) = read_snapshot::<RuntimeSettings>(&dir, SETTINGS_FILE).await? {
            *store.settings.lock() = settings;
        }

        info!(
            dir = %dir.display(),
            destinations = store.destinations.len(),
            moderators = store.moderators.len(),
            sanctions = store.sanctions.len(),
            "Loaded store snapshots"
        );

        Ok(store)
    }

    /// Rewrite one snapshot from a view taken under the writer lock
    async fn persist<T, F>(&self, file: &str, view: F) -> StoreResult<()>
    where
        T: Serialize,
        F: FnOnce() -> T,
    {
        let Some(dir) = &self.data_dir else {
            return Ok(());
        };
        let _guard = self.save_lock.lock().await;
        let value = view();
        write_snapshot(dir, file, &value).await?;
        debug!(file, "Saved store snapshot");
        Ok(())
    }

    async fn save_destinations(&self) -> StoreResult<()> {
        self.persist(DESTINATIONS_FILE, || {
            let mut destinations: Vec<Destination> =
                self.destinations.iter().map(|e| e.value().clone()).collect();
            destinations.sort_by_key(|d| d.id);
            destinations
        })
        .await
    }

    async fn save_moderators(&self) -> StoreResult<()> {
        self.persist(MODERATORS_FILE, || {
            let mut moderators: Vec<Moderator> =
                self.moderators.iter().map(|e| e.value().clone()).collect();
            moderators.sort_by_key(|m| m.id);
            moderators
        })
        .await
    }

    async fn save_sanctions(&self) -> StoreResult<()> {
        self.persist(SANCTIONS_FILE, || {
            let mut sanctions: Vec<Sanction> =
                self.sanctions.iter().map(|e| e.value().clone()).collect();
            sanctions.sort_by_key(|s| s.created_at);
            sanctions
        })
        .await
    }

    /// Append one entry to the audit snapshot
    ///
    /// A one-element YAML sequence appended to a sequence is still a sequence,
    /// so the file never has to be rewritten.
    async fn append_audit(&self, entry: &AuditEntry) -> StoreResult<()> {
        let Some(dir) = &self.data_dir else {
            return Ok(());
        };
        let yaml = serde_yaml::to_string(std::slice::from_ref(entry))?;

        let _guard = self.save_lock.lock().await;
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(dir.join(AUDIT_FILE))
            .await?;
        file.write_all(yaml.as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }

    pub fn get_sanction(&self, id: &str) -> Option<Sanction> {
        self.sanctions.get(id).map(|s| s.value().clone())
    }

    pub fn audit_entries(&self) -> Vec<AuditEntry> {
        self.audit.lock().clone()
    }
}

async fn read_snapshot<T: DeserializeOwned>(dir: &Path, file: &str) -> StoreResult<Option<T>> {
    match tokio::fs::read_to_string(dir.join(file)).await {
        Ok(content) => Ok(Some(serde_yaml::from_str(&content)?)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

async fn write_snapshot<T: Serialize>(dir: &Path, file: &str, value: &T) -> StoreResult<()> {
    let yaml = serde_yaml::to_string(value)?;
    tokio::fs::write(dir.join(file), yaml).await?;
    Ok(())
}

#[async_trait]
impl BackingStore for MemoryStore {
    async fn list_authorized_destinations(&self) -> StoreResult<Vec<Destination>> {
        Ok(self
            .destinations
            .iter()
            .filter_map(|entry| {
                let destination = entry.value();
                destination.authorized.then(|| destination.clone())
            })
            .collect())
    }

    async fn is_destination_authorized(&self, id: u64) -> StoreResult<bool> {
        Ok(self.destinations.get(&id).is_some_and(|d| d.authorized))
    }

    async fn create_sanction(&self, sanction: Sanction) -> StoreResult<()> {
        match self.sanctions.entry(sanction.id.clone()) {
            Entry::Occupied(_) => {
                return Err(StoreError::Conflict(format!(
                    "sanction {} already exists",
                    sanction.id
                )));
            }
            Entry::Vacant(entry) => {
                entry.insert(sanction);
            }
        }
        self.save_sanctions().await
    }

    async fn mark_released(
        &self,
        sanction_id: &str,
        reason: &str,
        actor_id: Option<u64>,
    ) -> StoreResult<bool> {
        let released = {
            let Some(mut sanction) = self.sanctions.get_mut(sanction_id) else {
                return Err(StoreError::NotFound(sanction_id.to_string()));
            };
            // The shard lock is held across the status check and the write
            sanction.status == SanctionStatus::Active
                && sanction.release(reason, actor_id, Utc::now()).is_ok()
        };

        if released {
            self.save_sanctions().await?;
        }
        Ok(released)
    }

    async fn list_expired_active_sanctions(
        &self,
        now: DateTime<Utc>,
    ) -> StoreResult<Vec<Sanction>> {
        Ok(self
            .sanctions
            .iter()
            .filter_map(|entry| {
                let sanction = entry.value();
                sanction.is_due_for_release(now).then(|| sanction.clone())
            })
            .collect())
    }

    async fn is_reachable(&self) -> bool {
        match &self.data_dir {
            Some(dir) => tokio::fs::metadata(dir).await.is_ok_and(|m| m.is_dir()),
            None => true,
        }
    }

    async fn is_global_moderator(&self, actor: u64) -> StoreResult<bool> {
        Ok(self.moderators.contains_key(&actor))
    }

    async fn add_global_moderator(&self, moderator: Moderator) -> StoreResult<bool> {
        let added = match self.moderators.entry(moderator.id) {
            Entry::Occupied(_) => false,
            Entry::Vacant(entry) => {
                entry.insert(moderator);
                true
            }
        };
        if added {
            self.save_moderators().await?;
        }
        Ok(added)
    }

    async fn remove_global_moderator(&self, actor: u64) -> StoreResult<bool> {
        let existed = self.moderators.remove(&actor).is_some();
        if existed {
            self.save_moderators().await?;
        }
        Ok(existed)
    }

    async fn list_global_moderators(&self) -> StoreResult<Vec<Moderator>> {
        let mut moderators: Vec<Moderator> =
            self.moderators.iter().map(|e| e.value().clone()).collect();
        moderators.sort_by_key(|m| m.added_at);
        Ok(moderators)
    }

    async fn authorize_destination(&self, destination: Destination) -> StoreResult<()> {
        self.destinations.insert(destination.id, destination);
        self.save_destinations().await
    }

    async fn revoke_destination(&self, id: u64) -> StoreResult<bool> {
        let existed = self.destinations.remove(&id).is_some();
        if existed {
            self.save_destinations().await?;
        }
        Ok(existed)
    }

    async fn update_destination_metadata(
        &self,
        id: u64,
        display_name: &str,
        handle: Option<String>,
    ) -> StoreResult<()> {
        {
            let Some(mut destination) = self.destinations.get_mut(&id) else {
                return Err(StoreError::NotFound(format!("destination {id}")));
            };
            destination.display_name = display_name.to_string();
            destination.handle = handle;
        }
        self.save_destinations().await
    }

    async fn active_sanctions_for(
        &self,
        subject: u64,
        kind: SanctionKind,
    ) -> StoreResult<Vec<Sanction>> {
        Ok(self
            .sanctions
            .iter()
            .filter_map(|entry| {
                let sanction = entry.value();
                (sanction.subject.id == subject
                    && sanction.kind == kind
                    && sanction.status == SanctionStatus::Active)
                    .then(|| sanction.clone())
            })
            .collect())
    }

    async fn record_audit(&self, entry: AuditEntry) -> StoreResult<()> {
        self.append_audit(&entry).await?;
        self.audit.lock().push(entry);
        Ok(())
    }

    async fn query_audit(&self, query: AuditQuery, limit: usize) -> StoreResult<Vec<AuditEntry>> {
        let audit = self.audit.lock();
        Ok(audit
            .iter()
            .rev()
            .filter(|entry| query.matches(entry))
            .take(limit)
            .cloned()
            .collect())
    }

    async fn load_settings(&self) -> StoreResult<RuntimeSettings> {
        Ok(*self.settings.lock())
    }

    async fn save_settings(&self, settings: RuntimeSettings) -> StoreResult<()> {
        *self.settings.lock() = settings;
        self.persist(SETTINGS_FILE, || *self.settings.lock()).await
    }
}
