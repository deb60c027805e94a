//! Time-boxed mirror of the authorized destination set
//!
//! The whole set is one snapshot with a single refresh timestamp. Once that
//! epoch is older than the TTL, every lookup reports "not cached" and the caller
//! goes to the backing store.

use crate::moderation::{BackingStore, RetryPolicy, StoreResult};
use parking_lot::RwLock;
use std::collections::HashSet;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info};

/// Result of a cache lookup
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheLookup {
    pub authorized: bool,
    /// `false` when the epoch has expired or was never filled
    pub cached: bool,
}

#[derive(Debug, Default)]
struct Snapshot {
    destinations: HashSet<u64>,
    refreshed_at: Option<Instant>,
    epoch: u64,
}

/// Point-in-time view of the cache for operators
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheStatus {
    pub entries: usize,
    pub epoch: u64,
    pub age: Option<Duration>,
    pub ttl: Duration,
    pub notification: Option<u64>,
}

impl CacheStatus {
    #[must_use]
    pub fn is_fresh(&self) -> bool {
        self.age.is_some_and(|age| age < self.ttl)
    }
}

impl fmt::Display for CacheStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Authorized destinations: {}", self.entries)?;
        writeln!(f, "Epoch: {}", self.epoch)?;
        match self.age {
            Some(age) => writeln!(
                f,
                "Last refresh: {}s ago ({})",
                age.as_secs(),
                if self.is_fresh() { "fresh" } else { "expired" }
            )?,
            None => writeln!(f, "Last refresh: never")?,
        }
        writeln!(f, "TTL: {}s", self.ttl.as_secs())?;
        match self.notification {
            Some(id) => write!(f, "Notification destination: {id}"),
            None => write!(f, "Notification destination: not set"),
        }
    }
}

/// Clears the refresh flag when dropped
struct RefreshGuard<'a>(&'a AtomicBool);

impl Drop for RefreshGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Cached authorization set plus the pinned notification destination
#[derive(Debug)]
pub struct AuthorizationCache {
    snapshot: RwLock<Snapshot>,
    notification: RwLock<Option<u64>>,
    ttl: Duration,
    refreshing: AtomicBool,
}

impl AuthorizationCache {
    #[must_use]
    pub fn new(ttl: Duration) -> Self {
        Self {
            snapshot: RwLock::new(Snapshot::default()),
            notification: RwLock::new(None),
            ttl,
            refreshing: AtomicBool::new(false),
        }
    }

    fn is_fresh(&self, snapshot: &Snapshot) -> bool {
        snapshot
            .refreshed_at
            .is_some_and(|at| at.elapsed() < self.ttl)
    }

    /// Look up a destination; a stale epoch is always a miss
    pub fn is_authorized(&self, destination: u64) -> CacheLookup {
        let snapshot = self.snapshot.read();
        if !self.is_fresh(&snapshot) {
            return CacheLookup {
                authorized: false,
                cached: false,
            };
        }
        CacheLookup {
            authorized: snapshot.destinations.contains(&destination),
            cached: true,
        }
    }

    /// Replace the whole snapshot and start a new epoch
    pub fn set_all(&self, destinations: impl IntoIterator<Item = u64>) {
        let destinations: HashSet<u64> = destinations.into_iter().collect();
        let count = destinations.len();

        let epoch = {
            let mut snapshot = self.snapshot.write();
            snapshot.destinations = destinations;
            snapshot.refreshed_at = Some(Instant::now());
            snapshot.epoch += 1;
            snapshot.epoch
        };

        debug!(count, epoch, "Authorization cache replaced");
    }

    /// Add one destination without renewing the epoch
    pub fn add(&self, destination: u64) {
        self.snapshot.write().destinations.insert(destination);
    }

    /// Remove one destination without renewing the epoch
    pub fn remove(&self, destination: u64) {
        self.snapshot.write().destinations.remove(&destination);
    }

    pub fn pin_notification(&self, destination: u64) {
        *self.notification.write() = Some(destination);
        info!(destination, "Pinned notification destination");
    }

    #[must_use]
    pub fn notification(&self) -> Option<u64> {
        *self.notification.read()
    }

    /// Whether `destination` is the pinned notification destination
    #[must_use]
    pub fn is_notification(&self, destination: u64) -> bool {
        self.notification() == Some(destination)
    }

    /// Expire the current epoch so the next lookup misses
    pub fn invalidate(&self) {
        let mut snapshot = self.snapshot.write();
        snapshot.refreshed_at = None;
        snapshot.epoch += 1;
        debug!(epoch = snapshot.epoch, "Authorization cache invalidated");
    }

    #[must_use]
    pub fn epoch(&self) -> u64 {
        self.snapshot.read().epoch
    }

    /// The authorized set, only while the epoch is fresh
    #[must_use]
    pub fn snapshot(&self) -> Option<Vec<u64>> {
        let snapshot = self.snapshot.read();
        self.is_fresh(&snapshot)
            .then(|| snapshot.destinations.iter().copied().collect())
    }

    #[must_use]
    pub fn status(&self) -> CacheStatus {
        let snapshot = self.snapshot.read();
        CacheStatus {
            entries: snapshot.destinations.len(),
            epoch: snapshot.epoch,
            age: snapshot.refreshed_at.map(|at| at.elapsed()),
            ttl: self.ttl,
            notification: self.notification(),
        }
    }

    /// Reload the snapshot from the store
    ///
    /// Returns `Ok(None)` when another refresh is already running.
    ///
    /// # Errors
    /// Returns the store error after retries are exhausted; the old snapshot is kept
    pub async fn refresh_from(
        &self,
        store: &dyn BackingStore,
        retry: &RetryPolicy,
    ) -> StoreResult<Option<usize>> {
        if self.refreshing.swap(true, Ordering::AcqRel) {
            debug!("Authorization cache refresh already in progress");
            return Ok(None);
        }
        let _guard = RefreshGuard(&self.refreshing);

        let destinations = retry
            .run("list_authorized_destinations", move || {
                store.list_authorized_destinations()
            })
            .await?;
        let count = destinations.len();
        self.set_all(destinations.into_iter().map(|d| d.id));

        info!(count, "Authorization cache refreshed");
        Ok(Some(count))
    }
}
