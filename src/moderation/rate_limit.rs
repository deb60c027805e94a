//! Per-destination throttle for outbound transport calls
//!
//! Each destination owns a token bucket that is refilled to capacity once per
//! window. Buckets are created on first use and dropped by [`RateLimiter::cleanup`]
//! after sitting idle.

use dashmap::DashMap;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, trace};

/// How often `wait` re-checks an empty bucket
const POLL_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy)]
struct Bucket {
    tokens: u32,
    last_refill: Instant,
    last_used: Instant,
}

/// Thread-safe token bucket per destination
#[derive(Debug)]
pub struct RateLimiter {
    buckets: DashMap<u64, Bucket>,
    capacity: u32,
    window: Duration,
}

impl RateLimiter {
    /// `capacity` operations per `window`, per destination
    #[must_use]
    pub fn new(capacity: u32, window: Duration) -> Self {
        Self {
            buckets: DashMap::new(),
            capacity: capacity.max(1),
            window,
        }
    }

    /// Take a token for `destination` if one is available
    pub fn allow(&self, destination: u64) -> bool {
        let now = Instant::now();
        let mut bucket = self.buckets.entry(destination).or_insert_with(|| Bucket {
            tokens: self.capacity,
            last_refill: now,
            last_used: now,
        });

        if now.duration_since(bucket.last_refill) >= self.window {
            bucket.tokens = self.capacity;
            bucket.last_refill = now;
        }
        bucket.last_used = now;

        if bucket.tokens > 0 {
            bucket.tokens -= 1;
            true
        } else {
            trace!(destination, "Rate limit reached");
            false
        }
    }

    /// Wait until a token for `destination` is available, then take it
    ///
    /// Never gives up; throttled calls are delayed, not dropped.
    pub async fn wait(&self, destination: u64) {
        let poll = POLL_INTERVAL.min(self.window);
        while !self.allow(destination) {
            tokio::time::sleep(poll).await;
        }
    }

    /// Drop buckets unused for longer than `idle`, returning how many were removed
    pub fn cleanup(&self, idle: Duration) -> usize {
        let now = Instant::now();
        let before = self.buckets.len();
        self.buckets
            .retain(|_, bucket| now.duration_since(bucket.last_used) <= idle);
        let removed = before.saturating_sub(self.buckets.len());
        if removed > 0 {
            debug!(removed, remaining = self.buckets.len(), "Cleaned up idle rate buckets");
        }
        removed
    }

    /// Number of live buckets
    #[must_use]
    pub fn len(&self) -> usize {
        self.buckets.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }
}
