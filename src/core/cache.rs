//! In-memory TTL cache for upstream responses.
//!
//! A plain map behind a `RwLock`: reads take shared access, writes and the
//! sweeper take exclusive access. Entries past their expiry report a miss
//! even before the sweeper removes them. There is no LRU bound; the cache is
//! strictly TTL-governed.
use std::{
    collections::HashMap,
    sync::{Arc, RwLock},
    time::{Duration, Instant},
};

use bytes::Bytes;
use tokio_util::sync::CancellationToken;

/// Expiry policy for a single insert.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ttl {
    /// Use the cache-wide default TTL.
    Default,
    /// The entry never expires.
    Never,
    /// Expire after the given duration.
    For(Duration),
}

#[derive(Debug, Clone)]
struct CacheEntry {
    value: Bytes,
    /// None means the entry never expires.
    expires_at: Option<Instant>,
}

impl CacheEntry {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| now > at)
    }
}

/// Concurrent TTL map used by the HTTP forwarder. Cheap to clone; clones
/// share the same storage and sweeper.
#[derive(Clone)]
pub struct ResponseCache {
    entries: Arc<RwLock<HashMap<String, CacheEntry>>>,
    default_ttl: Duration,
    sweeper: CancellationToken,
}

impl ResponseCache {
    /// Create a cache with the given default TTL and start its background
    /// sweeper. The sweeper runs at the default TTL interval and removes
    /// entries whose expiry has passed.
    pub fn new(default_ttl: Duration) -> Self {
        let cache = Self {
            entries: Arc::new(RwLock::new(HashMap::new())),
            default_ttl,
            sweeper: CancellationToken::new(),
        };

        let entries = cache.entries.clone();
        let token = cache.sweeper.clone();
        let interval = default_ttl.max(Duration::from_secs(1));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => Self::sweep(&entries),
                }
            }
            tracing::debug!("cache sweeper stopped");
        });

        cache
    }

    /// Insert with the default TTL.
    pub fn set(&self, key: impl Into<String>, value: Bytes) {
        self.set_with_ttl(key, value, Ttl::Default);
    }

    /// Insert with an explicit expiry policy.
    pub fn set_with_ttl(&self, key: impl Into<String>, value: Bytes, ttl: Ttl) {
        let expires_at = match ttl {
            Ttl::Default => Some(Instant::now() + self.default_ttl),
            Ttl::Never => None,
            Ttl::For(d) => Some(Instant::now() + d),
        };

        if let Ok(mut entries) = self.entries.write() {
            entries.insert(key.into(), CacheEntry { value, expires_at });
        }
    }

    /// Look up a key. Expired-but-not-yet-swept entries report a miss.
    pub fn get(&self, key: &str) -> Option<Bytes> {
        let entries = self.entries.read().ok()?;
        let entry = entries.get(key)?;
        if entry.is_expired(Instant::now()) {
            return None;
        }
        Some(entry.value.clone())
    }

    pub fn delete(&self, key: &str) {
        if let Ok(mut entries) = self.entries.write() {
            entries.remove(key);
        }
    }

    pub fn clear(&self) {
        if let Ok(mut entries) = self.entries.write() {
            entries.clear();
        }
    }

    pub fn count(&self) -> usize {
        self.entries.read().map(|e| e.len()).unwrap_or(0)
    }

    /// Stop the background sweeper. Lookups and inserts keep working.
    pub fn close(&self) {
        self.sweeper.cancel();
    }

    fn sweep(entries: &RwLock<HashMap<String, CacheEntry>>) {
        let now = Instant::now();
        if let Ok(mut entries) = entries.write() {
            entries.retain(|_, entry| !entry.is_expired(now));
        }
    }
}
