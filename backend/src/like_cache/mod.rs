//! Write-back cache for image like counts
//!
//! Likes are counted in memory and folded into the durable store by a
//! periodic reconcile cycle, so a burst of likes on one image costs one
//! `UPDATE` per cycle instead of one per like. The logical count of a key is
//! always `base_count + pending_delta`; moving a delta between the two halves
//! never changes what callers see.
//!
//! Keys with unflushed likes (dirty) and keys whose delta is being written
//! (in flight) are pinned in memory. Only clean entries are evicted, either
//! in batches when the cache is full or by the idle cleanup cycle.
//!
//! A key whose persisted count is being loaded after a miss is pinned as
//! well. The load runs without the lock, so if another caller seeded, flushed
//! and evicted the key in the meantime the loaded count would be stale;
//! pinning keeps that caller's entry in memory until the load settles.

mod error;

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::Duration;

use futures::stream::{self, StreamExt};
use gallery_storage::images::ImageStore;
use metrics::counter;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub use error::{LikeCacheError, LikeCacheResult};

use crate::scheduler::spawn_periodic;

/// Like cache tuning
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LikeCacheConfig {
    /// Entry count at which inserting a new key evicts clean entries first
    pub max_entries: usize,
    /// Number of clean entries evicted when the cache is full
    pub eviction_batch: usize,
    /// Period of the reconcile cycle
    pub flush_interval: Duration,
    /// Period of the idle cleanup cycle
    pub cleanup_interval: Duration,
    /// Clean entries untouched for longer than this are dropped by cleanup
    pub max_idle: Duration,
    /// Store updates issued concurrently by one reconcile cycle
    pub flush_concurrency: usize,
}

impl Default for LikeCacheConfig {
    fn default() -> Self {
        Self {
            max_entries: 100_000,
            eviction_batch: 100,
            flush_interval: Duration::from_secs(1),
            cleanup_interval: Duration::from_secs(2 * 60),
            max_idle: Duration::from_secs(5 * 60),
            flush_concurrency: 16,
        }
    }
}

/// Summary of one reconcile cycle
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ReconcileReport {
    /// Keys whose delta was persisted
    pub flushed: usize,
    /// Keys whose delta was put back for the next cycle
    pub requeued: usize,
    /// Keys dropped because their row no longer exists
    pub dropped: usize,
}

#[derive(Debug, Clone, Copy)]
struct CacheEntry {
    base_count: i64,
    pending_delta: i64,
    last_access: Instant,
}

impl CacheEntry {
    const fn total(&self) -> i64 {
        self.base_count + self.pending_delta
    }
}

#[derive(Debug, Default)]
struct CacheState {
    entries: HashMap<String, CacheEntry>,
    dirty: HashSet<String>,
    in_flight: HashSet<String>,
}

impl CacheState {
    fn record_like(&mut self, key: &str, now: Instant) -> Option<i64> {
        let entry = self.entries.get_mut(key)?;
        entry.pending_delta += 1;
        entry.last_access = now;
        let total = entry.total();

        self.dirty.insert(key.to_string());
        Some(total)
    }

    fn is_pinned(&self, key: &str, seeding: &HashMap<String, usize>) -> bool {
        self.dirty.contains(key) || self.in_flight.contains(key) || seeding.contains_key(key)
    }

    /// Removes up to `count` clean, unpinned entries, least recently accessed first
    ///
    /// Ties on access time are broken by key.
    fn evict_oldest_clean(&mut self, count: usize, seeding: &HashMap<String, usize>) -> usize {
        let mut candidates: Vec<(Instant, &String)> = self
            .entries
            .iter()
            .filter(|(key, _)| !self.is_pinned(key, seeding))
            .map(|(key, entry)| (entry.last_access, key))
            .collect();

        if candidates.len() > count {
            candidates.select_nth_unstable(count);
            candidates.truncate(count);
        }

        let victims: Vec<String> = candidates.into_iter().map(|(_, key)| key.clone()).collect();
        for key in &victims {
            self.entries.remove(key);
        }

        victims.len()
    }

    /// Moves every dirty delta into its base count and marks the key in flight
    fn take_dirty(&mut self) -> Vec<(String, i64)> {
        // A key still in flight from an overlapping cycle waits for the next one
        let ready: Vec<String> = self
            .dirty
            .iter()
            .filter(|key| !self.in_flight.contains(*key))
            .cloned()
            .collect();

        let mut batch = Vec::with_capacity(ready.len());
        for key in ready {
            self.dirty.remove(&key);
            let Some(entry) = self.entries.get_mut(&key) else {
                continue;
            };

            let delta = std::mem::take(&mut entry.pending_delta);
            if delta == 0 {
                continue;
            }
            entry.base_count += delta;

            self.in_flight.insert(key.clone());
            batch.push((key, delta));
        }

        batch
    }

    /// Moves a delta that failed to persist back into the pending half
    fn requeue(&mut self, key: &str, delta: i64) -> bool {
        let Some(entry) = self.entries.get_mut(key) else {
            return false;
        };
        entry.base_count -= delta;
        entry.pending_delta += delta;

        self.dirty.insert(key.to_string());
        true
    }
}

/// Outstanding seed loads per key
///
/// Kept outside [`CacheState`] so a [`SeedPin`] can be released from `Drop`
/// without awaiting the cache lock.
#[derive(Debug, Default)]
struct SeedPins(StdMutex<HashMap<String, usize>>);

impl SeedPins {
    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, usize>> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn pin(&self, key: &str) -> SeedPin<'_> {
        *self.lock().entry(key.to_string()).or_default() += 1;
        SeedPin {
            pins: self,
            key: key.to_string(),
        }
    }
}

/// Keeps a key out of eviction until dropped, including when the load is cancelled
struct SeedPin<'a> {
    pins: &'a SeedPins,
    key: String,
}

impl Drop for SeedPin<'_> {
    fn drop(&mut self) {
        let mut pins = self.pins.lock();
        if let Some(count) = pins.get_mut(&self.key) {
            *count -= 1;
            if *count == 0 {
                pins.remove(&self.key);
            }
        }
    }
}

/// In-memory write-back cache of like counts
pub struct LikeCache {
    store: Arc<dyn ImageStore>,
    config: LikeCacheConfig,
    state: Mutex<CacheState>,
    seeding: SeedPins,
}

impl LikeCache {
    /// Creates an empty like cache backed by `store`
    #[must_use]
    pub fn new(store: Arc<dyn ImageStore>, config: LikeCacheConfig) -> Self {
        Self {
            store,
            config,
            state: Mutex::new(CacheState::default()),
            seeding: SeedPins::default(),
        }
    }

    /// Records one like and returns the current logical count
    ///
    /// On a cache miss the persisted count is read first; the lock is not
    /// held during that read, but the key is pinned for its duration. If a
    /// concurrent caller seeded the same key in the meantime, its entry is
    /// used and the freshly read count discarded.
    ///
    /// # Errors
    ///
    /// Returns `LikeCacheError::SeedLoad` if the key is not cached and its
    /// persisted count cannot be read. No entry is created in that case.
    pub async fn increment(&self, key: &str) -> LikeCacheResult<i64> {
        let pin = {
            let mut state = self.state.lock().await;
            if let Some(total) = state.record_like(key, Instant::now()) {
                return Ok(total);
            }
            // Pinned under the lock, so the key cannot be evicted between the miss and the load
            self.seeding.pin(key)
        };

        let loaded = self.store.liked_count(key).await;

        let mut state = self.state.lock().await;
        drop(pin);
        let base_count = loaded.map_err(|source| LikeCacheError::SeedLoad {
            key: key.to_string(),
            source,
        })?;

        if !state.entries.contains_key(key) {
            if state.entries.len() >= self.config.max_entries {
                let seeding = self.seeding.lock();
                let evicted = state.evict_oldest_clean(self.config.eviction_batch, &seeding);
                drop(seeding);
                debug!(evicted, "Like cache full, evicted clean entries");
            }

            state.entries.insert(
                key.to_string(),
                CacheEntry {
                    base_count,
                    pending_delta: 0,
                    last_access: Instant::now(),
                },
            );
        }

        Ok(state.record_like(key, Instant::now()).unwrap_or(base_count + 1))
    }

    /// Persists every pending delta
    ///
    /// The lock is held only to snapshot the dirty keys and, afterwards, to
    /// settle the results; store updates run outside it. A delta whose update
    /// fails transiently is put back and retried on the next cycle.
    pub async fn reconcile(&self) -> ReconcileReport {
        let batch = self.state.lock().await.take_dirty();
        if batch.is_empty() {
            return ReconcileReport::default();
        }

        let store = &self.store;
        let outcomes: Vec<_> = stream::iter(batch)
            .map(|(key, delta)| async move {
                let result = store.add_liked_count(&key, delta).await;
                (key, delta, result)
            })
            .buffer_unordered(self.config.flush_concurrency.max(1))
            .collect()
            .await;

        let mut report = ReconcileReport::default();
        let mut state = self.state.lock().await;

        for (key, delta, result) in outcomes {
            state.in_flight.remove(&key);

            match result {
                Ok(()) => {
                    report.flushed += 1;
                    counter!("likes_flushed").increment(1);
                }
                Err(err) if err.is_transient() => {
                    report.requeued += 1;
                    counter!("likes_flush_failed").increment(1);
                    warn!(key = %key, delta, error = %err, "Failed to persist likes, retrying next cycle");

                    if !state.requeue(&key, delta) {
                        error!(key = %key, delta, "Entry vanished while in flight, likes lost");
                    }
                }
                Err(err) => {
                    report.dropped += 1;
                    counter!("likes_flush_failed").increment(1);
                    error!(key = %key, delta, error = %err, "Dropping likes for missing image");

                    state.dirty.remove(&key);
                    state.entries.remove(&key);
                }
            }
        }

        debug!(?report, "Like cache reconciled");
        report
    }

    /// Drops clean entries idle for longer than `max_idle`
    ///
    /// Returns the number of entries removed.
    pub async fn cleanup_idle(&self) -> usize {
        let now = Instant::now();
        let max_idle = self.config.max_idle;

        let mut guard = self.state.lock().await;
        let seeding = self.seeding.lock();
        let CacheState {
            entries,
            dirty,
            in_flight,
        } = &mut *guard;

        let before = entries.len();
        entries.retain(|key, entry| {
            dirty.contains(key)
                || in_flight.contains(key)
                || seeding.contains_key(key)
                || now.duration_since(entry.last_access) <= max_idle
        });
        drop(seeding);
        let removed = before - entries.len();

        if removed > 0 {
            debug!(removed, remaining = entries.len(), "Removed idle like cache entries");
        }
        removed
    }

    /// Number of cached keys
    pub async fn len(&self) -> usize {
        self.state.lock().await.entries.len()
    }

    /// Whether no key is cached
    pub async fn is_empty(&self) -> bool {
        self.state.lock().await.entries.is_empty()
    }

    /// Whether `key` is cached
    pub async fn contains(&self, key: &str) -> bool {
        self.state.lock().await.entries.contains_key(key)
    }

    /// Number of keys with unflushed likes
    pub async fn dirty_len(&self) -> usize {
        self.state.lock().await.dirty.len()
    }

    /// Starts the reconcile and idle cleanup schedulers
    #[must_use]
    pub fn start(self: &Arc<Self>) -> LikeCacheHandle {
        let shutdown = CancellationToken::new();

        let cache = Arc::clone(self);
        let reconcile = spawn_periodic(
            "like_cache_reconcile",
            self.config.flush_interval,
            shutdown.clone(),
            move || {
                let cache = Arc::clone(&cache);
                async move {
                    cache.reconcile().await;
                }
            },
        );

        let cache = Arc::clone(self);
        let cleanup = spawn_periodic(
            "like_cache_cleanup",
            self.config.cleanup_interval,
            shutdown.clone(),
            move || {
                let cache = Arc::clone(&cache);
                async move {
                    cache.cleanup_idle().await;
                }
            },
        );

        LikeCacheHandle {
            cache: Arc::clone(self),
            shutdown,
            schedulers: vec![reconcile, cleanup],
        }
    }
}

/// Running schedulers of a [`LikeCache`]
pub struct LikeCacheHandle {
    cache: Arc<LikeCache>,
    shutdown: CancellationToken,
    schedulers: Vec<JoinHandle<()>>,
}

impl LikeCacheHandle {
    /// Stops both schedulers and runs one final reconcile
    pub async fn shutdown(self) -> ReconcileReport {
        self.shutdown.cancel();
        for handle in self.schedulers {
            if let Err(e) = handle.await {
                error!("Like cache scheduler task error: {}", e);
            }
        }

        let report = self.cache.reconcile().await;
        info!(?report, "Like cache flushed on shutdown");
        report
    }
}
