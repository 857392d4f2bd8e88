//! Cache manager - the single owner of cached state.
//!
//! Every public operation is fail-open: errors are logged and degrade to a
//! cache miss or a skipped write. Callers never see a `Result` from here;
//! whatever they cached can always be recomputed from the source of truth.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use super::keys::{self, DataClass, PermissionScope};
use super::stats::StatsRecorder;
use super::tier::{Lookup, MemoryTier};
use super::{
    CacheConfig, CacheEntry, CacheError, CacheStats, CacheTier, InvalidationPattern, MokaTier,
};

/// Per-call read options.
#[derive(Debug, Clone, Copy, Default)]
pub struct GetOptions {
    /// Answer from memory only.
    pub skip_secondary: bool,
}

/// Per-call write options.
#[derive(Debug, Clone, Copy, Default)]
pub struct SetOptions {
    /// Overrides the class/global default TTL.
    pub ttl: Option<Duration>,
    /// Keep a live existing entry instead of overwriting it.
    pub skip_if_exists: bool,
}

impl SetOptions {
    #[must_use]
    pub fn skip_if_exists(mut self) -> Self {
        self.skip_if_exists = true;
        self
    }
}

/// Orders secondary-tier promotions against invalidations.
///
/// A reader snapshots the epoch before reading the secondary tier and only
/// promotes if no invalidation started or ran in between. The final check
/// happens under the memory shard lock, so an invalidation either sees the
/// promoted entry or the reader sees the new epoch.
#[derive(Debug, Default)]
struct InvalidationFence {
    epoch: AtomicU64,
    active: AtomicU64,
}

impl InvalidationFence {
    fn begin(&self) -> FenceGuard<'_> {
        self.active.fetch_add(1, Ordering::SeqCst);
        self.epoch.fetch_add(1, Ordering::SeqCst);
        FenceGuard(self)
    }

    /// Epoch to promote under, or `None` while an invalidation runs.
    fn snapshot(&self) -> Option<u64> {
        let epoch = self.epoch.load(Ordering::SeqCst);
        (self.active.load(Ordering::SeqCst) == 0).then_some(epoch)
    }

    fn unchanged_since(&self, snapshot: Option<u64>) -> bool {
        snapshot.is_some_and(|epoch| {
            self.active.load(Ordering::SeqCst) == 0 && self.epoch.load(Ordering::SeqCst) == epoch
        })
    }
}

struct FenceGuard<'a>(&'a InvalidationFence);

impl Drop for FenceGuard<'_> {
    fn drop(&mut self) {
        self.0.active.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Tiered key-value cache with TTL, statistics and pattern invalidation.
///
/// Construct one per consumer scope and share it through an `Arc`.
pub struct CacheManager {
    config: CacheConfig,
    memory: MemoryTier,
    secondary: Option<Arc<dyn CacheTier>>,
    stats: StatsRecorder,
    fence: InvalidationFence,
    cleanup_task: Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl CacheManager {
    /// Create a manager. Builds a moka secondary tier if the config asks
    /// for one.
    pub fn new(config: CacheConfig) -> Self {
        let secondary = config
            .secondary
            .as_ref()
            .map(|tier| Arc::new(MokaTier::new("secondary", tier)) as Arc<dyn CacheTier>);

        Self::build(config, secondary)
    }

    /// Create a manager on top of an existing secondary tier.
    pub fn with_secondary(config: CacheConfig, secondary: Arc<dyn CacheTier>) -> Self {
        Self::build(config, Some(secondary))
    }

    fn build(config: CacheConfig, secondary: Option<Arc<dyn CacheTier>>) -> Self {
        info!(
            "Cache manager initialized (default ttl {:?}, secondary tier: {})",
            config.default_ttl,
            secondary.as_ref().map_or("none", |tier| tier.name())
        );

        Self {
            config,
            memory: MemoryTier::new(),
            secondary,
            stats: StatsRecorder::default(),
            fence: InvalidationFence::default(),
            cleanup_task: Mutex::new(None),
            closed: AtomicBool::new(false),
        }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Get a copy of the value stored under `key`.
    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        self.get_with(key, GetOptions::default())
    }

    pub fn get_with<T: DeserializeOwned>(&self, key: &str, options: GetOptions) -> Option<T> {
        let started = Instant::now();
        let value = self.lookup(key, options);
        let elapsed = started.elapsed();

        match value {
            Some(_) => {
                self.stats.record_hit(elapsed);
                debug!("Cache hit for {}", key);
            }
            None => {
                self.stats.record_miss(elapsed);
                debug!("Cache miss for {}", key);
            }
        }
        value
    }

    fn lookup<T: DeserializeOwned>(&self, key: &str, options: GetOptions) -> Option<T> {
        let now = Instant::now();

        let entry = match self.memory.lookup(key, now) {
            Lookup::Hit(entry) => Some(entry),
            Lookup::Expired => {
                self.stats.record_expired(1);
                debug!("Cache entry {} expired", key);
                None
            }
            Lookup::Missing => None,
        };

        let entry = match entry {
            Some(entry) => entry,
            None if options.skip_secondary => return None,
            None => self.lookup_secondary(key, now)?,
        };

        match entry.decode() {
            Ok(value) => Some(value),
            Err(e) => {
                warn!("Cache read failure, treating as miss: {}", e);
                self.memory.remove(key);
                None
            }
        }
    }

    /// Read through to the secondary tier, promoting live hits into memory.
    ///
    /// A value read while an invalidation was under way is neither promoted
    /// nor returned.
    fn lookup_secondary(&self, key: &str, now: Instant) -> Option<CacheEntry> {
        let tier = self.secondary.as_ref()?;
        let snapshot = self.fence.snapshot();

        match tier.get(key) {
            Ok(Some(entry)) if !entry.is_expired_at(now) => {
                if self
                    .memory
                    .promote(entry.clone(), || self.fence.unchanged_since(snapshot))
                {
                    debug!("Promoted {} from tier '{}'", key, tier.name());
                    Some(entry)
                } else {
                    debug!("{} raced an invalidation, treating as miss", key);
                    None
                }
            }
            Ok(_) => None,
            Err(e) => {
                warn!("Cache read failure in tier '{}': {}", tier.name(), e);
                None
            }
        }
    }

    /// Store `value` under `key`.
    ///
    /// `ttl` falls back to the key's class default, then to the configured
    /// global default.
    pub fn set<T: Serialize + ?Sized>(&self, key: &str, value: &T, ttl: Option<Duration>) {
        self.set_with(key, value, SetOptions { ttl, ..Default::default() });
    }

    /// Store with options. Returns whether the value was written.
    pub fn set_with<T: Serialize + ?Sized>(
        &self,
        key: &str,
        value: &T,
        options: SetOptions,
    ) -> bool {
        let payload = match serde_json::to_vec(value) {
            Ok(payload) => payload,
            Err(source) => {
                let e = CacheError::Serialize {
                    key: key.to_string(),
                    source,
                };
                warn!("Cache write failure, skipping: {}", e);
                return false;
            }
        };

        let ttl = self.resolve_ttl(key, options.ttl);
        let entry = CacheEntry::new(key, payload, ttl);

        if options.skip_if_exists {
            if !self.memory.insert_if_vacant(entry.clone(), Instant::now()) {
                debug!("Live entry for {} kept (skip_if_exists)", key);
                return false;
            }
        } else {
            self.memory.insert(entry.clone());
        }

        if let Some(tier) = &self.secondary
            && let Err(e) = tier.set(entry)
        {
            warn!("Cache write failure in tier '{}': {}", tier.name(), e);
        }

        debug!("Cached {} for {:?}", key, ttl);
        true
    }

    fn resolve_ttl(&self, key: &str, ttl: Option<Duration>) -> Duration {
        ttl.or_else(|| DataClass::from_key(key).map(DataClass::default_ttl))
            .unwrap_or(self.config.default_ttl)
    }

    /// Remove every key matching `pattern` from all tiers.
    ///
    /// Returns the number of entries removed from memory.
    pub fn invalidate(&self, pattern: impl Into<InvalidationPattern>) -> usize {
        let pattern = pattern.into();
        let _fence = self.fence.begin();

        if let Some(tier) = &self.secondary
            && let Err(e) = tier.invalidate(&pattern)
        {
            warn!(
                "Invalidation failure in tier '{}' for '{}': {}",
                tier.name(),
                pattern,
                e
            );
        }
        let removed = self.memory.retain_unmatched(&pattern);

        debug!("Invalidated {} entries matching '{}'", removed, pattern);
        removed
    }

    /// Empty every tier. Statistics are kept.
    pub fn clear(&self) {
        let _fence = self.fence.begin();

        if let Some(tier) = &self.secondary
            && let Err(e) = tier.clear()
        {
            warn!("Failed to clear tier '{}': {}", tier.name(), e);
        }
        self.memory.clear();

        info!("Cache cleared");
    }

    pub fn stats(&self) -> CacheStats {
        self.stats
            .snapshot(self.memory.memory_usage(), self.memory.len())
    }

    /// Zero the hit/miss counters.
    pub fn reset_stats(&self) {
        self.stats.reset();
    }

    /// Whether a live entry exists in memory. Does not touch statistics.
    pub fn contains_key(&self, key: &str) -> bool {
        self.memory.contains_live(key, Instant::now())
    }

    /// Number of entries held in memory, including not-yet-purged expired
    /// ones.
    pub fn len(&self) -> usize {
        self.memory.len()
    }

    pub fn is_empty(&self) -> bool {
        self.memory.len() == 0
    }

    /// Claim the auth warm-up for `user_id`.
    ///
    /// Returns `true` for exactly one caller until the marker expires or
    /// [`finish_warming`](Self::finish_warming) is called; that caller does
    /// the backend fetch while everyone else waits for the cache.
    pub fn warm_auth_cache(&self, user_id: &str) -> bool {
        self.begin_warming(&keys::user_auth(user_id))
    }

    /// Claim the permission warm-up for `user_id` in `scope`.
    pub fn warm_permission_cache(&self, user_id: &str, scope: &PermissionScope) -> bool {
        self.begin_warming(&keys::user_permissions(user_id, scope))
    }

    /// Place a warming marker for `key` unless one is live.
    pub fn begin_warming(&self, key: &str) -> bool {
        let marker = CacheEntry::new(
            keys::warming(key),
            b"true".to_vec(),
            self.config.warming_ttl,
        );
        let claimed = self.memory.insert_if_vacant(marker, Instant::now());

        if claimed {
            debug!("Warming {}", key);
        } else {
            debug!("{} already warming, skipping", key);
        }
        claimed
    }

    pub fn is_warming(&self, key: &str) -> bool {
        self.memory.contains_live(&keys::warming(key), Instant::now())
    }

    /// Drop the warming marker for `key` once it is populated.
    pub fn finish_warming(&self, key: &str) {
        self.memory.remove(&keys::warming(key));
    }

    /// Sweep expired entries out of every tier. Returns the number removed
    /// from memory.
    pub fn cleanup_expired_entries(&self) -> usize {
        let removed = self.memory.purge_expired(Instant::now());
        self.stats.record_expired(removed);

        if let Some(tier) = &self.secondary {
            match tier.cleanup_expired() {
                Ok(count) if count > 0 => {
                    debug!("Swept {} expired entries from tier '{}'", count, tier.name())
                }
                Ok(_) => {}
                Err(e) => warn!("Cleanup failure in tier '{}': {}", tier.name(), e),
            }
        }

        if removed > 0 {
            debug!("Swept {} expired entries", removed);
        }
        removed
    }

    /// Start the periodic expiry sweep, if configured.
    ///
    /// Needs a tokio runtime. The task holds only a weak reference and
    /// ends on its own once the manager is dropped.
    pub fn spawn_cleanup_task(self: &Arc<Self>) {
        let Some(period) = self.config.cleanup_interval else {
            return;
        };
        if period.is_zero() {
            warn!("Cache cleanup interval is zero, cleanup task not started");
            return;
        }
        if self.closed.load(Ordering::Acquire) {
            warn!("Cache manager is closed, not starting cleanup");
            return;
        }

        let mut slot = self.cleanup_task.lock();
        if slot.is_some() {
            return;
        }

        let Ok(runtime) = Handle::try_current() else {
            warn!("No tokio runtime, cache cleanup task not started");
            return;
        };

        let manager = Arc::downgrade(self);
        *slot = Some(runtime.spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // First tick completes immediately.
            ticker.tick().await;

            loop {
                ticker.tick().await;
                let Some(manager) = manager.upgrade() else {
                    break;
                };
                manager.cleanup_expired_entries();
            }
        }));

        info!("Cache cleanup task started (every {:?})", period);
    }

    /// Stop background work. Safe to call more than once.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);

        if let Some(handle) = self.cleanup_task.lock().take() {
            handle.abort();
            info!("Cache cleanup task stopped");
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

impl Default for CacheManager {
    fn default() -> Self {
        Self::new(CacheConfig::default())
    }
}

impl Drop for CacheManager {
    fn drop(&mut self) {
        if let Some(handle) = self.cleanup_task.get_mut().take() {
            handle.abort();
        }
    }
}

impl fmt::Debug for CacheManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheManager")
            .field("entries", &self.memory.len())
            .field(
                "secondary",
                &self.secondary.as_ref().map(|tier| tier.name().to_string()),
            )
            .field("closed", &self.is_closed())
            .finish()
    }
}
