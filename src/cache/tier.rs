//! Storage tiers.
//!
//! The memory tier is the fast path and cannot fail. Secondary tiers sit
//! behind [`CacheTier`] and may fail at any time; the manager logs those
//! failures and carries on from memory.

use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use moka::sync::Cache;

use super::{CacheEntry, CacheError, InvalidationPattern, TierConfig};

/// A secondary storage tier.
///
/// Implementations must be safe to call from any thread and should return
/// quickly; a slow tier slows every miss.
pub trait CacheTier: Send + Sync {
    /// Name used in logs.
    fn name(&self) -> &str;

    /// Fetch a stored entry. Expired entries may be returned; the caller
    /// checks expiry.
    fn get(&self, key: &str) -> Result<Option<CacheEntry>, CacheError>;

    fn set(&self, entry: CacheEntry) -> Result<(), CacheError>;

    /// Remove every entry matching `pattern`. Returns the number removed.
    fn invalidate(&self, pattern: &InvalidationPattern) -> Result<usize, CacheError>;

    fn clear(&self) -> Result<(), CacheError>;

    /// Remove expired entries. Returns the number removed.
    fn cleanup_expired(&self) -> Result<usize, CacheError>;
}

/// Result of a memory-tier lookup.
#[derive(Debug)]
pub(crate) enum Lookup {
    Hit(CacheEntry),
    /// An entry existed but had expired; it has been purged.
    Expired,
    Missing,
}

/// Primary in-process tier.
///
/// Every operation is a single DashMap step per key, so readers never see
/// a half-applied write.
#[derive(Debug, Default)]
pub(crate) struct MemoryTier {
    entries: DashMap<String, CacheEntry>,
}

impl MemoryTier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lookup(&self, key: &str, now: Instant) -> Lookup {
        match self.entries.get(key) {
            None => return Lookup::Missing,
            Some(entry) if !entry.is_expired_at(now) => {
                return Lookup::Hit(entry.value().clone());
            }
            Some(_) => {}
        }

        // Only purge if nobody replaced it in between.
        self.entries.remove_if(key, |_, entry| entry.is_expired_at(now));
        Lookup::Expired
    }

    pub fn contains_live(&self, key: &str, now: Instant) -> bool {
        self.entries
            .get(key)
            .is_some_and(|entry| !entry.is_expired_at(now))
    }

    pub fn insert(&self, entry: CacheEntry) {
        self.entries.insert(entry.key().to_string(), entry);
    }

    /// Insert unless a live entry already holds the key.
    pub fn insert_if_vacant(&self, entry: CacheEntry, now: Instant) -> bool {
        match self.entries.entry(entry.key().to_string()) {
            Entry::Occupied(mut slot) => {
                if slot.get().is_expired_at(now) {
                    slot.insert(entry);
                    true
                } else {
                    false
                }
            }
            Entry::Vacant(slot) => {
                slot.insert(entry);
                true
            }
        }
    }

    /// Copy a lower-tier entry into memory while `still_valid` holds.
    ///
    /// `still_valid` runs under the shard lock. An occupied slot is newer
    /// than the promoted copy and is left alone. Returns `still_valid`.
    pub fn promote(&self, entry: CacheEntry, still_valid: impl FnOnce() -> bool) -> bool {
        match self.entries.entry(entry.key().to_string()) {
            Entry::Vacant(slot) => {
                if !still_valid() {
                    return false;
                }
                slot.insert(entry);
                true
            }
            Entry::Occupied(_) => still_valid(),
        }
    }

    pub fn remove(&self, key: &str) -> bool {
        self.entries.remove(key).is_some()
    }

    pub fn retain_unmatched(&self, pattern: &InvalidationPattern) -> usize {
        let mut removed = 0;
        self.entries.retain(|key, _| {
            let matched = pattern.matches(key);
            if matched {
                removed += 1;
            }
            !matched
        });
        removed
    }

    pub fn purge_expired(&self, now: Instant) -> usize {
        let mut removed = 0;
        self.entries.retain(|_, entry| {
            let expired = entry.is_expired_at(now);
            if expired {
                removed += 1;
            }
            !expired
        });
        removed
    }

    pub fn clear(&self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn memory_usage(&self) -> u64 {
        self.entries
            .iter()
            .map(|entry| entry.value().size_bytes() as u64)
            .sum()
    }
}

/// Bounded secondary tier backed by Moka.
///
/// One tier can be shared by several managers, so a manager rebuilt for a
/// new scope starts warm. LRU-evicts once `max_capacity` is reached.
#[derive(Clone)]
pub struct MokaTier {
    name: Arc<str>,
    inner: Cache<String, CacheEntry>,
}

impl MokaTier {
    pub fn new(name: impl Into<Arc<str>>, config: &TierConfig) -> Self {
        let mut builder = Cache::builder().max_capacity(config.max_capacity);

        if let Some(tti) = config.tti {
            builder = builder.time_to_idle(tti);
        }

        Self {
            name: name.into(),
            inner: builder.build(),
        }
    }

    /// Get the number of entries in the tier.
    ///
    /// Note: This may lag behind concurrent operations.
    pub fn entry_count(&self) -> u64 {
        self.inner.run_pending_tasks();
        self.inner.entry_count()
    }

    fn remove_where(&self, predicate: impl Fn(&str, &CacheEntry) -> bool) -> usize {
        let doomed: Vec<Arc<String>> = self
            .inner
            .iter()
            .filter(|(key, entry)| predicate(key.as_str(), entry))
            .map(|(key, _)| key)
            .collect();

        for key in &doomed {
            self.inner.invalidate(key.as_str());
        }
        doomed.len()
    }
}

impl CacheTier for MokaTier {
    fn name(&self) -> &str {
        &self.name
    }

    fn get(&self, key: &str) -> Result<Option<CacheEntry>, CacheError> {
        Ok(self.inner.get(key))
    }

    fn set(&self, entry: CacheEntry) -> Result<(), CacheError> {
        self.inner.insert(entry.key().to_string(), entry);
        Ok(())
    }

    fn invalidate(&self, pattern: &InvalidationPattern) -> Result<usize, CacheError> {
        Ok(self.remove_where(|key, _| pattern.matches(key)))
    }

    fn clear(&self) -> Result<(), CacheError> {
        self.inner.invalidate_all();
        Ok(())
    }

    fn cleanup_expired(&self) -> Result<usize, CacheError> {
        let now = Instant::now();
        Ok(self.remove_where(|_, entry| entry.is_expired_at(now)))
    }
}

impl fmt::Debug for MokaTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MokaTier")
            .field("name", &self.name)
            .field("entry_count", &self.inner.entry_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    fn entry(key: &str, ttl: Duration) -> CacheEntry {
        CacheEntry::new(key, b"1".to_vec(), ttl)
    }

    #[test]
    fn test_memory_lookup_purges_expired() {
        let tier = MemoryTier::new();
        tier.insert(entry("a", Duration::ZERO));
        tier.insert(entry("b", Duration::from_secs(60)));

        let later = Instant::now() + Duration::from_millis(5);
        assert!(matches!(tier.lookup("a", later), Lookup::Expired));
        assert!(matches!(tier.lookup("a", later), Lookup::Missing));
        assert!(matches!(tier.lookup("b", later), Lookup::Hit(_)));
        assert_eq!(tier.len(), 1);
    }

    #[test]
    fn test_memory_insert_if_vacant() {
        let tier = MemoryTier::new();
        let now = Instant::now();
        assert!(tier.insert_if_vacant(entry("k", Duration::from_secs(60)), now));
        assert!(!tier.insert_if_vacant(entry("k", Duration::from_secs(60)), now));

        tier.insert(entry("stale", Duration::ZERO));
        let later = now + Duration::from_secs(1);
        assert!(tier.insert_if_vacant(entry("stale", Duration::from_secs(60)), later));
    }

    #[test]
    fn test_memory_promote_respects_check_and_newer_entries() {
        let tier = MemoryTier::new();
        let now = Instant::now();

        assert!(!tier.promote(entry("k", Duration::from_secs(60)), || false));
        assert!(!tier.contains_live("k", now));

        assert!(tier.promote(entry("k", Duration::from_secs(60)), || true));
        assert!(tier.contains_live("k", now));

        tier.insert(CacheEntry::new("fresh", b"2".to_vec(), Duration::from_secs(60)));
        assert!(tier.promote(entry("fresh", Duration::from_secs(60)), || true));
        let Lookup::Hit(kept) = tier.lookup("fresh", now) else {
            panic!("fresh entry missing");
        };
        assert_eq!(kept.payload(), b"2");
    }

    #[test]
    fn test_memory_retain_unmatched() {
        let tier = MemoryTier::new();
        for key in ["perm:7:org:1", "perm:7:org:2", "perm:9:org:1", "roles:7:org"] {
            tier.insert(entry(key, Duration::from_secs(60)));
        }

        let removed = tier.retain_unmatched(&InvalidationPattern::parse("perm:7:.*"));
        assert_eq!(removed, 2);
        assert!(tier.contains_live("perm:9:org:1", Instant::now()));
        assert!(tier.contains_live("roles:7:org", Instant::now()));
        assert!(!tier.contains_live("perm:7:org:1", Instant::now()));
    }

    #[test]
    fn test_memory_usage_counts_keys_and_payloads() {
        let tier = MemoryTier::new();
        tier.insert(entry("abc", Duration::from_secs(60)));
        assert_eq!(tier.memory_usage(), 4);
    }

    #[test]
    fn test_moka_tier_invalidate_and_cleanup() {
        let tier = MokaTier::new("secondary", &TierConfig::with_capacity(100).no_tti());
        tier.set(entry("perm:1:global", Duration::from_secs(60))).unwrap();
        tier.set(entry("perm:2:global", Duration::from_secs(60))).unwrap();
        tier.set(entry("auth:user:1", Duration::ZERO)).unwrap();

        let removed = tier
            .invalidate(&InvalidationPattern::prefix("perm:1:"))
            .unwrap();
        assert_eq!(removed, 1);
        assert!(tier.get("perm:1:global").unwrap().is_none());
        assert!(tier.get("perm:2:global").unwrap().is_some());

        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(tier.cleanup_expired().unwrap(), 1);
        assert!(tier.get("auth:user:1").unwrap().is_none());
    }
}
