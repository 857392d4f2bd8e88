//! Hit/miss statistics.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::Serialize;

/// Snapshot of cache statistics.
#[derive(Debug, Clone, Default, Serialize)]
pub struct CacheStats {
    pub total_requests: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    /// `cache_hits / total_requests`, or 0 without requests.
    pub hit_rate: f64,
    /// Mean time spent in `get`.
    pub avg_response_time: Duration,
    /// Approximate bytes held by the memory tier (keys + payloads).
    pub memory_usage: u64,
    /// Live and not-yet-purged entries in the memory tier.
    pub entry_count: usize,
    /// Entries removed because their TTL passed.
    pub expired_evictions: u64,
}

/// Lock-free counters behind [`CacheStats`].
///
/// Counters only grow until [`StatsRecorder::reset`] is called.
#[derive(Debug, Default)]
pub(crate) struct StatsRecorder {
    hits: AtomicU64,
    misses: AtomicU64,
    response_nanos: AtomicU64,
    expired: AtomicU64,
}

impl StatsRecorder {
    pub fn record_hit(&self, elapsed: Duration) {
        self.hits.fetch_add(1, Ordering::Relaxed);
        self.add_response_time(elapsed);
    }

    pub fn record_miss(&self, elapsed: Duration) {
        self.misses.fetch_add(1, Ordering::Relaxed);
        self.add_response_time(elapsed);
    }

    pub fn record_expired(&self, count: usize) {
        if count > 0 {
            self.expired.fetch_add(count as u64, Ordering::Relaxed);
        }
    }

    fn add_response_time(&self, elapsed: Duration) {
        let nanos = u64::try_from(elapsed.as_nanos()).unwrap_or(u64::MAX);
        self.response_nanos.fetch_add(nanos, Ordering::Relaxed);
    }

    pub fn snapshot(&self, memory_usage: u64, entry_count: usize) -> CacheStats {
        let cache_hits = self.hits.load(Ordering::Relaxed);
        let cache_misses = self.misses.load(Ordering::Relaxed);
        let total_requests = cache_hits + cache_misses;

        let (hit_rate, avg_response_time) = if total_requests == 0 {
            (0.0, Duration::ZERO)
        } else {
            let nanos = self.response_nanos.load(Ordering::Relaxed);
            (
                cache_hits as f64 / total_requests as f64,
                Duration::from_nanos(nanos / total_requests),
            )
        };

        CacheStats {
            total_requests,
            cache_hits,
            cache_misses,
            hit_rate,
            avg_response_time,
            memory_usage,
            entry_count,
            expired_evictions: self.expired.load(Ordering::Relaxed),
        }
    }

    pub fn reset(&self) {
        self.hits.store(0, Ordering::Relaxed);
        self.misses.store(0, Ordering::Relaxed);
        self.response_nanos.store(0, Ordering::Relaxed);
        self.expired.store(0, Ordering::Relaxed);
    }
}
