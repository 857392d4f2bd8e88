//! Cache configuration.

use std::time::Duration;

/// Configuration for a [`CacheManager`](super::CacheManager).
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// TTL for keys outside the naming scheme when no TTL is given.
    pub default_ttl: Duration,

    /// Period of the background expiry sweep.
    /// `None` leaves expiry entirely to lazy checks and manual sweeps.
    pub cleanup_interval: Option<Duration>,

    /// Lifetime of warm-up markers.
    pub warming_ttl: Duration,

    /// Optional bounded secondary tier.
    pub secondary: Option<TierConfig>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            default_ttl: Duration::from_secs(300),             // 5 minutes
            cleanup_interval: Some(Duration::from_secs(60)), // 1 minute
            warming_ttl: Duration::from_secs(30),
            secondary: None,
        }
    }
}

impl CacheConfig {
    /// Memory tier only.
    pub fn in_memory() -> Self {
        Self::default()
    }

    /// Memory tier backed by a bounded secondary tier.
    pub fn tiered() -> Self {
        Self {
            secondary: Some(TierConfig::default()),
            ..Default::default()
        }
    }

    /// Set the fallback TTL (builder pattern).
    #[must_use]
    pub fn default_ttl(mut self, ttl: Duration) -> Self {
        self.default_ttl = ttl;
        self
    }

    /// Set the background sweep period.
    #[must_use]
    pub fn cleanup_interval(mut self, interval: Duration) -> Self {
        self.cleanup_interval = Some(interval);
        self
    }

    /// Disable the background sweep.
    #[must_use]
    pub fn no_cleanup(mut self) -> Self {
        self.cleanup_interval = None;
        self
    }

    /// Set the warm-up marker lifetime.
    #[must_use]
    pub fn warming_ttl(mut self, ttl: Duration) -> Self {
        self.warming_ttl = ttl;
        self
    }

    /// Attach a secondary tier.
    #[must_use]
    pub fn secondary(mut self, tier: TierConfig) -> Self {
        self.secondary = Some(tier);
        self
    }

    /// Run without a secondary tier.
    #[must_use]
    pub fn no_secondary(mut self) -> Self {
        self.secondary = None;
        self
    }
}

/// Configuration for the moka-backed secondary tier.
#[derive(Debug, Clone)]
pub struct TierConfig {
    /// Maximum number of entries before LRU eviction.
    pub max_capacity: u64,

    /// Evict entries not read within this duration.
    pub tti: Option<Duration>,
}

impl Default for TierConfig {
    fn default() -> Self {
        Self {
            max_capacity: 50_000,
            tti: Some(Duration::from_secs(1800)), // 30 minutes idle
        }
    }
}

impl TierConfig {
    /// Create a tier config with the given max capacity.
    pub fn with_capacity(max_capacity: u64) -> Self {
        Self {
            max_capacity,
            ..Default::default()
        }
    }

    /// Set time-to-idle for tier entries.
    #[must_use]
    pub fn tti(mut self, duration: Duration) -> Self {
        self.tti = Some(duration);
        self
    }

    /// Keep entries until capacity or their own TTL evicts them.
    #[must_use]
    pub fn no_tti(mut self) -> Self {
        self.tti = None;
        self
    }
}
