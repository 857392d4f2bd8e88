//! Configuration module for authcache.
//!
//! Loads configuration from environment variables. Every variable is
//! optional; unparsable values fall back to the default with a warning.

use std::env;
use std::str::FromStr;
use std::time::Duration;

use tracing::warn;

use crate::cache::{CacheConfig, TierConfig};
use crate::invalidation::RefreshConfig;

/// Application configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub cache: CacheConfig,
    pub refresh: RefreshConfig,

    /// How long the demo workload runs. `None` runs until Ctrl-C.
    pub demo_duration: Option<Duration>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            cache: CacheConfig::tiered(),
            refresh: RefreshConfig::default(),
            demo_duration: None,
        }
    }
}

impl Config {
    /// Load configuration from `.env` and the process environment.
    pub fn from_env() -> Self {
        dotenvy::dotenv().ok();
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Build configuration from an arbitrary variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let vars = Vars { lookup };
        let mut config = Self::default();

        if let Some(secs) = vars.parse::<u64>("AUTHCACHE_DEFAULT_TTL_SECS") {
            config.cache = config.cache.default_ttl(Duration::from_secs(secs));
        }

        // 0 disables the background sweep
        match vars.parse::<u64>("AUTHCACHE_CLEANUP_INTERVAL_SECS") {
            Some(0) => config.cache = config.cache.no_cleanup(),
            Some(secs) => config.cache = config.cache.cleanup_interval(Duration::from_secs(secs)),
            None => {}
        }

        if let Some(secs) = vars.parse::<u64>("AUTHCACHE_WARMING_TTL_SECS") {
            config.cache = config.cache.warming_ttl(Duration::from_secs(secs));
        }

        match vars.parse::<u64>("AUTHCACHE_SECONDARY_CAPACITY") {
            Some(0) => config.cache = config.cache.no_secondary(),
            Some(capacity) => {
                config.cache = config.cache.secondary(TierConfig::with_capacity(capacity));
            }
            None => {}
        }

        if let Some(secs) = vars.parse::<u64>("AUTHCACHE_REFRESH_INTERVAL_SECS") {
            if secs == 0 {
                warn!("AUTHCACHE_REFRESH_INTERVAL_SECS must be positive, keeping default");
            } else {
                config.refresh = config.refresh.interval(Duration::from_secs(secs));
            }
        }

        let high = vars
            .parse("AUTHCACHE_REFRESH_HIGH_BATCH")
            .unwrap_or(config.refresh.high_batch);
        let normal = vars
            .parse("AUTHCACHE_REFRESH_NORMAL_BATCH")
            .unwrap_or(config.refresh.normal_batch);
        let low = vars
            .parse("AUTHCACHE_REFRESH_LOW_BATCH")
            .unwrap_or(config.refresh.low_batch);
        config.refresh = config.refresh.batch_sizes(high, normal, low);

        if let Some(retries) = vars.parse::<u32>("AUTHCACHE_REFRESH_MAX_RETRIES") {
            config.refresh = config.refresh.max_retries(retries);
        }

        config.demo_duration = vars
            .parse::<u64>("AUTHCACHE_DEMO_SECS")
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs);

        config
    }
}

struct Vars<F> {
    lookup: F,
}

impl<F: Fn(&str) -> Option<String>> Vars<F> {
    fn parse<T: FromStr>(&self, name: &str) -> Option<T> {
        let raw = (self.lookup)(name)?;
        let raw = raw.trim();
        if raw.is_empty() {
            return None;
        }

        match raw.parse() {
            Ok(value) => Some(value),
            Err(_) => {
                warn!("Ignoring invalid value '{}' for {}", raw, name);
                None
            }
        }
    }
}
