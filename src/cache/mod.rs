//! Cache module - tiered key-value cache for authorization data.
//!
//! ## Architecture
//!
//! - `keys` - Key naming scheme, default TTLs and pattern builders
//! - `CacheManager` - The store: get/set/invalidate/stats/warm/cleanup
//! - `CacheTier` - Interface for optional secondary tiers (`MokaTier`)
//! - `InvalidationPattern` - Literal prefix plus optional wildcard/regex suffix
//!
//! ## Usage
//!
//! ```rust
//! use authcache::cache::{keys, CacheConfig, CacheManager};
//!
//! let cache = CacheManager::new(CacheConfig::in_memory().no_cleanup());
//!
//! cache.set(&keys::user_auth("42"), &"admin", None);
//! let role: Option<String> = cache.get(&keys::user_auth("42"));
//! assert_eq!(role.as_deref(), Some("admin"));
//!
//! cache.invalidate(keys::user_auth_pattern("42"));
//! assert!(cache.get::<String>(&keys::user_auth("42")).is_none());
//! ```

mod config;
mod entry;
mod error;
pub mod keys;
mod manager;
mod pattern;
mod stats;
mod tier;

pub use config::{CacheConfig, TierConfig};
pub use entry::CacheEntry;
pub use error::CacheError;
pub use keys::{DataClass, PermissionScope};
pub use manager::{CacheManager, GetOptions, SetOptions};
pub use pattern::InvalidationPattern;
pub use stats::CacheStats;
pub use tier::{CacheTier, MokaTier};
