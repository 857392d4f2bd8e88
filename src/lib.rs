//! authcache - caching layer for authorization data.
//!
//! ## Architecture
//!
//! - `cache` - Tiered key-value cache with TTLs, pattern invalidation and statistics
//! - `invalidation` - Change-driven invalidation, background refresh, change events
//! - `config` - Environment configuration
//!
//! The cache is fail-open: storage problems are logged and surface as misses
//! or no-ops, never as errors in the caller's authorization path.

pub mod cache;
pub mod config;
pub mod invalidation;

pub use cache::{CacheConfig, CacheManager, CacheStats, InvalidationPattern};
pub use config::Config;
pub use invalidation::{InvalidationEvent, InvalidationKind, InvalidationService, RefreshConfig};
