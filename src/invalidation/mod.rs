//! Invalidation module - keeps the cache consistent with authorization
//! changes.
//!
//! ## Architecture
//!
//! - `InvalidationService` - Invalidates affected keys, queues refreshes, notifies subscribers
//! - `RefreshQueue` - Deduplicated, prioritized pending refreshes with retry backoff
//! - `Subscribers` - Per-kind callbacks, isolated from each other's panics
//! - `RefreshHandler` - Refill routine registered per scope by the caller
//!
//! ## Usage
//!
//! ```rust
//! use std::sync::Arc;
//!
//! use authcache::cache::{CacheConfig, CacheManager};
//! use authcache::invalidation::{InvalidationKind, InvalidationService, RefreshConfig};
//!
//! let cache = Arc::new(CacheManager::new(CacheConfig::in_memory().no_cleanup()));
//! let service = InvalidationService::new(cache.clone(), RefreshConfig::default());
//!
//! let subscription = service.subscribe(InvalidationKind::RoleChange, |event| {
//!     println!("roles of {} changed", event.user_id);
//! });
//!
//! cache.set("roles:42:org", &["owner"], None);
//! service.invalidate_role_change("42", "org", Some("7"), None);
//! assert!(!cache.contains_key("roles:42:org"));
//! assert_eq!(service.queue_status().high_priority, 1);
//!
//! subscription.unsubscribe();
//! ```

mod config;
mod event;
mod service;
mod task;

pub use config::RefreshConfig;
pub use event::{InvalidationEvent, InvalidationKind, Subscription};
pub use service::{DrainReport, InvalidationService, RefreshError, RefreshHandler};
pub use task::{QueueStatus, RefreshPriority, RefreshScope, RefreshTask};
