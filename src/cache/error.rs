//! Cache error types.
//!
//! None of these ever reach a caller of `CacheManager`: they are logged and
//! the operation degrades to a miss or a skipped write.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CacheError {
    /// The value could not be encoded for storage.
    #[error("failed to serialize value for '{key}': {source}")]
    Serialize {
        key: String,
        #[source]
        source: serde_json::Error,
    },

    /// A stored payload does not decode into the requested type.
    #[error("failed to deserialize value for '{key}': {source}")]
    Deserialize {
        key: String,
        #[source]
        source: serde_json::Error,
    },

    /// A secondary tier could not serve the request.
    #[error("cache tier '{tier}' unavailable: {reason}")]
    TierUnavailable { tier: String, reason: String },
}

impl CacheError {
    pub fn tier_unavailable(tier: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::TierUnavailable {
            tier: tier.into(),
            reason: reason.into(),
        }
    }
}
