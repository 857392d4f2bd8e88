//! Stored cache entries.

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::de::DeserializeOwned;

use super::CacheError;

/// One stored value with its lifetime.
///
/// The payload is kept as serialized JSON so the store stays agnostic of
/// the value type and memory accounting is a byte count. Cloning is cheap.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    key: String,
    value: Arc<[u8]>,
    created_at: Instant,
    expires_at: Instant,
}

impl CacheEntry {
    /// Create an entry that expires `ttl` from now.
    pub fn new(key: impl Into<String>, value: impl Into<Arc<[u8]>>, ttl: Duration) -> Self {
        let now = Instant::now();
        Self {
            key: key.into(),
            value: value.into(),
            created_at: now,
            expires_at: now + ttl,
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Raw serialized payload.
    pub fn payload(&self) -> &[u8] {
        &self.value
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    pub fn expires_at(&self) -> Instant {
        self.expires_at
    }

    /// Expired once `now` is strictly past `expires_at`.
    #[inline]
    pub fn is_expired_at(&self, now: Instant) -> bool {
        now > self.expires_at
    }

    #[inline]
    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Instant::now())
    }

    /// Time left before expiry (zero when already expired).
    pub fn remaining_ttl(&self) -> Duration {
        self.expires_at.saturating_duration_since(Instant::now())
    }

    /// Approximate footprint: key plus serialized payload.
    pub fn size_bytes(&self) -> usize {
        self.key.len() + self.value.len()
    }

    /// Decode a copy of the payload.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, CacheError> {
        serde_json::from_slice(&self.value).map_err(|source| CacheError::Deserialize {
            key: self.key.clone(),
            source,
        })
    }
}
