//! Shared cache for external fetch results.
//!
//! Entries are keyed by `{source}:{normalized key}` and written wholesale:
//! a key is either absent or holds one complete serialized value.

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::time::{Duration, Instant};

use crate::errors::CacheError;

/// Keys longer than this are replaced by their SHA-256 digest.
pub const MAX_KEY_LEN: usize = 200;

/// Builds the cache key for a source and normalized key.
#[must_use]
pub fn cache_key(source: &str, normalized_key: &str) -> String {
    let key = format!("{source}:{normalized_key}");
    if key.len() <= MAX_KEY_LEN {
        return key;
    }
    let digest = Sha256::digest(normalized_key.as_bytes());
    format!("{source}:sha256:{}", hex::encode(digest))
}

/// Storage for fetch results shared across every order.
#[async_trait]
pub trait CacheStore: Send + Sync {
    /// Returns the live value for a key, if any.
    async fn get(&self, key: &str) -> Result<Option<Value>, CacheError>;

    /// Stores a value, replacing any previous one.
    ///
    /// `ttl` of `None` means the entry never expires.
    async fn set(&self, key: &str, value: Value, ttl: Option<Duration>) -> Result<(), CacheError>;
}

struct CacheEntry {
    value: Value,
    expires_at: Option<Instant>,
}

impl CacheEntry {
    fn is_live(&self) -> bool {
        self.expires_at.map_or(true, |at| Instant::now() < at)
    }
}

/// In-process cache backed by a concurrent map.
#[derive(Default)]
pub struct InMemoryCacheStore {
    entries: DashMap<String, CacheEntry>,
}

impl InMemoryCacheStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored entries, including expired ones not yet evicted.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the store is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Whether a live entry exists for the key.
    #[must_use]
    pub fn contains(&self, key: &str) -> bool {
        self.entries.get(key).is_some_and(|entry| entry.is_live())
    }

    /// Removes every entry.
    pub fn clear(&self) {
        self.entries.clear();
    }
}

#[async_trait]
impl CacheStore for InMemoryCacheStore {
    async fn get(&self, key: &str) -> Result<Option<Value>, CacheError> {
        if let Some(entry) = self.entries.get(key) {
            if entry.is_live() {
                return Ok(Some(entry.value.clone()));
            }
            // Expired
            drop(entry);
            self.entries.remove(key);
        }
        Ok(None)
    }

    async fn set(&self, key: &str, value: Value, ttl: Option<Duration>) -> Result<(), CacheError> {
        self.entries.insert(
            key.to_string(),
            CacheEntry {
                value,
                expires_at: ttl.map(|ttl| Instant::now() + ttl),
            },
        );
        Ok(())
    }
}

/// A cache that stores nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoCache;

#[async_trait]
impl CacheStore for NoCache {
    async fn get(&self, _key: &str) -> Result<Option<Value>, CacheError> {
        Ok(None)
    }

    async fn set(&self, _key: &str, _value: Value, _ttl: Option<Duration>) -> Result<(), CacheError> {
        Ok(())
    }
}
