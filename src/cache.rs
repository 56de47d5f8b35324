use std::{
    collections::HashMap,
    fmt,
    sync::{Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use serde_json::Value as JsonValue;
use tokio::time::Instant;

/// Structured cache key: the resource family (request path without query)
/// plus the serialized query parameters.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct CacheKey {
    family: String,
    query: String,
}

impl CacheKey {
    pub fn new(family: impl Into<String>, query: impl Into<String>) -> Self {
        Self {
            family: family.into(),
            query: query.into(),
        }
    }

    /// Splits a `path?query` string into family and query.
    pub fn from_path(path: &str) -> Self {
        match path.split_once('?') {
            Some((family, query)) => Self::new(family, query),
            None => Self::new(path, ""),
        }
    }

    pub fn family(&self) -> &str {
        &self.family
    }

    pub fn query(&self) -> &str {
        &self.query
    }

    /// True when this key's family is `family` itself or nested below it.
    pub fn belongs_to(&self, family: &str) -> bool {
        let family = family.trim_end_matches('/');
        if family.is_empty() {
            return true;
        }
        match self.family.strip_prefix(family) {
            Some(rest) => rest.is_empty() || rest.starts_with('/'),
            None => false,
        }
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.query.is_empty() {
            f.write_str(&self.family)
        } else {
            write!(f, "{}?{}", self.family, self.query)
        }
    }
}

#[derive(Clone, Debug)]
struct CacheEntry {
    value: JsonValue,
    stored_at: Instant,
    ttl: Duration,
}

impl CacheEntry {
    fn is_expired(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.stored_at) > self.ttl
    }
}

/// In-memory TTL cache for decoded GET responses.
///
/// Expired entries are evicted lazily when read; there is no sweeper.
#[derive(Debug, Default)]
pub struct ResponseCache {
    entries: Mutex<HashMap<CacheKey, CacheEntry>>,
}

impl ResponseCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &CacheKey) -> Option<JsonValue> {
        let mut entries = self.lock();
        let expired = entries.get(key)?.is_expired(Instant::now());
        if expired {
            entries.remove(key);
            return None;
        }
        entries.get(key).map(|entry| entry.value.clone())
    }

    pub fn insert(&self, key: CacheKey, value: JsonValue, ttl: Duration) {
        let entry = CacheEntry {
            value,
            stored_at: Instant::now(),
            ttl,
        };
        self.lock().insert(key, entry);
    }

    /// Removes every entry belonging to `family`, returning how many were evicted.
    pub fn invalidate(&self, family: &str) -> usize {
        let mut entries = self.lock();
        let before = entries.len();
        entries.retain(|key, _| !key.belongs_to(family));
        before - entries.len()
    }

    pub fn clear(&self) {
        self.lock().clear();
    }

    /// Number of stored entries, expired ones included until they are read.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<CacheKey, CacheEntry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
