//! Cache item store consumed by the cache plugin.

use crate::clock::{Clock, SystemClock};
use crate::message::Response;
use bytes::Bytes;
use http::{HeaderName, HeaderValue, StatusCode};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

/// Failure reported by a cache store.
#[derive(Debug, thiserror::Error)]
#[error("cache store error: {message}")]
pub struct CacheStoreError {
    pub message: String,
    #[source]
    pub source: Option<crate::error::BoxError>,
}

impl CacheStoreError {
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            source: None,
        }
    }
}

/// A stored response.
///
/// Timestamps are unix seconds. `expires_at = None` means the entry has no
/// time-based freshness and is revalidated on every use.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub status: u16,
    pub headers: Vec<(String, Vec<u8>)>,
    pub body: Vec<u8>,
    pub created_at: i64,
    pub expires_at: Option<i64>,
    pub etags: Vec<String>,
}

impl CacheEntry {
    pub(crate) fn from_response(response: &Response, created_at: i64, expires_at: Option<i64>) -> Self {
        let headers = response
            .headers()
            .iter()
            .map(|(name, value)| (name.as_str().to_owned(), value.as_bytes().to_vec()))
            .collect();
        let etags = response
            .headers()
            .get_all(http::header::ETAG)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .map(str::to_owned)
            .collect();
        Self {
            status: response.status().as_u16(),
            headers,
            body: response.body().to_vec(),
            created_at,
            expires_at,
            etags,
        }
    }

    /// Whether the entry may be served without contacting the origin.
    #[must_use]
    pub fn is_fresh(&self, now: i64) -> bool {
        self.expires_at.is_some_and(|expires_at| now < expires_at)
    }

    /// Rebuild the stored response. Headers that no longer parse are skipped.
    #[must_use]
    pub fn to_response(&self) -> Response {
        let mut response = http::Response::new(Bytes::from(self.body.clone()));
        *response.status_mut() = StatusCode::from_u16(self.status).unwrap_or(StatusCode::OK);
        let headers = response.headers_mut();
        for (name, value) in &self.headers {
            if let (Ok(name), Ok(value)) = (
                HeaderName::from_bytes(name.as_bytes()),
                HeaderValue::from_bytes(value),
            ) {
                headers.append(name, value);
            }
        }
        response
    }
}

/// Slot returned by [`CacheItemPool::get_item`].
#[derive(Debug, Clone)]
pub struct CacheItem {
    key: String,
    value: Option<CacheEntry>,
    hit: bool,
    expires_after: Option<Duration>,
}

impl CacheItem {
    #[must_use]
    pub fn miss(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: None,
            hit: false,
            expires_after: None,
        }
    }

    #[must_use]
    pub fn hit(key: impl Into<String>, entry: CacheEntry) -> Self {
        Self {
            key: key.into(),
            value: Some(entry),
            hit: true,
            expires_after: None,
        }
    }

    #[must_use]
    pub fn key(&self) -> &str {
        &self.key
    }

    #[must_use]
    pub fn is_hit(&self) -> bool {
        self.hit
    }

    #[must_use]
    pub fn get(&self) -> Option<&CacheEntry> {
        self.value.as_ref()
    }

    pub fn set(&mut self, entry: CacheEntry) {
        self.value = Some(entry);
    }

    /// Eviction horizon relative to the save; `None` keeps the item forever.
    pub fn expires_after(&mut self, ttl: Option<Duration>) {
        self.expires_after = ttl;
    }

    #[must_use]
    pub fn ttl(&self) -> Option<Duration> {
        self.expires_after
    }
}

/// Key-value store holding cache entries.
pub trait CacheItemPool: Send + Sync {
    /// Look up `key`. A missing key yields a miss, not an error.
    ///
    /// # Errors
    ///
    /// Returns [`CacheStoreError`] if the backend cannot be reached.
    fn get_item(&self, key: &str) -> Result<CacheItem, CacheStoreError>;

    /// Persist `item` with its eviction horizon.
    ///
    /// # Errors
    ///
    /// Returns [`CacheStoreError`] if the backend rejects the write.
    fn save(&self, item: CacheItem) -> Result<(), CacheStoreError>;
}

impl<P: CacheItemPool + ?Sized> CacheItemPool for Arc<P> {
    fn get_item(&self, key: &str) -> Result<CacheItem, CacheStoreError> {
        (**self).get_item(key)
    }

    fn save(&self, item: CacheItem) -> Result<(), CacheStoreError> {
        (**self).save(item)
    }
}

struct Stored {
    entry: CacheEntry,
    evict_at: Option<SystemTime>,
}

/// Process-local [`CacheItemPool`].
///
/// Items past their eviction horizon are dropped on lookup.
pub struct InMemoryCachePool {
    clock: Arc<dyn Clock>,
    items: Mutex<HashMap<String, Stored>>,
}

impl InMemoryCachePool {
    #[must_use]
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    #[must_use]
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            items: Mutex::new(HashMap::new()),
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.items.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.items.lock().is_empty()
    }

    pub fn clear(&self) {
        self.items.lock().clear();
    }
}

impl Default for InMemoryCachePool {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for InMemoryCachePool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryCachePool")
            .field("items", &self.len())
            .finish_non_exhaustive()
    }
}

impl CacheItemPool for InMemoryCachePool {
    fn get_item(&self, key: &str) -> Result<CacheItem, CacheStoreError> {
        let now = self.clock.now();
        let mut items = self.items.lock();
        let expired = items
            .get(key)
            .map(|stored| stored.evict_at.is_some_and(|at| now >= at));
        match expired {
            Some(false) => Ok(items
                .get(key)
                .map_or_else(|| CacheItem::miss(key), |stored| CacheItem::hit(key, stored.entry.clone()))),
            Some(true) => {
                items.remove(key);
                Ok(CacheItem::miss(key))
            }
            None => Ok(CacheItem::miss(key)),
        }
    }

    fn save(&self, item: CacheItem) -> Result<(), CacheStoreError> {
        let Some(entry) = item.value else {
            return Err(CacheStoreError::new(format!("no value to save for key {}", item.key)));
        };
        // A horizon past what `SystemTime` can represent never evicts.
        let evict_at = item.expires_after.and_then(|ttl| self.clock.now().checked_add(ttl));
        self.items.lock().insert(item.key, Stored { entry, evict_at });
        Ok(())
    }
}
