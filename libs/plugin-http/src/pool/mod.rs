//! Load-balanced pool of clients.
//!
//! Selection only ever considers enabled [`PoolItem`]s; a pool with no
//! enabled item rejects with [`HttpError::ClientNotFound`].

mod item;

pub use item::PoolItem;

use crate::client::HttpClient;
use crate::config::PoolStrategy;
use crate::error::HttpError;
use crate::message::Request;
use crate::promise::Promise;
use parking_lot::Mutex;
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;

/// Pool of [`PoolItem`]s implementing [`HttpClient`].
pub struct HttpClientPool {
    items: Vec<PoolItem>,
    strategy: PoolStrategy,
    cursor: Mutex<usize>,
}

impl HttpClientPool {
    #[must_use]
    pub fn new(strategy: PoolStrategy) -> Self {
        Self {
            items: Vec::new(),
            strategy,
            cursor: Mutex::new(0),
        }
    }

    #[must_use]
    pub fn random() -> Self {
        Self::new(PoolStrategy::Random)
    }

    #[must_use]
    pub fn round_robin() -> Self {
        Self::new(PoolStrategy::RoundRobin)
    }

    #[must_use]
    pub fn least_used() -> Self {
        Self::new(PoolStrategy::LeastUsed)
    }

    #[must_use]
    pub fn with_item(mut self, item: PoolItem) -> Self {
        self.items.push(item);
        self
    }

    /// Wrap `client` in a [`PoolItem`] and add it.
    #[must_use]
    pub fn with_client(self, client: Arc<dyn HttpClient>, reenable_after: Option<Duration>) -> Self {
        self.with_item(PoolItem::new(client, reenable_after))
    }

    #[must_use]
    pub fn items(&self) -> &[PoolItem] {
        &self.items
    }

    #[must_use]
    pub fn strategy(&self) -> PoolStrategy {
        self.strategy
    }

    /// Pick the item the next request goes to.
    ///
    /// # Errors
    ///
    /// Returns [`HttpError::ClientNotFound`] when every item is disabled.
    pub fn select(&self) -> Result<&PoolItem, HttpError> {
        let index = match self.strategy {
            PoolStrategy::Random => self.select_random(),
            PoolStrategy::RoundRobin => self.select_round_robin(),
            PoolStrategy::LeastUsed => self.select_least_used(),
        };
        match index {
            Some(index) => {
                tracing::trace!(index, strategy = ?self.strategy, "selected pool item");
                Ok(&self.items[index])
            }
            None => {
                tracing::warn!(items = self.items.len(), "no enabled client in pool");
                Err(HttpError::ClientNotFound)
            }
        }
    }

    fn enabled(&self) -> impl Iterator<Item = (usize, &PoolItem)> {
        self.items.iter().enumerate().filter(|(_, item)| !item.is_disabled())
    }

    fn select_random(&self) -> Option<usize> {
        let enabled: Vec<usize> = self.enabled().map(|(index, _)| index).collect();
        if enabled.is_empty() {
            return None;
        }
        Some(enabled[rand::rng().random_range(0..enabled.len())])
    }

    fn select_round_robin(&self) -> Option<usize> {
        let count = self.items.len();
        let mut cursor = self.cursor.lock();
        let start = if *cursor >= count { 0 } else { *cursor };
        let index = (0..count)
            .map(|offset| (start + offset) % count)
            .find(|&index| !self.items[index].is_disabled())?;
        *cursor = index + 1;
        Some(index)
    }

    fn select_least_used(&self) -> Option<usize> {
        self.enabled()
            .min_by_key(|(_, item)| item.in_flight())
            .map(|(index, _)| index)
    }
}

impl HttpClient for HttpClientPool {
    fn send_async_request(&self, request: Request) -> Promise {
        match self.select() {
            Ok(item) => item.send_async_request(request),
            Err(err) => Promise::rejected(err),
        }
    }
}

impl std::fmt::Debug for HttpClientPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpClientPool")
            .field("strategy", &self.strategy)
            .field("items", &self.items)
            .finish_non_exhaustive()
    }
}
