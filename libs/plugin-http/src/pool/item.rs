use crate::client::HttpClient;
use crate::clock::{Clock, SystemClock};
use crate::error::HttpError;
use crate::message::Request;
use crate::promise::Promise;
use crate::transport::TransportErrorCode;
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, SystemTime};

struct ItemState {
    in_flight: AtomicUsize,
    disabled_at: Mutex<Option<SystemTime>>,
    reenable_after: Option<Duration>,
    clock: Arc<dyn Clock>,
}

impl ItemState {
    fn disable(&self) {
        *self.disabled_at.lock() = Some(self.clock.now());
    }
}

/// Decrements the in-flight counter exactly once, however the request ends.
struct InFlightGuard(Arc<ItemState>);

impl InFlightGuard {
    fn enter(state: &Arc<ItemState>) -> Self {
        state.in_flight.fetch_add(1, Ordering::AcqRel);
        Self(Arc::clone(state))
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.0.in_flight.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Client wrapped with a circuit breaker.
///
/// Any failure disables the item. With a re-enable duration configured the
/// item becomes usable again once that much time has passed; the check
/// happens in [`PoolItem::is_disabled`], there is no background timer.
#[derive(Clone)]
pub struct PoolItem {
    client: Arc<dyn HttpClient>,
    state: Arc<ItemState>,
}

impl PoolItem {
    /// `reenable_after = None` keeps a failed item disabled until
    /// [`PoolItem::enable`] is called.
    #[must_use]
    pub fn new(client: Arc<dyn HttpClient>, reenable_after: Option<Duration>) -> Self {
        Self::with_clock(client, reenable_after, Arc::new(SystemClock))
    }

    #[must_use]
    pub fn with_clock(client: Arc<dyn HttpClient>, reenable_after: Option<Duration>, clock: Arc<dyn Clock>) -> Self {
        Self {
            client,
            state: Arc::new(ItemState {
                in_flight: AtomicUsize::new(0),
                disabled_at: Mutex::new(None),
                reenable_after,
                clock,
            }),
        }
    }

    /// Whether the item is disabled, re-enabling it if its cool-down is over.
    #[must_use]
    pub fn is_disabled(&self) -> bool {
        let mut disabled_at = self.state.disabled_at.lock();
        let Some(since) = *disabled_at else {
            return false;
        };
        if let Some(after) = self.state.reenable_after {
            let elapsed = self.state.clock.now().duration_since(since).unwrap_or_default();
            if elapsed >= after {
                *disabled_at = None;
                tracing::info!(disabled_for = ?elapsed, "re-enabling pool item");
                return false;
            }
        }
        true
    }

    pub fn disable(&self) {
        self.state.disable();
    }

    pub fn enable(&self) {
        *self.state.disabled_at.lock() = None;
    }

    /// Requests currently dispatched through this item.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.state.in_flight.load(Ordering::Acquire)
    }
}

impl HttpClient for PoolItem {
    fn send_async_request(&self, request: Request) -> Promise {
        if self.is_disabled() {
            return Promise::rejected(HttpError::request(
                TransportErrorCode::Other,
                "cannot send the request as this client has been disabled",
            ));
        }

        let guard = InFlightGuard::enter(&self.state);
        let pending = self.client.send_async_request(request);
        Promise::new(async move {
            let result = pending.await;
            if let Err(err) = &result {
                tracing::warn!(error = %err, "disabling pool item after failure");
                guard.0.disable();
            }
            drop(guard);
            result
        })
    }
}

impl std::fmt::Debug for PoolItem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PoolItem")
            .field("in_flight", &self.in_flight())
            .field("reenable_after", &self.state.reenable_after)
            .finish_non_exhaustive()
    }
}
