//! Multiplexed transport driver.
//!
//! Requests are queued by [`HttpClient::send_async_request`] and only hit
//! the wire when somebody drives the queue with [`BatchClient::proceed`] or
//! [`BatchClient::flush`] (awaiting one of the returned promises does this
//! too). Every bound request occupies a [`TransportHandle`]; finished
//! handles are reset and parked in a bounded free-list for reuse.

use super::{HyperEngine, TransportEngine, TransportFailure, bind_request};
use crate::client::{BatchClient, HttpClient};
use crate::config::TransportConfig;
use crate::error::HttpError;
use crate::message::{Request, Response};
use crate::promise::Promise;
use futures::FutureExt;
use futures::StreamExt;
use futures::future::BoxFuture;
use futures::stream::FuturesUnordered;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::oneshot;

type Completion = oneshot::Sender<Result<Response, HttpError>>;
type InFlight = BoxFuture<'static, (TransportHandle, Result<Response, TransportFailure>)>;

struct QueueEntry {
    id: u64,
    request: Option<Request>,
    completion: Option<Completion>,
    prepared: bool,
}

impl QueueEntry {
    /// Unbound entry whose promise has been dropped.
    fn is_cancelled(&self) -> bool {
        !self.prepared && self.completion.as_ref().is_none_or(oneshot::Sender::is_closed)
    }
}

fn prune_cancelled(queue: &mut VecDeque<QueueEntry>) {
    let before = queue.len();
    queue.retain(|entry| !entry.is_cancelled());
    let pruned = before - queue.len();
    if pruned > 0 {
        tracing::trace!(pruned, "dropped cancelled requests from queue");
    }
}

/// Reusable slot carrying one in-flight request.
struct TransportHandle {
    id: u64,
    entry: Option<u64>,
    binding: Option<Completion>,
}

impl TransportHandle {
    fn bind(&mut self, entry: u64, completion: Completion) {
        self.entry = Some(entry);
        self.binding = Some(completion);
    }

    /// Fire the completion callback, if still bound.
    fn complete(&mut self, outcome: Result<Response, HttpError>) {
        if let Some(binding) = self.binding.take() {
            // The caller may have dropped its promise.
            _ = binding.send(outcome);
        }
    }

    fn reset(&mut self) {
        self.entry = None;
        self.binding = None;
    }
}

/// Handle bookkeeping of a [`MultiplexedTransport`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HandleStats {
    /// Handles created since the driver started
    pub created: usize,
    /// Handles closed because the free-list was full
    pub closed: usize,
    /// Handles parked in the free-list
    pub idle: usize,
    /// Handles currently carrying a request
    pub in_flight: usize,
    /// Highest number of simultaneously in-flight handles
    pub peak_in_flight: usize,
}

struct EngineState {
    free: Vec<TransportHandle>,
    capacity: usize,
    next_handle: u64,
    in_flight: FuturesUnordered<InFlight>,
    stats: HandleStats,
}

impl EngineState {
    fn acquire(&mut self) -> TransportHandle {
        if let Some(handle) = self.free.pop() {
            return handle;
        }
        self.next_handle += 1;
        self.stats.created += 1;
        TransportHandle {
            id: self.next_handle,
            entry: None,
            binding: None,
        }
    }

    fn release(&mut self, mut handle: TransportHandle) {
        handle.reset();
        if self.free.len() < self.capacity {
            self.free.push(handle);
        } else {
            tracing::trace!(handle = handle.id, "free-list full, closing handle");
            self.stats.closed += 1;
        }
    }
}

struct Inner {
    engine: Arc<dyn TransportEngine>,
    config: TransportConfig,
    queue: parking_lot::Mutex<VecDeque<QueueEntry>>,
    state: tokio::sync::Mutex<EngineState>,
    next_entry: AtomicU64,
}

/// Transport driver advancing many requests from one poll loop.
#[derive(Clone)]
pub struct MultiplexedTransport {
    inner: Arc<Inner>,
}

impl MultiplexedTransport {
    #[must_use]
    pub fn new(engine: Arc<dyn TransportEngine>, config: TransportConfig) -> Self {
        let capacity = config.max_handles;
        Self {
            inner: Arc::new(Inner {
                engine,
                config,
                queue: parking_lot::Mutex::new(VecDeque::new()),
                state: tokio::sync::Mutex::new(EngineState {
                    free: Vec::with_capacity(capacity),
                    capacity,
                    next_handle: 0,
                    in_flight: FuturesUnordered::new(),
                    stats: HandleStats::default(),
                }),
                next_entry: AtomicU64::new(0),
            }),
        }
    }

    /// Driver over a [`HyperEngine`] built from `config`.
    ///
    /// # Errors
    ///
    /// Propagates engine construction failures (TLS roots, proxy URI).
    pub fn hyper(config: TransportConfig) -> Result<Self, HttpError> {
        let engine = HyperEngine::new(config.clone())?;
        Ok(Self::new(Arc::new(engine), config))
    }

    /// Snapshot of handle bookkeeping.
    pub async fn stats(&self) -> HandleStats {
        let state = self.inner.state.lock().await;
        HandleStats {
            idle: state.free.len(),
            in_flight: state.in_flight.len(),
            ..state.stats
        }
    }

    fn enqueue(&self, request: Request) -> oneshot::Receiver<Result<Response, HttpError>> {
        let (tx, rx) = oneshot::channel();
        let id = self.inner.next_entry.fetch_add(1, Ordering::Relaxed);
        let mut queue = self.inner.queue.lock();
        prune_cancelled(&mut queue);
        queue.push_back(QueueEntry {
            id,
            request: Some(request),
            completion: Some(tx),
            prepared: false,
        });
        rx
    }

    fn remove_entry(&self, id: u64) {
        self.inner.queue.lock().retain(|entry| entry.id != id);
    }

    /// One unit of work: bind every unprepared entry, then wait for at least
    /// one in-flight request to finish and settle all that are done.
    async fn drive(&self) {
        let mut state = self.inner.state.lock().await;

        let unprepared: Vec<(u64, Request, Completion)> = {
            let mut queue = self.inner.queue.lock();
            prune_cancelled(&mut queue);
            queue
                .iter_mut()
                .filter(|entry| !entry.prepared)
                .filter_map(|entry| {
                    entry.prepared = true;
                    Some((entry.id, entry.request.take()?, entry.completion.take()?))
                })
                .collect()
        };

        for (id, request, completion) in unprepared {
            match bind_request(request, &self.inner.config) {
                Ok(prepared) => {
                    let mut handle = state.acquire();
                    handle.bind(id, completion);
                    tracing::trace!(handle = handle.id, uri = %prepared.uri, "bound request to handle");
                    let execution = self.inner.engine.execute(prepared);
                    state
                        .in_flight
                        .push(Box::pin(async move { (handle, execution.await) }));
                }
                Err(err) => {
                    _ = completion.send(Err(err));
                    self.remove_entry(id);
                }
            }
        }

        let active = state.in_flight.len();
        state.stats.peak_in_flight = state.stats.peak_in_flight.max(active);
        if active == 0 {
            return;
        }

        if let Some((handle, result)) = state.in_flight.next().await {
            self.settle(&mut state, handle, result);
        }
        while let Some(Some((handle, result))) = state.in_flight.next().now_or_never() {
            self.settle(&mut state, handle, result);
        }
    }

    fn settle(
        &self,
        state: &mut EngineState,
        mut handle: TransportHandle,
        result: Result<Response, TransportFailure>,
    ) {
        if let Err(failure) = &result {
            tracing::debug!(handle = handle.id, code = %failure.code, "request failed");
        }
        handle.complete(result.map_err(HttpError::from));
        let entry = handle.entry;
        state.release(handle);
        if let Some(id) = entry {
            self.remove_entry(id);
        }
    }
}

impl HttpClient for MultiplexedTransport {
    fn send_async_request(&self, request: Request) -> Promise {
        let mut receiver = self.enqueue(request);
        let driver = self.clone();
        Promise::new(async move {
            loop {
                match receiver.try_recv() {
                    Ok(result) => return result,
                    Err(oneshot::error::TryRecvError::Closed) => return Err(HttpError::ServiceClosed),
                    Err(oneshot::error::TryRecvError::Empty) => driver.drive().await,
                }
            }
        })
    }
}

impl BatchClient for MultiplexedTransport {
    fn count(&self) -> usize {
        let mut queue = self.inner.queue.lock();
        prune_cancelled(&mut queue);
        queue.len()
    }

    fn proceed(&self) -> Promise<()> {
        let driver = self.clone();
        Promise::new(async move {
            driver.drive().await;
            Ok(())
        })
    }

    fn flush(&self) -> Promise<()> {
        let driver = self.clone();
        Promise::new(async move {
            while driver.count() > 0 {
                driver.drive().await;
            }
            Ok(())
        })
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;
    use crate::transport::tests::{ScriptedEngine, echo_path};
    use crate::transport::TransportErrorCode;
    use bytes::Bytes;
    use std::time::Duration;

    fn get(path: &str) -> Request {
        http::Request::get(format!("http://multi.test{path}"))
            .body(Bytes::new())
            .unwrap()
    }

    fn config(max_handles: usize) -> TransportConfig {
        TransportConfig {
            max_handles,
            ..TransportConfig::default()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_flush_settles_every_queued_request() {
        let engine = ScriptedEngine::delayed(Duration::from_millis(10), echo_path);
        let transport = MultiplexedTransport::new(engine.clone(), config(2));

        let promises: Vec<Promise> = (0..8)
            .map(|i| transport.send_async_request(get(&format!("/r{i}"))))
            .collect();
        assert_eq!(transport.count(), 8);

        transport.flush().await.unwrap();

        assert_eq!(transport.count(), 0);
        assert_eq!(engine.call_count(), 8);
        for (i, promise) in promises.into_iter().enumerate() {
            let response = promise.await.unwrap();
            assert_eq!(response.body(), &Bytes::from(format!("/r{i}")));
        }

        let stats = transport.stats().await;
        assert_eq!(stats.in_flight, 0);
        assert!(stats.idle <= 2);
        assert!(stats.created - stats.closed <= 2 + stats.peak_in_flight);
        assert_eq!(stats.created - stats.closed, stats.idle);
    }

    #[tokio::test(start_paused = true)]
    async fn test_proceed_completes_at_least_one() {
        let engine = ScriptedEngine::delayed(Duration::from_millis(5), echo_path);
        let transport = MultiplexedTransport::new(engine, config(5));

        let _first = transport.send_async_request(get("/a"));
        let _second = transport.send_async_request(get("/b"));

        transport.proceed().await.unwrap();

        assert!(transport.count() < 2);
    }

    #[tokio::test]
    async fn test_handles_are_reused_up_to_capacity() {
        let engine = ScriptedEngine::new(echo_path);
        let transport = MultiplexedTransport::new(engine, config(1));

        for i in 0..3 {
            transport
                .send_async_request(get(&format!("/{i}")))
                .await
                .unwrap();
        }

        let stats = transport.stats().await;
        assert_eq!(stats.created, 1);
        assert_eq!(stats.closed, 0);
        assert_eq!(stats.idle, 1);
    }

    #[tokio::test]
    async fn test_failures_are_mapped_and_dequeued() {
        let engine = ScriptedEngine::new(|request| {
            if request.uri.path() == "/down" {
                Err(TransportFailure::new(TransportErrorCode::CouldNotConnect, "refused"))
            } else {
                echo_path(request)
            }
        });
        let transport = MultiplexedTransport::new(engine, config(5));

        let down = transport.send_async_request(get("/down"));
        let up = transport.send_async_request(get("/up"));
        let invalid = transport.send_async_request(
            http::Request::get("/no-host").body(Bytes::new()).unwrap(),
        );
        transport.flush().await.unwrap();

        assert!(matches!(down.await, Err(HttpError::Network { .. })));
        assert_eq!(up.await.unwrap().body().as_ref(), b"/up");
        assert!(matches!(invalid.await, Err(HttpError::InvalidUri { .. })));
        assert_eq!(transport.count(), 0);
    }

    #[tokio::test]
    async fn test_awaiting_a_promise_drives_the_queue() {
        let engine = ScriptedEngine::new(echo_path);
        let transport = MultiplexedTransport::new(engine, config(5));

        let other = transport.send_async_request(get("/other"));
        let mine = transport.send_async_request(get("/mine")).await.unwrap();

        assert_eq!(mine.body().as_ref(), b"/mine");
        assert_eq!(other.await.unwrap().body().as_ref(), b"/other");
    }

    #[tokio::test]
    async fn test_dropped_promise_does_not_break_the_queue() {
        let engine = ScriptedEngine::new(echo_path);
        let transport = MultiplexedTransport::new(engine, config(5));

        drop(transport.send_async_request(get("/ignored")));
        transport.flush().await.unwrap();

        assert_eq!(transport.count(), 0);
    }

    #[tokio::test]
    async fn test_cancelled_entries_are_pruned_without_flush() {
        let engine = ScriptedEngine::new(echo_path);
        let transport = MultiplexedTransport::new(engine.clone(), config(5));

        for i in 0..10 {
            drop(transport.send_async_request(get(&format!("/gone{i}"))));
        }
        let kept = transport.send_async_request(get("/kept"));
        assert_eq!(transport.count(), 1);

        assert_eq!(kept.await.unwrap().body().as_ref(), b"/kept");
        assert_eq!(engine.call_count(), 1);
        assert_eq!(transport.count(), 0);
    }

    #[tokio::test]
    async fn test_batch_behind_retrying_client_is_queued_on_send() {
        use crate::client::PluginClient;
        use crate::config::RetryConfig;
        use crate::plugins::RetryPlugin;

        let engine = ScriptedEngine::new(|request| {
            if request.uri.path() == "/down" {
                Err(TransportFailure::new(TransportErrorCode::CouldNotConnect, "refused"))
            } else {
                echo_path(request)
            }
        });
        let transport = MultiplexedTransport::new(engine.clone(), config(2));
        let retry = RetryPlugin::new(RetryConfig {
            retries: 1,
            ..RetryConfig::default()
        })
        .with_error_delay(|_, _, _| Duration::ZERO);
        let client = PluginClient::builder().plugin(retry).build(transport.clone());

        let ok: Vec<Promise> = (0..4)
            .map(|i| client.send_async_request(get(&format!("/ok{i}"))))
            .collect();
        let down = client.send_async_request(get("/down"));
        assert_eq!(transport.count(), 5);

        transport.flush().await.unwrap();
        assert_eq!(transport.count(), 0);
        assert_eq!(engine.call_count(), 5);

        for (i, promise) in ok.into_iter().enumerate() {
            assert_eq!(promise.await.unwrap().body(), &Bytes::from(format!("/ok{i}")));
        }
        assert!(matches!(down.await, Err(HttpError::Network { .. })));
        assert_eq!(engine.call_count(), 6);
    }
}
