//! Deferred result type shared by plugins and clients.
//!
//! A [`Promise`] is a boxed `Send` future resolving to `Result<T, HttpError>`.
//! It composes with `then`/`map`/`and_then`/`or_else` without blocking, can be
//! `.await`ed directly, and offers a blocking [`Promise::wait`] for
//! synchronous callers.

use crate::error::HttpError;
use crate::message::Response;
use futures::future::BoxFuture;
use std::future::Future;
use std::pin::Pin;
use std::sync::OnceLock;
use std::task::{Context, Poll};
use tokio::runtime::{Handle, Runtime, RuntimeFlavor};

/// Runtime used by [`Promise::wait`] when the caller is not inside a
/// multi-threaded tokio runtime.
static WAIT_RUNTIME: OnceLock<Option<Runtime>> = OnceLock::new();

fn wait_runtime() -> Result<&'static Runtime, HttpError> {
    WAIT_RUNTIME
        .get_or_init(|| {
            tokio::runtime::Builder::new_multi_thread()
                .worker_threads(1)
                .thread_name("plugin-http-wait")
                .enable_all()
                .build()
                .map_err(|e| tracing::error!(error = %e, "failed to start blocking wait runtime"))
                .ok()
        })
        .as_ref()
        .ok_or(HttpError::ServiceClosed)
}

/// Single-assignment deferred result.
#[must_use = "promises do nothing unless awaited or waited on"]
pub struct Promise<T = Response> {
    inner: BoxFuture<'static, Result<T, HttpError>>,
}

impl<T: Send + 'static> Promise<T> {
    /// Wrap a future.
    pub fn new<F>(future: F) -> Self
    where
        F: Future<Output = Result<T, HttpError>> + Send + 'static,
    {
        Self {
            inner: Box::pin(future),
        }
    }

    /// Already resolved promise.
    pub fn fulfilled(value: T) -> Self {
        Self::new(std::future::ready(Ok(value)))
    }

    /// Already rejected promise.
    pub fn rejected(error: HttpError) -> Self {
        Self::new(std::future::ready(Err(error)))
    }

    /// Register both continuations at once.
    pub fn then<U, S, R>(self, on_fulfilled: S, on_rejected: R) -> Promise<U>
    where
        U: Send + 'static,
        S: FnOnce(T) -> Promise<U> + Send + 'static,
        R: FnOnce(HttpError) -> Promise<U> + Send + 'static,
    {
        Promise::new(async move {
            match self.inner.await {
                Ok(value) => on_fulfilled(value).await,
                Err(error) => on_rejected(error).await,
            }
        })
    }

    /// Transform the resolved value.
    pub fn map<U, F>(self, f: F) -> Promise<U>
    where
        U: Send + 'static,
        F: FnOnce(T) -> U + Send + 'static,
    {
        Promise::new(async move { self.inner.await.map(f) })
    }

    /// Chain another promise on success.
    pub fn and_then<U, F>(self, f: F) -> Promise<U>
    where
        U: Send + 'static,
        F: FnOnce(T) -> Promise<U> + Send + 'static,
    {
        self.then(f, Promise::rejected)
    }

    /// Recover from (or translate) a rejection.
    pub fn or_else<F>(self, f: F) -> Self
    where
        F: FnOnce(HttpError) -> Promise<T> + Send + 'static,
    {
        self.then(Promise::fulfilled, f)
    }

    /// Block the current thread until the promise settles.
    ///
    /// Inside a multi-threaded tokio runtime the worker is handed over with
    /// `block_in_place`. Outside a runtime, or on a current-thread runtime
    /// which must not be blocked, the promise is driven by a small shared
    /// background runtime.
    ///
    /// # Errors
    ///
    /// Returns the rejection of the promise, or [`HttpError::ServiceClosed`]
    /// if the background runtime is unavailable.
    pub fn wait(self) -> Result<T, HttpError> {
        match Handle::try_current() {
            Ok(handle) if handle.runtime_flavor() == RuntimeFlavor::MultiThread => {
                tokio::task::block_in_place(|| handle.block_on(self.inner))
            }
            Ok(_) => {
                let (tx, rx) = std::sync::mpsc::sync_channel(1);
                wait_runtime()?.spawn(async move {
                    // Receiver may be gone if the waiting thread panicked.
                    _ = tx.send(self.inner.await);
                });
                rx.recv().map_err(|_| HttpError::ServiceClosed)?
            }
            Err(_) => wait_runtime()?.block_on(self.inner),
        }
    }
}

impl<T> Future for Promise<T> {
    type Output = Result<T, HttpError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        self.inner.as_mut().poll(cx)
    }
}

impl<T> std::fmt::Debug for Promise<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Promise").finish_non_exhaustive()
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;
    use crate::transport::TransportErrorCode;

    fn failure() -> HttpError {
        HttpError::network(TransportErrorCode::CouldNotConnect, "refused")
    }

    #[tokio::test]
    async fn test_then_routes_success_and_failure() {
        let ok = Promise::fulfilled(2_u32)
            .then(|v| Promise::fulfilled(v * 10), |_| Promise::fulfilled(0))
            .await
            .unwrap();
        assert_eq!(ok, 20);

        let recovered = Promise::<u32>::rejected(failure())
            .then(|v| Promise::fulfilled(v * 10), |_| Promise::fulfilled(99))
            .await
            .unwrap();
        assert_eq!(recovered, 99);
    }

    #[tokio::test]
    async fn test_and_then_skips_on_rejection() {
        let result = Promise::<u32>::rejected(failure())
            .and_then(|v| Promise::fulfilled(v + 1))
            .await;
        assert!(matches!(result, Err(HttpError::Network { .. })));
    }

    #[tokio::test]
    async fn test_or_else_translates_error() {
        let result = Promise::<u32>::rejected(failure())
            .or_else(|_| Promise::rejected(HttpError::ClientNotFound))
            .await;
        assert!(matches!(result, Err(HttpError::ClientNotFound)));
    }

    #[test]
    fn test_wait_without_runtime() {
        let value = Promise::new(async {
            tokio::time::sleep(std::time::Duration::from_millis(1)).await;
            Ok(5_u8)
        })
        .map(|v| v + 1)
        .wait()
        .unwrap();
        assert_eq!(value, 6);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_wait_inside_multi_thread_runtime() {
        let value = Promise::fulfilled("done").wait().unwrap();
        assert_eq!(value, "done");
    }

    #[tokio::test]
    async fn test_wait_inside_current_thread_runtime() {
        let result = Promise::<()>::rejected(HttpError::ClientNotFound).wait();
        assert!(matches!(result, Err(HttpError::ClientNotFound)));
    }
}
