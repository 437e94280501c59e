use crate::builder::PluginClientBuilder;
use crate::chain::{Plugin, PluginChain, RequestHandler};
use crate::error::HttpError;
use crate::message::{Request, Response};
use crate::promise::Promise;
use std::sync::Arc;

/// Anything that turns a request into a response.
///
/// Implemented by the transports, the pool, pool items and the
/// [`PluginClient`] facade.
pub trait HttpClient: Send + Sync {
    fn send_async_request(&self, request: Request) -> Promise;

    /// Blocking variant of [`HttpClient::send_async_request`].
    ///
    /// # Errors
    ///
    /// Returns whatever error the promise is rejected with.
    fn send_request(&self, request: Request) -> Result<Response, HttpError> {
        self.send_async_request(request).wait()
    }
}

impl<C: HttpClient + ?Sized> HttpClient for Arc<C> {
    fn send_async_request(&self, request: Request) -> Promise {
        (**self).send_async_request(request)
    }

    fn send_request(&self, request: Request) -> Result<Response, HttpError> {
        (**self).send_request(request)
    }
}

/// Client whose requests only progress when driven.
pub trait BatchClient: HttpClient {
    /// Requests queued and not yet settled.
    fn count(&self) -> usize;

    /// Advance queued requests until at least one settles.
    fn proceed(&self) -> Promise<()>;

    /// Advance until the queue is empty.
    fn flush(&self) -> Promise<()>;
}

/// Terminal plugin handing the request to the wrapped client.
pub struct SendPlugin {
    client: Arc<dyn HttpClient>,
}

impl SendPlugin {
    #[must_use]
    pub fn new(client: Arc<dyn HttpClient>) -> Self {
        Self { client }
    }
}

impl Plugin for SendPlugin {
    fn process(&self, request: Request, _next: RequestHandler) -> Promise {
        self.client.send_async_request(request)
    }
}

/// Client facade running every request through a plugin chain that ends
/// in the wrapped transport.
///
/// ```ignore
/// let client = PluginClient::builder()
///     .plugin(RedirectPlugin::default())
///     .plugin(RetryPlugin::new(RetryConfig::default()))
///     .build(SingleTransport::hyper(TransportConfig::default())?);
///
/// let response = client.send_async_request(request).await?;
/// ```
#[derive(Clone)]
pub struct PluginClient {
    chain: PluginChain,
}

impl PluginClient {
    #[must_use]
    pub fn builder() -> PluginClientBuilder {
        PluginClientBuilder::new()
    }

    pub(crate) fn from_chain(chain: PluginChain) -> Self {
        Self { chain }
    }

    #[must_use]
    pub fn chain(&self) -> &PluginChain {
        &self.chain
    }
}

impl HttpClient for PluginClient {
    fn send_async_request(&self, request: Request) -> Promise {
        self.chain.dispatch(request)
    }
}

impl std::fmt::Debug for PluginClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginClient")
            .field("chain", &self.chain)
            .finish()
    }
}
