use super::{HyperEngine, TransportEngine, bind_request};
use crate::client::HttpClient;
use crate::config::TransportConfig;
use crate::error::HttpError;
use crate::message::Request;
use crate::promise::Promise;
use std::sync::Arc;

/// Transport client running each request on its own.
#[derive(Clone)]
pub struct SingleTransport {
    engine: Arc<dyn TransportEngine>,
    config: Arc<TransportConfig>,
}

impl SingleTransport {
    #[must_use]
    pub fn new(engine: Arc<dyn TransportEngine>, config: TransportConfig) -> Self {
        Self {
            engine,
            config: Arc::new(config),
        }
    }

    /// Transport over a [`HyperEngine`] built from `config`.
    ///
    /// # Errors
    ///
    /// Propagates engine construction failures (TLS roots, proxy URI).
    pub fn hyper(config: TransportConfig) -> Result<Self, HttpError> {
        let engine = HyperEngine::new(config.clone())?;
        Ok(Self::new(Arc::new(engine), config))
    }
}

impl HttpClient for SingleTransport {
    fn send_async_request(&self, request: Request) -> Promise {
        let prepared = match bind_request(request, &self.config) {
            Ok(prepared) => prepared,
            Err(err) => return Promise::rejected(err),
        };
        tracing::trace!(method = %prepared.method, uri = %prepared.uri, "sending request");
        let execution = self.engine.execute(prepared);
        Promise::new(async move { execution.await.map_err(HttpError::from) })
    }
}
