//! Transport drivers.
//!
//! A [`TransportEngine`] executes one prepared request on the network. The
//! drivers on top of it share the same bind/execute/map steps:
//! [`SingleTransport`] runs each request on its own, [`MultiplexedTransport`]
//! queues requests and advances all of them from one `proceed()` loop.

mod body;
mod hyper_engine;
mod multiplexed;
mod single;
mod tls;

pub use body::{LimitedBody, WireBody};
pub use hyper_engine::HyperEngine;
pub use multiplexed::{HandleStats, MultiplexedTransport};
pub use single::SingleTransport;

use crate::config::{TransportConfig, TransportOptions};
use crate::error::{BoxError, HttpError, InvalidUriKind};
use crate::message::{Request, Response};
use futures::future::BoxFuture;
use http::{HeaderMap, Method, Uri, Version};
use std::fmt;
use std::sync::Arc;

/// Low-level completion code reported by a transport engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum TransportErrorCode {
    CouldNotResolveProxy,
    CouldNotResolveHost,
    CouldNotConnect,
    OperationTimedOut,
    SslConnectError,
    TooManyRedirects,
    SendError,
    ReceiveError,
    Other,
}

impl TransportErrorCode {
    /// Codes meaning the request never reached the server.
    #[must_use]
    pub fn is_network(self) -> bool {
        matches!(
            self,
            Self::CouldNotResolveProxy
                | Self::CouldNotResolveHost
                | Self::CouldNotConnect
                | Self::OperationTimedOut
                | Self::SslConnectError
        )
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::CouldNotResolveProxy => "could_not_resolve_proxy",
            Self::CouldNotResolveHost => "could_not_resolve_host",
            Self::CouldNotConnect => "could_not_connect",
            Self::OperationTimedOut => "operation_timed_out",
            Self::SslConnectError => "ssl_connect_error",
            Self::TooManyRedirects => "too_many_redirects",
            Self::SendError => "send_error",
            Self::ReceiveError => "receive_error",
            Self::Other => "other",
        }
    }
}

impl fmt::Display for TransportErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Failure reported by a [`TransportEngine`].
#[derive(Debug, thiserror::Error)]
#[error("{code}: {message}")]
pub struct TransportFailure {
    pub code: TransportErrorCode,
    pub message: String,
    #[source]
    pub source: Option<BoxError>,
}

impl TransportFailure {
    #[must_use]
    pub fn new(code: TransportErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            source: None,
        }
    }

    #[must_use]
    pub fn with_source(mut self, source: impl Into<BoxError>) -> Self {
        self.source = Some(source.into());
        self
    }
}

impl From<TransportFailure> for HttpError {
    fn from(failure: TransportFailure) -> Self {
        let TransportFailure {
            code,
            message,
            source,
        } = failure;
        if code.is_network() {
            HttpError::Network {
                code,
                message,
                source,
            }
        } else {
            HttpError::Request {
                code,
                message,
                source,
            }
        }
    }
}

/// Request bound for the wire: validated URI, resolved options and the
/// body strategy chosen for its size.
#[derive(Debug)]
pub struct PreparedRequest {
    pub method: Method,
    pub uri: Uri,
    pub version: Version,
    pub headers: HeaderMap,
    pub body: WireBody,
    pub options: TransportOptions,
}

/// Executes one request against the network.
pub trait TransportEngine: Send + Sync + 'static {
    fn execute(&self, request: PreparedRequest)
    -> BoxFuture<'static, Result<Response, TransportFailure>>;
}

impl<E: TransportEngine + ?Sized> TransportEngine for Arc<E> {
    fn execute(
        &self,
        request: PreparedRequest,
    ) -> BoxFuture<'static, Result<Response, TransportFailure>> {
        (**self).execute(request)
    }
}

/// Validate a request and turn it into a [`PreparedRequest`].
///
/// Options come from the request's [`TransportOptions`] extension, falling
/// back to `config.defaults`. Bodies below `config.buffer_threshold` are
/// sent as one buffer, larger ones are streamed in `config.chunk_size`
/// pieces.
///
/// # Errors
///
/// Returns [`HttpError::InvalidUri`] when the URI lacks an `http`/`https`
/// scheme or an authority.
pub fn bind_request(request: Request, config: &TransportConfig) -> Result<PreparedRequest, HttpError> {
    let uri = request.uri();
    let invalid = |kind, reason: &str| HttpError::InvalidUri {
        url: uri.to_string(),
        kind,
        reason: reason.to_owned(),
    };

    match uri.scheme_str() {
        Some("http" | "https") => {}
        Some(_) => {
            return Err(invalid(
                InvalidUriKind::MissingScheme,
                "only http and https are supported",
            ));
        }
        None => return Err(invalid(InvalidUriKind::MissingScheme, "missing scheme")),
    }
    if uri.authority().is_none() {
        return Err(invalid(InvalidUriKind::MissingAuthority, "missing host"));
    }

    let options = request
        .extensions()
        .get::<TransportOptions>()
        .cloned()
        .unwrap_or_else(|| config.defaults.clone());

    let (parts, body) = request.into_parts();
    let body = if body.len() < config.buffer_threshold {
        WireBody::full(body)
    } else {
        tracing::trace!(size = body.len(), "streaming request body");
        WireBody::chunked(body, config.chunk_size)
    };

    Ok(PreparedRequest {
        method: parts.method,
        uri: parts.uri,
        version: parts.version,
        headers: parts.headers,
        body,
        options,
    })
}
