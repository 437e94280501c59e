use crate::message::Response;
use crate::transport::TransportErrorCode;
use thiserror::Error;

/// Boxed error source carried by transport failures.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Classification of URL validation failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum InvalidUriKind {
    /// URL could not be parsed (malformed syntax)
    ParseError,
    /// URL is missing required host/authority component
    MissingAuthority,
    /// URL is missing required scheme (http/https)
    MissingScheme,
}

/// Errors produced by the plugin client, its plugins and its transports.
///
/// Transport failures are split into [`HttpError::Network`] (the request
/// could not reach the server: resolve, connect, TLS, timeout) and
/// [`HttpError::Request`] (everything else the transport reports). Status
/// errors are only produced when an [`crate::plugins::ErrorPlugin`] is part
/// of the chain.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum HttpError {
    /// The request never reached the server (resolve, connect, TLS, timeout).
    #[error("Network error ({code}): {message}")]
    Network {
        code: TransportErrorCode,
        message: String,
        #[source]
        source: Option<BoxError>,
    },

    /// The transport failed for a reason other than connectivity.
    #[error("Request failed ({code}): {message}")]
    Request {
        code: TransportErrorCode,
        message: String,
        #[source]
        source: Option<BoxError>,
    },

    /// 4xx response converted to an error.
    #[error("Client error {status}")]
    ClientError {
        status: http::StatusCode,
        response: Box<Response>,
    },

    /// 5xx response converted to an error.
    #[error("Server error {status}")]
    ServerError {
        status: http::StatusCode,
        response: Box<Response>,
    },

    /// A redirect pointed back to a URI already visited by this dispatch.
    #[error("Circular redirection detected: {uri}")]
    CircularRedirection { uri: String },

    /// A multiple-choices response could not be resolved to a single target.
    #[error("Cannot choose a redirection for status {status}")]
    MultipleRedirection { status: http::StatusCode },

    /// Redirect response with a missing or unusable `Location` header.
    #[error("Invalid redirect: {reason}")]
    InvalidRedirect { reason: String },

    /// The chain was restarted more often than allowed.
    #[error("Too many restarts in plugin chain (limit {max_restarts})")]
    Loop { max_restarts: usize },

    /// No enabled client is available in the pool.
    #[error("Cannot choose a http client as there is no one enabled in the pool")]
    ClientNotFound,

    /// The client or chain is misconfigured (e.g. no terminal plugin).
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Response body exceeded size limit
    #[error("Response body too large: limit {limit} bytes, got {actual} bytes")]
    BodyTooLarge { limit: usize, actual: usize },

    /// Content-Encoding could not be decoded.
    #[error("Failed to decode response body ({encoding}): {source}")]
    Decode {
        encoding: String,
        #[source]
        source: std::io::Error,
    },

    /// Invalid URL (failed to parse or unusable by the transport)
    ///
    /// The `reason` field is a diagnostic message; match on `kind` instead.
    #[error("Invalid URL '{url}': {reason}")]
    InvalidUri {
        url: String,
        kind: InvalidUriKind,
        reason: String,
    },

    /// Request building failed
    #[error("Failed to build request: {0}")]
    RequestBuild(#[from] http::Error),

    /// Invalid header name
    #[error("Invalid header name: {0}")]
    InvalidHeaderName(#[from] http::header::InvalidHeaderName),

    /// Invalid header value
    #[error("Invalid header value: {0}")]
    InvalidHeaderValue(#[from] http::header::InvalidHeaderValue),

    /// Internal driver failure (worker dropped, channel closed)
    #[error("Service unavailable: internal failure")]
    ServiceClosed,
}

impl HttpError {
    /// Build a network error without an underlying source.
    #[must_use]
    pub fn network(code: TransportErrorCode, message: impl Into<String>) -> Self {
        Self::Network {
            code,
            message: message.into(),
            source: None,
        }
    }

    /// Build a request error without an underlying source.
    #[must_use]
    pub fn request(code: TransportErrorCode, message: impl Into<String>) -> Self {
        Self::Request {
            code,
            message: message.into(),
            source: None,
        }
    }

    /// Whether this error means the request never reached the server.
    #[must_use]
    pub fn is_network(&self) -> bool {
        matches!(self, Self::Network { .. })
    }

    /// Transport error code, if the error came from a transport.
    #[must_use]
    pub fn transport_code(&self) -> Option<TransportErrorCode> {
        match self {
            Self::Network { code, .. } | Self::Request { code, .. } => Some(*code),
            _ => None,
        }
    }

    /// The response attached to status errors.
    #[must_use]
    pub fn response(&self) -> Option<&Response> {
        match self {
            Self::ClientError { response, .. } | Self::ServerError { response, .. } => {
                Some(response)
            }
            _ => None,
        }
    }
}
