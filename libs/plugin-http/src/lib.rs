#![cfg_attr(coverage_nightly, feature(coverage_attribute))]
#![warn(warnings)]

//! Plugin-chain HTTP client
//!
//! Requests go through an ordered chain of plugins before reaching a
//! transport:
//! - Redirect following with permanent-redirect memoization and loop detection
//! - Retries with exponential backoff and pluggable deciders
//! - HTTP caching with conditional revalidation
//! - Content decoding, cookies, header and URI helpers
//! - Pooled clients with circuit breaking and three selection strategies
//! - A multiplexed transport running many requests over bounded handles
//!
//! Every client returns a [`Promise`], which can be awaited or resolved
//! synchronously with [`Promise::wait`].
//!
//! # Example
//!
//! ```ignore
//! use plugin_http::plugins::{RedirectPlugin, RetryPlugin};
//! use plugin_http::{HttpClient, PluginClient, RetryConfig, SingleTransport, TransportConfig};
//!
//! let client = PluginClient::builder()
//!     .plugin(RedirectPlugin::default())
//!     .plugin(RetryPlugin::new(RetryConfig::default()))
//!     .build(SingleTransport::hyper(TransportConfig::default())?);
//!
//! let request = http::Request::get("https://example.com/api").body(bytes::Bytes::new())?;
//! let response = client.send_async_request(request).await?;
//! ```

mod builder;
pub mod chain;
mod client;
pub mod clock;
mod config;
mod error;
mod message;
pub mod plugins;
pub mod pool;
mod promise;
pub mod transport;

#[cfg(test)]
mod testing;

pub use builder::PluginClientBuilder;
pub use chain::{ChainEntry, ChainId, Plugin, PluginChain, RequestHandler, RequestMatcher, plugin_fn};
pub use client::{BatchClient, HttpClient, PluginClient, SendPlugin};
pub use config::{
    CacheConfig, CacheDirective, DEFAULT_MAX_HANDLES, DEFAULT_MAX_RESTARTS, DEFAULT_USER_AGENT, ExponentialBackoff,
    PluginClientConfig, PoolStrategy, PreserveHeaders, RedirectConfig, RetryConfig, TlsRootConfig, TransportConfig,
    TransportOptions,
};
pub use error::{BoxError, HttpError, InvalidUriKind};
pub use message::{Request, Response, clone_request, clone_response, header_line, with_uri};
pub use pool::{HttpClientPool, PoolItem};
pub use promise::Promise;
pub use transport::{MultiplexedTransport, SingleTransport, TransportEngine, TransportErrorCode};
