//! Built-in plugins.

pub mod cache;
mod cookie;
mod decoder;
mod error;
mod headers;
mod query;
mod redirect;
mod retry;
mod uri;

pub use cache::{AddHeaderCacheListener, CacheListener, CachePlugin};
pub use cookie::{Cookie, CookieJar, CookiePlugin};
pub use decoder::{DEFAULT_MAX_DECODED_SIZE, DecoderPlugin};
pub use error::ErrorPlugin;
pub use headers::{HeaderAppendPlugin, HeaderDefaultsPlugin, HeaderRemovePlugin, HeaderSetPlugin, UserAgentPlugin};
pub use query::QueryDefaultsPlugin;
pub use redirect::RedirectPlugin;
pub use retry::{ErrorDecider, ErrorDelay, ResponseDecider, ResponseDelay, RetryPlugin, calculate_backoff};
pub use uri::{AddHostPlugin, AddPathPlugin, BaseUriPlugin};
