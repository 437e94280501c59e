use serde::Deserialize;
use std::time::Duration;

/// Default ceiling for chain restarts per dispatch.
pub const DEFAULT_MAX_RESTARTS: usize = 10;

/// Default number of reusable transport handles kept by the multiplexed driver.
pub const DEFAULT_MAX_HANDLES: usize = 5;

/// Default user agent for [`crate::plugins::UserAgentPlugin`]
pub const DEFAULT_USER_AGENT: &str = concat!("plugin-http/", env!("CARGO_PKG_VERSION"));

/// Humantime (`"30s"`, `"1h 5m"`) deserialization for `Duration` fields.
pub(crate) mod humantime_duration {
    use serde::de::{Error, Visitor};
    use serde::{Deserialize, Deserializer};
    use std::fmt;
    use std::time::Duration;

    struct DurationVisitor;

    impl Visitor<'_> for DurationVisitor {
        type Value = Duration;

        fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str("a duration such as \"30s\" or \"1h 5m\"")
        }

        fn visit_str<E: Error>(self, v: &str) -> Result<Duration, E> {
            humantime::parse_duration(v).map_err(|e| E::custom(format!("{e}: {v:?}")))
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        d.deserialize_str(DurationVisitor)
    }

    pub mod option {
        use super::{Deserialize, Deserializer, Duration};

        #[derive(Deserialize)]
        struct Wrapped(#[serde(deserialize_with = "super::deserialize")] Duration);

        pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
            Ok(Option::<Wrapped>::deserialize(d)?.map(|w| w.0))
        }
    }
}

/// TLS root certificate configuration
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
#[non_exhaustive]
pub enum TlsRootConfig {
    /// Use Mozilla's root certificates (webpki-roots, no OS dependency)
    #[default]
    WebPki,
    /// Use OS native root certificate store
    Native,
}

/// Per-request transport options.
///
/// Attach to a request as an extension to override the transport's
/// defaults for that request only:
///
/// ```ignore
/// request.extensions_mut().insert(TransportOptions {
///     timeout: Duration::from_secs(2),
///     ..TransportOptions::default()
/// });
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TransportOptions {
    /// Let the transport follow redirects itself (default: false; the
    /// redirect plugin is the usual way to follow them).
    pub allow_redirects: bool,

    /// Redirect budget when `allow_redirects` is set (default: 5)
    pub max_redirects: usize,

    /// Whole-request timeout (default: 30s)
    #[serde(with = "humantime_duration")]
    pub timeout: Duration,

    /// Verify the server certificate (default: true)
    pub verify: bool,

    /// HTTP proxy URI used with CONNECT tunneling
    pub proxy: Option<String>,
}

impl Default for TransportOptions {
    fn default() -> Self {
        Self {
            allow_redirects: false,
            max_redirects: 5,
            timeout: Duration::from_secs(30),
            verify: true,
            proxy: None,
        }
    }
}

/// Transport engine and driver configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TransportConfig {
    /// Options used when a request carries no [`TransportOptions`] extension
    pub defaults: TransportOptions,

    /// Request bodies smaller than this are sent as one buffer; larger ones
    /// are streamed in `chunk_size` pieces (default: 1 MiB)
    pub buffer_threshold: usize,

    /// Chunk size for streamed request bodies (default: 64 KiB)
    pub chunk_size: usize,

    /// Maximum response body size (default: 10 MiB)
    pub max_body_size: usize,

    /// Reusable handles kept by the multiplexed driver (default: 5)
    pub max_handles: usize,

    /// TLS root certificate source
    pub tls_roots: TlsRootConfig,

    /// Idle connection timeout (default: 90s, `None` keeps connections forever)
    #[serde(with = "humantime_duration::option")]
    pub pool_idle_timeout: Option<Duration>,

    /// Idle connections kept per host (default: 32)
    pub pool_max_idle_per_host: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            defaults: TransportOptions::default(),
            buffer_threshold: 1024 * 1024,
            chunk_size: 64 * 1024,
            max_body_size: 10 * 1024 * 1024,
            max_handles: DEFAULT_MAX_HANDLES,
            tls_roots: TlsRootConfig::default(),
            pool_idle_timeout: Some(Duration::from_secs(90)),
            pool_max_idle_per_host: 32,
        }
    }
}

impl TransportConfig {
    /// Short timeouts, tiny buffers. For tests against local mock servers.
    #[must_use]
    pub fn for_testing() -> Self {
        Self {
            defaults: TransportOptions {
                timeout: Duration::from_secs(5),
                ..TransportOptions::default()
            },
            buffer_threshold: 16,
            chunk_size: 8,
            max_body_size: 1024 * 1024,
            pool_idle_timeout: Some(Duration::from_secs(5)),
            ..Self::default()
        }
    }
}

/// Which request headers survive a redirect.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(from = "PreserveHeadersRepr")]
pub enum PreserveHeaders {
    /// Keep every header (default)
    All,
    /// Drop every header
    None,
    /// Keep only the listed headers (case-insensitive)
    Named(Vec<String>),
}

#[derive(Deserialize)]
#[serde(untagged)]
enum PreserveHeadersRepr {
    Flag(bool),
    Names(Vec<String>),
}

impl From<PreserveHeadersRepr> for PreserveHeaders {
    fn from(repr: PreserveHeadersRepr) -> Self {
        match repr {
            PreserveHeadersRepr::Flag(true) => Self::All,
            PreserveHeadersRepr::Flag(false) => Self::None,
            PreserveHeadersRepr::Names(names) => Self::Named(names),
        }
    }
}

/// Redirect plugin configuration
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RedirectConfig {
    /// Headers carried over to the redirected request (default: all)
    pub preserve_header: PreserveHeaders,

    /// Follow the `Location` of a 300 response instead of failing (default: true)
    pub use_default_for_multiple: bool,

    /// Keep the request method on 300/301/302 (default: false)
    pub strict: bool,
}

impl Default for RedirectConfig {
    fn default() -> Self {
        Self {
            preserve_header: PreserveHeaders::All,
            use_default_for_multiple: true,
            strict: false,
        }
    }
}

impl RedirectConfig {
    /// Drop everything but the listed headers when following redirects.
    #[must_use]
    pub fn preserving(names: &[&str]) -> Self {
        Self {
            preserve_header: PreserveHeaders::Named(
                names.iter().map(|n| (*n).to_owned()).collect(),
            ),
            ..Self::default()
        }
    }
}

/// Exponential backoff configuration for retries
///
/// Computes delay as: `min(initial * multiplier^attempt, max)` with optional jitter.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ExponentialBackoff {
    /// Delay before the first retry (default: 500ms)
    #[serde(with = "humantime_duration")]
    pub initial: Duration,

    /// Upper bound of a single delay (default: 1 day)
    #[serde(with = "humantime_duration")]
    pub max: Duration,

    /// Growth factor per attempt (default: 2.0)
    pub multiplier: f64,

    /// Add 0-25% random delay (default: false)
    pub jitter: bool,
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(500),
            max: Duration::from_secs(86_400),
            multiplier: 2.0,
            jitter: false,
        }
    }
}

impl ExponentialBackoff {
    /// 1ms initial, 100ms max, no jitter
    #[must_use]
    pub fn fast() -> Self {
        Self {
            initial: Duration::from_millis(1),
            max: Duration::from_millis(100),
            multiplier: 2.0,
            jitter: false,
        }
    }

    /// Same delay for every attempt.
    #[must_use]
    pub fn constant(delay: Duration) -> Self {
        Self {
            initial: delay,
            max: delay,
            multiplier: 1.0,
            jitter: false,
        }
    }
}

/// Retry plugin configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RetryConfig {
    /// Retries after the first attempt (default: 1)
    pub retries: usize,

    /// Delay schedule used by the default delay functions
    pub backoff: ExponentialBackoff,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            retries: 1,
            backoff: ExponentialBackoff::default(),
        }
    }
}

impl RetryConfig {
    /// No retries at all.
    #[must_use]
    pub fn disabled() -> Self {
        Self {
            retries: 0,
            ..Self::default()
        }
    }
}

/// Cache-Control directives the cache plugin may honor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CacheDirective {
    NoCache,
    Private,
    NoStore,
    MaxAge,
}

impl CacheDirective {
    /// Directive name as it appears in `Cache-Control`.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::NoCache => "no-cache",
            Self::Private => "private",
            Self::NoStore => "no-store",
            Self::MaxAge => "max-age",
        }
    }
}

/// Cache plugin configuration
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CacheConfig {
    /// TTL used when the response carries no freshness information.
    /// `None` stores entries without a time-based expiry (default: 0s)
    #[serde(with = "humantime_duration::option")]
    pub default_ttl: Option<Duration>,

    /// Extra retention after expiry so stale entries can be revalidated
    /// (default: 30 days)
    #[serde(with = "humantime_duration")]
    pub cache_lifetime: Duration,

    /// Cacheable request methods (default: GET, HEAD)
    pub methods: Vec<String>,

    /// Response directives that are honored
    pub respect_response_cache_directives: Vec<CacheDirective>,

    /// Request headers whose values vary the cache key
    pub cache_key_headers: Vec<String>,

    /// Path regexes that are never cached
    pub blacklisted_paths: Vec<String>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            default_ttl: Some(Duration::ZERO),
            cache_lifetime: Duration::from_secs(86_400 * 30),
            methods: vec!["GET".to_owned(), "HEAD".to_owned()],
            respect_response_cache_directives: vec![
                CacheDirective::NoCache,
                CacheDirective::Private,
                CacheDirective::NoStore,
                CacheDirective::MaxAge,
            ],
            cache_key_headers: Vec::new(),
            blacklisted_paths: Vec::new(),
        }
    }
}

impl CacheConfig {
    /// Shared cache: every directive is honored.
    #[must_use]
    pub fn server_cache() -> Self {
        Self::default()
    }

    /// Private cache of a single user agent: `private` responses are stored.
    #[must_use]
    pub fn client_cache() -> Self {
        let mut config = Self::default();
        config
            .respect_response_cache_directives
            .retain(|d| *d != CacheDirective::Private);
        config
    }

    #[must_use]
    pub fn respects(&self, directive: CacheDirective) -> bool {
        self.respect_response_cache_directives.contains(&directive)
    }
}

/// Pool selection strategy
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PoolStrategy {
    /// Uniform choice among enabled clients
    Random,
    /// Cycle through enabled clients (default)
    #[default]
    RoundRobin,
    /// Client with the fewest in-flight requests
    LeastUsed,
}

/// Plugin client configuration
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PluginClientConfig {
    /// Restarts allowed per dispatch before [`crate::HttpError::Loop`] (default: 10)
    pub max_restarts: usize,
}

impl Default for PluginClientConfig {
    fn default() -> Self {
        Self {
            max_restarts: DEFAULT_MAX_RESTARTS,
        }
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;

    #[test]
    fn test_transport_options_defaults() {
        let options = TransportOptions::default();
        assert!(!options.allow_redirects);
        assert_eq!(options.max_redirects, 5);
        assert_eq!(options.timeout, Duration::from_secs(30));
        assert!(options.verify);
        assert!(options.proxy.is_none());
    }

    #[test]
    fn test_transport_config_deserialize_humantime() {
        let config: TransportConfig = serde_json::from_value(serde_json::json!({
            "defaults": { "timeout": "2s 500ms", "verify": false },
            "max_handles": 2,
            "pool_idle_timeout": null,
        }))
        .unwrap();

        assert_eq!(config.defaults.timeout, Duration::from_millis(2500));
        assert!(!config.defaults.verify);
        assert_eq!(config.max_handles, 2);
        assert_eq!(config.pool_idle_timeout, None);
        assert_eq!(config.buffer_threshold, 1024 * 1024);
    }

    #[test]
    fn test_transport_config_rejects_unknown_fields() {
        let result: Result<TransportConfig, _> =
            serde_json::from_value(serde_json::json!({ "max_handle": 2 }));
        assert!(result.is_err());
    }

    #[test]
    fn test_preserve_header_accepts_bool_or_list() {
        let all: RedirectConfig =
            serde_json::from_value(serde_json::json!({ "preserve_header": true })).unwrap();
        assert_eq!(all.preserve_header, PreserveHeaders::All);

        let none: RedirectConfig =
            serde_json::from_value(serde_json::json!({ "preserve_header": false })).unwrap();
        assert_eq!(none.preserve_header, PreserveHeaders::None);

        let named: RedirectConfig = serde_json::from_value(serde_json::json!({
            "preserve_header": ["Accept", "X-Trace"],
            "use_default_for_multiple": false,
        }))
        .unwrap();
        assert_eq!(
            named.preserve_header,
            PreserveHeaders::Named(vec!["Accept".to_owned(), "X-Trace".to_owned()])
        );
        assert!(!named.use_default_for_multiple);
    }

    #[test]
    fn test_retry_config_defaults() {
        let config = RetryConfig::default();
        assert_eq!(config.retries, 1);
        assert_eq!(config.backoff.initial, Duration::from_millis(500));
        assert!(!config.backoff.jitter);
    }

    #[test]
    fn test_cache_presets_differ_only_in_private() {
        let server = CacheConfig::server_cache();
        let client = CacheConfig::client_cache();

        assert!(server.respects(CacheDirective::Private));
        assert!(!client.respects(CacheDirective::Private));
        assert!(client.respects(CacheDirective::NoStore));
        assert!(client.respects(CacheDirective::MaxAge));
        assert_eq!(server.methods, client.methods);
    }

    #[test]
    fn test_cache_config_deserialize() {
        let config: CacheConfig = serde_json::from_value(serde_json::json!({
            "default_ttl": null,
            "cache_lifetime": "1h",
            "respect_response_cache_directives": ["no-store", "max-age"],
            "cache_key_headers": ["Accept-Language"],
        }))
        .unwrap();

        assert_eq!(config.default_ttl, None);
        assert_eq!(config.cache_lifetime, Duration::from_secs(3600));
        assert!(!config.respects(CacheDirective::NoCache));
        assert!(config.respects(CacheDirective::NoStore));
        assert_eq!(config.methods, vec!["GET", "HEAD"]);
    }

    #[test]
    fn test_pool_strategy_names() {
        let strategy: PoolStrategy = serde_json::from_value(serde_json::json!("least_used")).unwrap();
        assert_eq!(strategy, PoolStrategy::LeastUsed);
        assert_eq!(PoolStrategy::default(), PoolStrategy::RoundRobin);
    }
}
