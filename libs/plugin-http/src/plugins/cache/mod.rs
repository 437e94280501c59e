//! HTTP caching plugin.
//!
//! Eligible requests are looked up by a SHA-256 key over method, URI, the
//! configured key headers and (for methods other than GET/HEAD) the body.
//! Fresh entries are answered without touching the network. Stale entries
//! are revalidated with `If-Modified-Since` / `If-None-Match`, and a `304`
//! answer refreshes the stored expiry and replays the stored response.

mod directives;
mod store;

pub use store::{CacheEntry, CacheItem, CacheItemPool, CacheStoreError, InMemoryCachePool};

use crate::chain::{Plugin, RequestHandler};
use crate::clock::{Clock, SystemClock, from_unix_seconds};
use crate::config::CacheConfig;
use crate::error::HttpError;
use crate::message::{Request, Response, clone_request};
use crate::promise::Promise;
use http::header::{HeaderName, HeaderValue, IF_MODIFIED_SINCE, IF_NONE_MATCH};
use http::{Method, StatusCode};
use regex::Regex;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::time::Duration;

/// Observer of responses leaving the cache plugin.
pub trait CacheListener: Send + Sync {
    /// Called for every eligible request; `from_cache` is true when the
    /// response was served or revalidated from the store.
    fn on_cache_response(&self, request: &Request, response: Response, from_cache: bool) -> Response;
}

/// Adds `X-Cache: HIT` or `X-Cache: MISS` to responses.
#[derive(Debug, Clone)]
pub struct AddHeaderCacheListener {
    header: HeaderName,
}

impl AddHeaderCacheListener {
    #[must_use]
    pub fn new(header: HeaderName) -> Self {
        Self { header }
    }
}

impl Default for AddHeaderCacheListener {
    fn default() -> Self {
        Self::new(HeaderName::from_static("x-cache"))
    }
}

impl CacheListener for AddHeaderCacheListener {
    fn on_cache_response(&self, _request: &Request, mut response: Response, from_cache: bool) -> Response {
        let value = if from_cache { "HIT" } else { "MISS" };
        response
            .headers_mut()
            .insert(self.header.clone(), HeaderValue::from_static(value));
        response
    }
}

struct CacheRules {
    config: CacheConfig,
    methods: Vec<Method>,
    key_headers: Vec<HeaderName>,
    blacklist: Vec<Regex>,
}

/// Response cache backed by a [`CacheItemPool`].
#[derive(Clone)]
pub struct CachePlugin {
    pool: Arc<dyn CacheItemPool>,
    rules: Arc<CacheRules>,
    clock: Arc<dyn Clock>,
    listeners: Arc<[Arc<dyn CacheListener>]>,
}

impl CachePlugin {
    /// # Errors
    ///
    /// Returns [`HttpError::Configuration`] for an invalid method, key
    /// header or blacklist pattern.
    pub fn new(pool: Arc<dyn CacheItemPool>, config: CacheConfig) -> Result<Self, HttpError> {
        let methods = config
            .methods
            .iter()
            .map(|m| {
                Method::from_bytes(m.to_ascii_uppercase().as_bytes())
                    .map_err(|_| HttpError::Configuration(format!("invalid cache method: {m}")))
            })
            .collect::<Result<Vec<_>, _>>()?;
        let key_headers = config
            .cache_key_headers
            .iter()
            .map(|h| HeaderName::from_bytes(h.as_bytes()).map_err(HttpError::from))
            .collect::<Result<Vec<_>, _>>()?;
        let blacklist = config
            .blacklisted_paths
            .iter()
            .map(|p| {
                Regex::new(p).map_err(|e| HttpError::Configuration(format!("invalid blacklisted path {p}: {e}")))
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            pool,
            rules: Arc::new(CacheRules {
                config,
                methods,
                key_headers,
                blacklist,
            }),
            clock: Arc::new(SystemClock),
            listeners: Arc::from(Vec::new()),
        })
    }

    /// Private cache of a single user agent.
    ///
    /// # Errors
    ///
    /// See [`CachePlugin::new`].
    pub fn client_cache(pool: Arc<dyn CacheItemPool>) -> Result<Self, HttpError> {
        Self::new(pool, CacheConfig::client_cache())
    }

    /// Shared cache.
    ///
    /// # Errors
    ///
    /// See [`CachePlugin::new`].
    pub fn server_cache(pool: Arc<dyn CacheItemPool>) -> Result<Self, HttpError> {
        Self::new(pool, CacheConfig::server_cache())
    }

    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    #[must_use]
    pub fn with_listener(mut self, listener: impl CacheListener + 'static) -> Self {
        let mut listeners = self.listeners.to_vec();
        listeners.push(Arc::new(listener));
        self.listeners = Arc::from(listeners);
        self
    }

    fn is_eligible(&self, request: &Request) -> bool {
        self.rules.methods.contains(request.method())
            && !self
                .rules
                .blacklist
                .iter()
                .any(|pattern| pattern.is_match(request.uri().path()))
    }

    fn cache_key(&self, request: &Request) -> String {
        let mut hasher = Sha256::new();
        hasher.update(request.method().as_str());
        hasher.update(b" ");
        hasher.update(request.uri().to_string());
        for name in &self.rules.key_headers {
            hasher.update(b"\n");
            hasher.update(name.as_str());
            hasher.update(b":");
            for value in request.headers().get_all(name) {
                hasher.update(value.as_bytes());
                hasher.update(b",");
            }
        }
        if request.method() != Method::GET && request.method() != Method::HEAD {
            hasher.update(b"\n\n");
            hasher.update(request.body());
        }
        hex::encode(hasher.finalize())
    }

    fn notify(&self, request: &Request, response: Response, from_cache: bool) -> Response {
        self.listeners
            .iter()
            .fold(response, |response, listener| {
                listener.on_cache_response(request, response, from_cache)
            })
    }

    fn expiry(&self, now: i64, max_age: Option<Duration>) -> (Option<i64>, Option<Duration>) {
        let expires_at = max_age.map(|age| now.saturating_add(i64::try_from(age.as_secs()).unwrap_or(i64::MAX)));
        let horizon = max_age.map(|age| age.saturating_add(self.rules.config.cache_lifetime));
        (expires_at, horizon)
    }

    fn save(&self, item: CacheItem) {
        let key = item.key().to_owned();
        if let Err(err) = self.pool.save(item) {
            tracing::warn!(key = %key, error = %err, "failed to store cache entry");
        }
    }

    fn on_response(&self, request: &Request, mut item: CacheItem, response: Response) -> Response {
        let now = self.clock.now();
        let unix_now = crate::clock::unix_seconds(now);

        if response.status() == StatusCode::NOT_MODIFIED
            && let Some(stored) = item.get().cloned()
        {
            let max_age = directives::max_age(&self.rules.config, response.headers(), now);
            let (expires_at, horizon) = self.expiry(unix_now, max_age);
            let replay = stored.to_response();
            tracing::debug!(key = %item.key(), expires_at = ?expires_at, "cache entry revalidated");
            item.set(CacheEntry { expires_at, ..stored });
            item.expires_after(horizon);
            self.save(item);
            return self.notify(request, replay, true);
        }

        if directives::is_cacheable(&self.rules.config, response.status().as_u16(), response.headers()) {
            let max_age = directives::max_age(&self.rules.config, response.headers(), now);
            let (expires_at, horizon) = self.expiry(unix_now, max_age);
            tracing::debug!(key = %item.key(), status = %response.status(), expires_at = ?expires_at, "storing response");
            item.set(CacheEntry::from_response(&response, unix_now, expires_at));
            item.expires_after(horizon);
            self.save(item);
        }
        self.notify(request, response, false)
    }
}

impl Plugin for CachePlugin {
    fn process(&self, mut request: Request, next: RequestHandler) -> Promise {
        if !self.is_eligible(&request) {
            return next.handle(request);
        }

        let key = self.cache_key(&request);
        let item = match self.pool.get_item(&key) {
            Ok(item) => item,
            Err(err) => {
                tracing::warn!(key = %key, error = %err, "cache lookup failed, bypassing cache");
                return next.handle(request);
            }
        };

        if let Some(entry) = item.get() {
            if entry.is_fresh(self.clock.unix_now()) {
                tracing::debug!(key = %key, uri = %request.uri(), "serving fresh cache entry");
                let response = entry.to_response();
                return Promise::fulfilled(self.notify(&request, response, true));
            }

            let headers = request.headers_mut();
            if let Ok(value) = HeaderValue::from_str(&httpdate::fmt_http_date(from_unix_seconds(entry.created_at))) {
                headers.insert(IF_MODIFIED_SINCE, value);
            }
            if !entry.etags.is_empty()
                && let Ok(value) = HeaderValue::from_str(&entry.etags.join(", "))
            {
                headers.insert(IF_NONE_MATCH, value);
            }
            tracing::debug!(key = %key, uri = %request.uri(), "revalidating stale cache entry");
        }

        let this = self.clone();
        let original = clone_request(&request);
        next.handle(request)
            .map(move |response| this.on_response(&original, item, response))
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;
    use crate::client::{HttpClient, PluginClient};
    use crate::clock::ManualClock;
    use crate::testing::{MockClient, get, post, response, response_with};

    const T0: u64 = 1_700_000_000;

    struct Fixture {
        clock: ManualClock,
        pool: Arc<InMemoryCachePool>,
    }

    impl Fixture {
        fn new() -> Self {
            let clock = ManualClock::at_unix(T0);
            let pool = Arc::new(InMemoryCachePool::with_clock(Arc::new(clock.clone())));
            Self { clock, pool }
        }

        fn plugin(&self, config: CacheConfig) -> CachePlugin {
            CachePlugin::new(self.pool.clone(), config)
                .unwrap()
                .with_clock(Arc::new(self.clock.clone()))
        }

        fn client(&self, config: CacheConfig, transport: Arc<MockClient>) -> PluginClient {
            PluginClient::builder().plugin(self.plugin(config)).build(transport)
        }
    }

    fn cacheable(body: &'static [u8]) -> Response {
        response_with(200, &[("cache-control", "max-age=60"), ("etag", "\"v1\"")], body)
    }

    #[tokio::test]
    async fn test_fresh_entry_served_then_revalidated() {
        let fixture = Fixture::new();
        let transport = MockClient::new(|_, call| match call {
            0 => Ok(cacheable(b"original body")),
            _ => Ok(response_with(304, &[("cache-control", "max-age=60")], b"")),
        });
        let client = fixture.client(CacheConfig::client_cache(), transport.clone());

        let first = client.send_async_request(get("http://c.test/doc")).await.unwrap();
        assert_eq!(first.body().as_ref(), b"original body");

        fixture.clock.advance(Duration::from_secs(30));
        let cached = client.send_async_request(get("http://c.test/doc")).await.unwrap();
        assert_eq!(cached.body().as_ref(), b"original body");
        assert_eq!(transport.calls(), 1);

        fixture.clock.advance(Duration::from_secs(60));
        let revalidated = client.send_async_request(get("http://c.test/doc")).await.unwrap();
        assert_eq!(transport.calls(), 2);

        let conditional = transport.request(1);
        assert_eq!(conditional.headers()[IF_NONE_MATCH], "\"v1\"");
        assert_eq!(
            conditional.headers()[IF_MODIFIED_SINCE],
            httpdate::fmt_http_date(from_unix_seconds(i64::try_from(T0).unwrap())).as_str()
        );
        assert_eq!(revalidated.status(), 200);
        assert_eq!(revalidated.body(), first.body());
    }

    #[tokio::test]
    async fn test_not_modified_refreshes_expiry() {
        let fixture = Fixture::new();
        let transport = MockClient::new(|_, call| match call {
            0 => Ok(cacheable(b"v1")),
            _ => Ok(response_with(304, &[("cache-control", "max-age=120")], b"")),
        });
        let client = fixture.client(CacheConfig::default(), transport.clone());

        client.send_async_request(get("http://c.test/")).await.unwrap();
        fixture.clock.advance(Duration::from_secs(90));
        client.send_async_request(get("http://c.test/")).await.unwrap();
        assert_eq!(transport.calls(), 2);

        fixture.clock.advance(Duration::from_secs(100));
        let response = client.send_async_request(get("http://c.test/")).await.unwrap();
        assert_eq!(response.body().as_ref(), b"v1");
        assert_eq!(transport.calls(), 2);
    }

    #[tokio::test]
    async fn test_not_modified_without_entry_passes_through() {
        let fixture = Fixture::new();
        let client = fixture.client(CacheConfig::default(), MockClient::status(304));

        let response = client.send_async_request(get("http://c.test/")).await.unwrap();
        assert_eq!(response.status(), 304);
    }

    #[tokio::test]
    async fn test_uncacheable_responses_are_not_stored() {
        let fixture = Fixture::new();
        let transport = MockClient::new(|request, _| {
            Ok(match request.uri().path() {
                "/no-store" => response_with(200, &[("cache-control", "no-store, max-age=60")], b""),
                "/private" => response_with(200, &[("cache-control", "private, max-age=60")], b""),
                _ => response_with(500, &[("cache-control", "max-age=60")], b""),
            })
        });
        let client = fixture.client(CacheConfig::server_cache(), transport.clone());

        for path in ["/no-store", "/private", "/error"] {
            let uri = format!("http://c.test{path}");
            client.send_async_request(get(&uri)).await.unwrap();
            client.send_async_request(get(&uri)).await.unwrap();
        }

        assert_eq!(transport.calls(), 6);
        assert!(fixture.pool.is_empty());
    }

    #[tokio::test]
    async fn test_methods_and_blacklist_bypass_cache() {
        let fixture = Fixture::new();
        let transport = MockClient::new(|_, _| Ok(cacheable(b"x")));
        let config = CacheConfig {
            blacklisted_paths: vec!["^/admin".to_owned()],
            ..CacheConfig::default()
        };
        let client = fixture.client(config, transport.clone());

        client.send_async_request(post("http://c.test/p", b"a")).await.unwrap();
        client.send_async_request(post("http://c.test/p", b"a")).await.unwrap();
        client.send_async_request(get("http://c.test/admin/x")).await.unwrap();
        client.send_async_request(get("http://c.test/admin/x")).await.unwrap();

        assert_eq!(transport.calls(), 4);
        assert!(fixture.pool.is_empty());
    }

    #[tokio::test]
    async fn test_key_varies_by_configured_headers() {
        let fixture = Fixture::new();
        let transport = MockClient::new(|_, _| Ok(cacheable(b"x")));
        let config = CacheConfig {
            cache_key_headers: vec!["accept-language".to_owned()],
            ..CacheConfig::default()
        };
        let client = fixture.client(config, transport.clone());

        let localized = |lang: &str| {
            let mut request = get("http://c.test/");
            request
                .headers_mut()
                .insert("accept-language", HeaderValue::from_str(lang).unwrap());
            request
        };

        client.send_async_request(localized("en")).await.unwrap();
        client.send_async_request(localized("fr")).await.unwrap();
        client.send_async_request(localized("en")).await.unwrap();

        assert_eq!(transport.calls(), 2);
        assert_eq!(fixture.pool.len(), 2);
    }

    #[tokio::test]
    async fn test_listener_marks_hits_and_misses() {
        let fixture = Fixture::new();
        let transport = MockClient::new(|_, _| Ok(cacheable(b"x")));
        let client = PluginClient::builder()
            .plugin(
                fixture
                    .plugin(CacheConfig::default())
                    .with_listener(AddHeaderCacheListener::default()),
            )
            .build(transport);

        let miss = client.send_async_request(get("http://c.test/")).await.unwrap();
        let hit = client.send_async_request(get("http://c.test/")).await.unwrap();

        assert_eq!(miss.headers()["x-cache"], "MISS");
        assert_eq!(hit.headers()["x-cache"], "HIT");
    }

    #[tokio::test]
    async fn test_zero_default_ttl_always_revalidates() {
        let fixture = Fixture::new();
        let transport = MockClient::new(|_, call| {
            Ok(if call == 0 {
                response_with(200, &[("etag", "\"a\"")], b"body")
            } else {
                response(304)
            })
        });
        let client = fixture.client(CacheConfig::default(), transport.clone());

        client.send_async_request(get("http://c.test/")).await.unwrap();
        let second = client.send_async_request(get("http://c.test/")).await.unwrap();

        assert_eq!(transport.calls(), 2);
        assert_eq!(second.body().as_ref(), b"body");
    }

    struct BrokenPool;

    impl CacheItemPool for BrokenPool {
        fn get_item(&self, _key: &str) -> Result<CacheItem, CacheStoreError> {
            Err(CacheStoreError::new("backend down"))
        }

        fn save(&self, _item: CacheItem) -> Result<(), CacheStoreError> {
            Err(CacheStoreError::new("backend down"))
        }
    }

    #[tokio::test]
    async fn test_unbounded_max_age_is_stored_without_overflow() {
        for max_age in ["max-age=18446744073709551615", "max-age=10000000000000000000"] {
            let fixture = Fixture::new();
            let transport = MockClient::new(move |_, _| {
                Ok(response_with(200, &[("cache-control", max_age)], b"forever"))
            });
            let client = fixture.client(CacheConfig::client_cache(), transport.clone());

            let first = client.send_async_request(get("http://c.test/big")).await.unwrap();
            assert_eq!(first.body().as_ref(), b"forever");

            fixture.clock.advance(Duration::from_secs(100 * 365 * 24 * 3600));
            let cached = client.send_async_request(get("http://c.test/big")).await.unwrap();
            assert_eq!(cached.body().as_ref(), b"forever");
            assert_eq!(transport.calls(), 1, "{max_age}");
        }
    }

    #[tokio::test]
    async fn test_age_beyond_max_age_is_stale_immediately() {
        let fixture = Fixture::new();
        let transport = MockClient::new(|_, _| {
            Ok(response_with(
                200,
                &[("cache-control", "max-age=60"), ("age", "18446744073709551615")],
                b"old",
            ))
        });
        let client = fixture.client(CacheConfig::client_cache(), transport.clone());

        client.send_async_request(get("http://c.test/aged")).await.unwrap();
        client.send_async_request(get("http://c.test/aged")).await.unwrap();

        assert_eq!(transport.calls(), 2);
        assert!(transport.request(1).headers().contains_key(IF_MODIFIED_SINCE));
    }

    #[tokio::test]
    async fn test_store_errors_bypass_cache() {
        let transport = MockClient::new(|_, _| Ok(cacheable(b"x")));
        let client = PluginClient::builder()
            .plugin(CachePlugin::new(Arc::new(BrokenPool), CacheConfig::default()).unwrap())
            .build(transport.clone());

        let response = client.send_async_request(get("http://c.test/")).await.unwrap();
        assert_eq!(response.status(), 200);
        client.send_async_request(get("http://c.test/")).await.unwrap();
        assert_eq!(transport.calls(), 2);
    }

    #[tokio::test]
    async fn test_store_errors_are_logged() {
        use std::sync::Mutex;
        use tracing_subscriber::layer::SubscriberExt;

        #[derive(Clone, Default)]
        struct WarningCapture {
            warnings: Arc<Mutex<Vec<String>>>,
        }

        impl<S: tracing::Subscriber> tracing_subscriber::Layer<S> for WarningCapture {
            fn on_event(&self, event: &tracing::Event<'_>, _ctx: tracing_subscriber::layer::Context<'_, S>) {
                if *event.metadata().level() == tracing::Level::WARN {
                    let mut visitor = MessageVisitor(String::new());
                    event.record(&mut visitor);
                    self.warnings.lock().unwrap().push(visitor.0);
                }
            }
        }

        struct MessageVisitor(String);
        impl tracing::field::Visit for MessageVisitor {
            fn record_debug(&mut self, field: &tracing::field::Field, value: &dyn std::fmt::Debug) {
                if field.name() == "message" {
                    self.0 = format!("{value:?}");
                }
            }
        }

        let capture = WarningCapture::default();
        let warnings = capture.warnings.clone();
        let _guard = tracing::subscriber::set_default(tracing_subscriber::registry().with(capture));

        let client = PluginClient::builder()
            .plugin(CachePlugin::new(Arc::new(BrokenPool), CacheConfig::default()).unwrap())
            .build(MockClient::new(|_, _| Ok(cacheable(b"x"))));
        client.send_async_request(get("http://c.test/")).await.unwrap();

        let captured = warnings.lock().unwrap();
        assert!(
            captured.iter().any(|w| w.contains("bypassing cache")),
            "expected a bypass warning, got: {:?}",
            *captured
        );
    }

    #[test]
    fn test_invalid_configuration_is_rejected() {
        let pool: Arc<dyn CacheItemPool> = Arc::new(InMemoryCachePool::new());
        let bad_regex = CacheConfig {
            blacklisted_paths: vec!["(".to_owned()],
            ..CacheConfig::default()
        };
        assert!(matches!(
            CachePlugin::new(pool.clone(), bad_regex),
            Err(HttpError::Configuration(_))
        ));

        let bad_method = CacheConfig {
            methods: vec!["GE T".to_owned()],
            ..CacheConfig::default()
        };
        assert!(CachePlugin::new(pool, bad_method).is_err());
    }
}
