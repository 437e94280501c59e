use super::body::{LimitedBody, WireBody};
use super::tls;
use super::{PreparedRequest, TransportEngine, TransportErrorCode, TransportFailure};
use crate::config::{TlsRootConfig, TransportConfig, TransportOptions};
use crate::error::HttpError;
use crate::message::Response;
use futures::future::BoxFuture;
use http::Uri;
use http_body_util::BodyExt;
use hyper_rustls::builderstates::WantsSchemes;
use hyper_rustls::{HttpsConnector, HttpsConnectorBuilder};
use hyper_util::client::legacy::Client;
use hyper_util::client::legacy::connect::proxy::Tunnel;
use hyper_util::client::legacy::connect::{Connect, HttpConnector};
use hyper_util::rt::{TokioExecutor, TokioTimer};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::error::Error as StdError;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tower::ServiceExt;
use tower_http::follow_redirect::FollowRedirect;
use tower_http::follow_redirect::policy::{Action, Attempt, Policy};

type DirectClient = Client<HttpsConnector<HttpConnector>, WireBody>;
type TunneledClient = Client<HttpsConnector<Tunnel<HttpConnector>>, WireBody>;

/// One pooled hyper client per (verify, proxy) combination.
#[derive(Clone)]
enum Backend {
    Direct(DirectClient),
    Tunneled(TunneledClient),
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct BackendKey {
    verify: bool,
    proxy: Option<String>,
}

impl From<&TransportOptions> for BackendKey {
    fn from(options: &TransportOptions) -> Self {
        Self {
            verify: options.verify,
            proxy: options.proxy.clone(),
        }
    }
}

/// Redirect budget for transport-level redirect following.
///
/// Sets `exhausted` when a redirect had to be refused, so the engine can
/// report [`TransportErrorCode::TooManyRedirects`] instead of handing back
/// the 3xx response.
#[derive(Clone)]
struct RedirectBudget {
    remaining: usize,
    exhausted: Arc<AtomicBool>,
}

impl<E> Policy<WireBody, E> for RedirectBudget {
    fn redirect(&mut self, attempt: &Attempt<'_>) -> Result<Action, E> {
        if self.remaining == 0 {
            tracing::debug!(location = %attempt.location(), "transport redirect budget exhausted");
            self.exhausted.store(true, Ordering::Release);
            return Ok(Action::Stop);
        }
        self.remaining -= 1;
        Ok(Action::Follow)
    }

    fn clone_body(&self, body: &WireBody) -> Option<WireBody> {
        Some(body.clone())
    }
}

/// [`TransportEngine`] backed by hyper-util's pooled client over rustls.
///
/// Connection pools are kept per TLS-verification/proxy combination and
/// reused for every request with the same options.
pub struct HyperEngine {
    config: Arc<TransportConfig>,
    backends: Mutex<HashMap<BackendKey, Backend>>,
}

impl HyperEngine {
    /// Build an engine; the default backend is created eagerly.
    ///
    /// # Errors
    ///
    /// Returns [`HttpError::Network`] with
    /// [`TransportErrorCode::SslConnectError`] when the TLS roots cannot be
    /// loaded, or a proxy error when the default proxy URI is invalid.
    pub fn new(config: TransportConfig) -> Result<Self, HttpError> {
        let engine = Self {
            config: Arc::new(config),
            backends: Mutex::new(HashMap::new()),
        };
        engine.backend(&engine.config.defaults)?;
        Ok(engine)
    }

    #[must_use]
    pub fn config(&self) -> &TransportConfig {
        &self.config
    }

    fn backend(&self, options: &TransportOptions) -> Result<Backend, TransportFailure> {
        let key = BackendKey::from(options);
        if let Some(backend) = self.backends.lock().get(&key) {
            return Ok(backend.clone());
        }

        let backend = self.build_backend(&key)?;
        self.backends.lock().insert(key, backend.clone());
        Ok(backend)
    }

    fn tls_builder(&self, verify: bool) -> Result<HttpsConnectorBuilder<WantsSchemes>, TransportFailure> {
        let ssl_failure = |message: String| TransportFailure::new(TransportErrorCode::SslConnectError, message);

        if !verify {
            let config = tls::unverified_client_config().map_err(ssl_failure)?;
            return Ok(HttpsConnectorBuilder::new().with_tls_config(config));
        }

        match self.config.tls_roots {
            TlsRootConfig::WebPki => HttpsConnectorBuilder::new()
                .with_provider_and_webpki_roots(tls::crypto_provider())
                .map_err(|e| {
                    TransportFailure::new(TransportErrorCode::SslConnectError, "failed to load webpki roots")
                        .with_source(e)
                }),
            TlsRootConfig::Native => {
                let config = tls::native_client_config().map_err(ssl_failure)?;
                Ok(HttpsConnectorBuilder::new().with_tls_config(config))
            }
        }
    }

    fn client_builder(&self) -> hyper_util::client::legacy::Builder {
        let mut builder = Client::builder(TokioExecutor::new());
        // pool_timer is required for pool_idle_timeout to take effect
        builder
            .pool_timer(TokioTimer::new())
            .pool_max_idle_per_host(self.config.pool_max_idle_per_host);
        if let Some(idle_timeout) = self.config.pool_idle_timeout {
            builder.pool_idle_timeout(idle_timeout);
        }
        builder
    }

    fn build_backend(&self, key: &BackendKey) -> Result<Backend, TransportFailure> {
        let tls = self.tls_builder(key.verify)?;

        let Some(proxy) = &key.proxy else {
            let connector = tls.https_or_http().enable_all_versions().build();
            return Ok(Backend::Direct(self.client_builder().build(connector)));
        };

        let proxy_uri: Uri = proxy.parse().map_err(|e| {
            TransportFailure::new(
                TransportErrorCode::CouldNotResolveProxy,
                format!("invalid proxy URI '{proxy}'"),
            )
            .with_source(e)
        })?;
        tracing::debug!(proxy = %proxy_uri, "creating tunneled transport backend");
        let tunnel = Tunnel::new(proxy_uri, HttpConnector::new());
        let connector = tls
            .https_or_http()
            .enable_all_versions()
            .wrap_connector(tunnel);
        Ok(Backend::Tunneled(self.client_builder().build(connector)))
    }
}

impl TransportEngine for HyperEngine {
    fn execute(&self, request: PreparedRequest) -> BoxFuture<'static, Result<Response, TransportFailure>> {
        let backend = match self.backend(&request.options) {
            Ok(backend) => backend,
            Err(failure) => return Box::pin(std::future::ready(Err(failure))),
        };
        let max_body_size = self.config.max_body_size;

        Box::pin(async move {
            let PreparedRequest {
                method,
                uri,
                version,
                headers,
                body,
                options,
            } = request;

            let mut outgoing = http::Request::new(body);
            *outgoing.method_mut() = method;
            *outgoing.uri_mut() = uri;
            *outgoing.version_mut() = version;
            *outgoing.headers_mut() = headers;

            let proxied = options.proxy.is_some();
            let exhausted = Arc::new(AtomicBool::new(false));
            let exchange = async {
                let response = match backend {
                    Backend::Direct(client) => send(client, outgoing, &options, &exhausted).await,
                    Backend::Tunneled(client) => send(client, outgoing, &options, &exhausted).await,
                }
                .map_err(|e| classify(e, proxied))?;

                if exhausted.load(Ordering::Acquire) && response.status().is_redirection() {
                    return Err(TransportFailure::new(
                        TransportErrorCode::TooManyRedirects,
                        format!("maximum ({}) redirects followed", options.max_redirects),
                    ));
                }

                let (parts, incoming) = response.into_parts();
                let body = LimitedBody::new(incoming, max_body_size)
                    .collect()
                    .await?
                    .to_bytes();
                Ok(http::Response::from_parts(parts, body))
            };

            match tokio::time::timeout(options.timeout, exchange).await {
                Ok(result) => result,
                Err(_) => Err(TransportFailure::new(
                    TransportErrorCode::OperationTimedOut,
                    format!("operation timed out after {:?}", options.timeout),
                )),
            }
        })
    }
}

async fn send<C>(
    client: Client<C, WireBody>,
    request: http::Request<WireBody>,
    options: &TransportOptions,
    exhausted: &Arc<AtomicBool>,
) -> Result<http::Response<hyper::body::Incoming>, hyper_util::client::legacy::Error>
where
    C: Connect + Clone + Send + Sync + 'static,
{
    if options.allow_redirects {
        let policy = RedirectBudget {
            remaining: options.max_redirects,
            exhausted: Arc::clone(exhausted),
        };
        FollowRedirect::with_policy(client, policy)
            .oneshot(request)
            .await
    } else {
        client.request(request).await
    }
}

/// Map a hyper-util error onto a transport code by walking its source chain.
fn classify(err: hyper_util::client::legacy::Error, proxied: bool) -> TransportFailure {
    let chain = || std::iter::successors(Some(&err as &(dyn StdError + 'static)), |&e| e.source());

    let tls_failure = chain().any(|e| e.is::<rustls::Error>());
    let io_kind = chain().find_map(|e| e.downcast_ref::<std::io::Error>().map(std::io::Error::kind));
    let dns_failure = chain().any(|e| {
        let text = e.to_string();
        text.contains("dns error") || text.contains("failed to lookup address")
    });

    let code = if err.is_connect() {
        if tls_failure {
            TransportErrorCode::SslConnectError
        } else if dns_failure {
            if proxied {
                TransportErrorCode::CouldNotResolveProxy
            } else {
                TransportErrorCode::CouldNotResolveHost
            }
        } else if io_kind == Some(std::io::ErrorKind::TimedOut) {
            TransportErrorCode::OperationTimedOut
        } else {
            TransportErrorCode::CouldNotConnect
        }
    } else if let Some(hyper_err) = chain().find_map(|e| e.downcast_ref::<hyper::Error>()) {
        if hyper_err.is_user() || hyper_err.is_body_write_aborted() {
            TransportErrorCode::SendError
        } else if hyper_err.is_timeout() {
            TransportErrorCode::OperationTimedOut
        } else {
            TransportErrorCode::ReceiveError
        }
    } else {
        TransportErrorCode::Other
    };

    tracing::debug!(code = %code, error = %err, "transport request failed");
    TransportFailure::new(code, err.to_string()).with_source(err)
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;
    use crate::transport::bind_request;
    use bytes::Bytes;
    use httpmock::MockServer;
    use std::time::Duration;

    fn engine(config: TransportConfig) -> HyperEngine {
        HyperEngine::new(config).unwrap()
    }

    fn get(url: &str) -> crate::message::Request {
        http::Request::get(url).body(Bytes::new()).unwrap()
    }

    async fn run(engine: &HyperEngine, request: crate::message::Request) -> Result<Response, TransportFailure> {
        let prepared = bind_request(request, engine.config()).unwrap();
        engine.execute(prepared).await
    }

    #[tokio::test]
    async fn test_engine_get_returns_status_headers_and_body() {
        let server = MockServer::start();
        let mock = server.mock(|when, then| {
            when.method(httpmock::Method::GET).path("/hello");
            then.status(201).header("x-reply", "yes").body("hi there");
        });

        let engine = engine(TransportConfig::for_testing());
        let response = run(&engine, get(&server.url("/hello"))).await.unwrap();

        assert_eq!(response.status(), 201);
        assert_eq!(response.headers()["x-reply"], "yes");
        assert_eq!(response.body().as_ref(), b"hi there");
        mock.assert_calls(1);
    }

    #[tokio::test]
    async fn test_engine_streams_large_body() {
        let payload = "x".repeat(100);
        let server = MockServer::start();
        let mock = server.mock(|when, then| {
            when.method(httpmock::Method::POST)
                .path("/upload")
                .header("content-length", "100")
                .body(payload.clone());
            then.status(204);
        });

        let engine = engine(TransportConfig::for_testing());
        let request = http::Request::post(server.url("/upload"))
            .body(Bytes::from(payload.clone()))
            .unwrap();
        let prepared = bind_request(request, engine.config()).unwrap();
        assert!(prepared.body.is_streamed());

        let response = engine.execute(prepared).await.unwrap();
        assert_eq!(response.status(), 204);
        mock.assert_calls(1);
    }

    #[tokio::test]
    async fn test_engine_timeout_maps_to_operation_timed_out() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.path("/slow");
            then.status(200).delay(Duration::from_millis(500));
        });

        let engine = engine(TransportConfig::for_testing());
        let mut request = get(&server.url("/slow"));
        request.extensions_mut().insert(TransportOptions {
            timeout: Duration::from_millis(50),
            ..TransportOptions::default()
        });

        let failure = run(&engine, request).await.unwrap_err();
        assert_eq!(failure.code, TransportErrorCode::OperationTimedOut);
        assert!(HttpError::from(failure).is_network());
    }

    #[tokio::test]
    async fn test_engine_refused_connection_maps_to_could_not_connect() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let engine = engine(TransportConfig::for_testing());
        let failure = run(&engine, get(&format!("http://127.0.0.1:{port}/")))
            .await
            .unwrap_err();

        assert_eq!(failure.code, TransportErrorCode::CouldNotConnect);
        assert!(failure.source.is_some());
    }

    #[tokio::test]
    async fn test_engine_body_limit() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.path("/big");
            then.status(200).body("0123456789");
        });

        let engine = engine(TransportConfig {
            max_body_size: 4,
            ..TransportConfig::for_testing()
        });
        let failure = run(&engine, get(&server.url("/big"))).await.unwrap_err();

        assert_eq!(failure.code, TransportErrorCode::ReceiveError);
    }

    #[tokio::test]
    async fn test_engine_returns_redirect_when_not_following() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.path("/from");
            then.status(302).header("location", "/to");
        });
        let target = server.mock(|when, then| {
            when.path("/to");
            then.status(200).body("landed");
        });

        let engine = engine(TransportConfig::for_testing());
        let response = run(&engine, get(&server.url("/from"))).await.unwrap();

        assert_eq!(response.status(), 302);
        target.assert_calls(0);
    }

    #[tokio::test]
    async fn test_engine_follows_redirects_within_budget() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.path("/from");
            then.status(302).header("location", "/to");
        });
        server.mock(|when, then| {
            when.path("/to");
            then.status(200).body("landed");
        });

        let engine = engine(TransportConfig::for_testing());
        let mut request = get(&server.url("/from"));
        request.extensions_mut().insert(TransportOptions {
            allow_redirects: true,
            max_redirects: 1,
            ..TransportOptions::default()
        });

        let response = run(&engine, request).await.unwrap();
        assert_eq!(response.body().as_ref(), b"landed");
    }

    #[tokio::test]
    async fn test_engine_redirect_budget_exhausted() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.path("/loop");
            then.status(301).header("location", "/loop");
        });

        let engine = engine(TransportConfig::for_testing());
        let mut request = get(&server.url("/loop"));
        request.extensions_mut().insert(TransportOptions {
            allow_redirects: true,
            max_redirects: 2,
            ..TransportOptions::default()
        });

        let failure = run(&engine, request).await.unwrap_err();
        assert_eq!(failure.code, TransportErrorCode::TooManyRedirects);
        assert!(!HttpError::from(failure).is_network());
    }

    #[tokio::test]
    async fn test_engine_invalid_proxy_uri() {
        let engine = engine(TransportConfig::for_testing());
        let mut request = get("http://example.invalid/");
        request.extensions_mut().insert(TransportOptions {
            proxy: Some("not a uri".to_owned()),
            ..TransportOptions::default()
        });

        let failure = run(&engine, request).await.unwrap_err();
        assert_eq!(failure.code, TransportErrorCode::CouldNotResolveProxy);
    }
}
