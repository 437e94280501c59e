//! Redirect following at the plugin level.
//!
//! | Status | Switch to GET | Multiple choices | Permanent |
//! |--------|---------------|------------------|-----------|
//! | 300    | yes           | yes              | no        |
//! | 301    | yes           | no               | yes       |
//! | 302    | yes           | no               | no        |
//! | 303    | yes           | no               | no        |
//! | 307    | no            | no               | no        |
//! | 308    | no            | no               | yes       |
//!
//! The method switch never applies to GET and HEAD. Permanent redirects are
//! remembered per original URI so later requests go straight to the target.

use crate::chain::{Plugin, RequestHandler};
use crate::config::{PreserveHeaders, RedirectConfig};
use crate::error::HttpError;
use crate::message::{Request, Response, clone_request};
use crate::promise::Promise;
use bytes::Bytes;
use http::header::{CONTENT_LENGTH, CONTENT_TYPE, HOST, HeaderName, LOCATION};
use http::{HeaderMap, Method, StatusCode, Uri};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

#[derive(Debug, Clone, Copy)]
struct RedirectRule {
    switch_to_get: bool,
    multiple: bool,
    permanent: bool,
}

fn rule_for(status: StatusCode) -> Option<RedirectRule> {
    let (switch_to_get, multiple, permanent) = match status.as_u16() {
        300 => (true, true, false),
        301 => (true, false, true),
        302 | 303 => (true, false, false),
        307 => (false, false, false),
        308 => (false, false, true),
        _ => return None,
    };
    Some(RedirectRule {
        switch_to_get,
        multiple,
        permanent,
    })
}

#[derive(Debug, Clone)]
struct RememberedRedirect {
    target: Uri,
    status: StatusCode,
}

/// URIs left by redirects during one dispatch.
#[derive(Debug, Clone, Default)]
struct VisitedUris(HashSet<String>);

struct RedirectInner {
    config: RedirectConfig,
    preserved: Vec<HeaderName>,
    memo: Mutex<HashMap<String, RememberedRedirect>>,
}

/// Follows 3xx responses by restarting the chain with the redirected request.
#[derive(Clone)]
pub struct RedirectPlugin {
    inner: Arc<RedirectInner>,
}

impl Default for RedirectPlugin {
    fn default() -> Self {
        Self::new(RedirectConfig::default())
    }
}

impl RedirectPlugin {
    #[must_use]
    pub fn new(config: RedirectConfig) -> Self {
        let preserved = match &config.preserve_header {
            PreserveHeaders::Named(names) => names
                .iter()
                .filter_map(|name| match HeaderName::from_bytes(name.as_bytes()) {
                    Ok(header) => Some(header),
                    Err(_) => {
                        tracing::warn!(header = %name, "ignoring invalid header name in redirect policy");
                        None
                    }
                })
                .collect(),
            PreserveHeaders::All | PreserveHeaders::None => Vec::new(),
        };
        Self {
            inner: Arc::new(RedirectInner {
                config,
                preserved,
                memo: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Number of remembered permanent redirects.
    #[must_use]
    pub fn remembered(&self) -> usize {
        self.inner.memo.lock().len()
    }

    fn on_response(&self, original: Request, response: Response, next: &RequestHandler) -> Promise {
        let status = response.status();
        let Some(rule) = rule_for(status) else {
            return Promise::fulfilled(response);
        };

        let location = response
            .headers()
            .get(LOCATION)
            .and_then(|v| v.to_str().ok())
            .map(str::to_owned);

        if rule.multiple && (!self.inner.config.use_default_for_multiple || location.is_none()) {
            return Promise::rejected(HttpError::MultipleRedirection { status });
        }
        let Some(location) = location else {
            return Promise::rejected(HttpError::InvalidRedirect {
                reason: format!("{status} response without a usable Location header"),
            });
        };

        let target = match resolve_location(original.uri(), &location) {
            Ok(target) => target,
            Err(err) => return Promise::rejected(err),
        };

        let origin = original.uri().to_string();
        let destination = target.to_string();
        let circular = next.with_state(|visited: &mut VisitedUris| {
            visited.0.insert(origin.clone());
            visited.0.contains(&destination)
        });
        if circular {
            tracing::warn!(from = %origin, to = %destination, "circular redirect detected");
            return Promise::rejected(HttpError::CircularRedirection { uri: destination });
        }

        if rule.permanent {
            self.inner.memo.lock().insert(
                origin.clone(),
                RememberedRedirect {
                    target: target.clone(),
                    status,
                },
            );
        }

        tracing::debug!(from = %origin, to = %destination, status = status.as_u16(), "following redirect");
        next.restart(self.redirect_request(original, target, status))
    }

    fn redirect_request(&self, request: Request, target: Uri, status: StatusCode) -> Request {
        let (mut parts, body) = request.into_parts();

        let strict_keep = self.inner.config.strict && matches!(status.as_u16(), 300..=302);
        let switch = rule_for(status).is_some_and(|r| r.switch_to_get)
            && !strict_keep
            && parts.method != Method::GET
            && parts.method != Method::HEAD;
        let body = if switch {
            parts.method = Method::GET;
            parts.headers.remove(CONTENT_LENGTH);
            parts.headers.remove(CONTENT_TYPE);
            Bytes::new()
        } else {
            body
        };

        parts.headers = match &self.inner.config.preserve_header {
            PreserveHeaders::All => parts.headers,
            PreserveHeaders::None => HeaderMap::new(),
            PreserveHeaders::Named(_) => {
                let mut kept = HeaderMap::new();
                for name in &self.inner.preserved {
                    for value in parts.headers.get_all(name) {
                        kept.append(name.clone(), value.clone());
                    }
                }
                kept
            }
        };
        if parts.uri.authority() != target.authority() {
            parts.headers.remove(HOST);
        }

        parts.uri = target;
        Request::from_parts(parts, body)
    }
}

impl Plugin for RedirectPlugin {
    fn process(&self, request: Request, next: RequestHandler) -> Promise {
        let key = request.uri().to_string();
        let remembered = self.inner.memo.lock().get(&key).cloned();
        if let Some(RememberedRedirect { target, status }) = remembered {
            let destination = target.to_string();
            let circular = next.with_state(|visited: &mut VisitedUris| {
                visited.0.insert(key.clone());
                visited.0.contains(&destination)
            });
            if circular {
                tracing::warn!(from = %key, to = %destination, "circular redirect detected");
                return Promise::rejected(HttpError::CircularRedirection { uri: destination });
            }
            tracing::debug!(from = %key, to = %destination, "using remembered permanent redirect");
            return next.restart(self.redirect_request(request, target, status));
        }

        let original = clone_request(&request);
        let this = self.clone();
        let handler = next.clone();
        next.handle(request)
            .and_then(move |response| this.on_response(original, response, &handler))
    }
}

fn invalid(location: &str, reason: impl std::fmt::Display) -> HttpError {
    HttpError::InvalidRedirect {
        reason: format!("cannot resolve Location '{location}': {reason}"),
    }
}

fn has_scheme(reference: &str) -> bool {
    reference.split_once(':').is_some_and(|(scheme, _)| {
        scheme.starts_with(|c: char| c.is_ascii_alphabetic())
            && scheme
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '-' | '.'))
    })
}

/// Resolve a `Location` value against the URI that produced it.
///
/// Components present in `location` replace the original ones. An absent
/// path keeps the original path, an absent query clears it. Relative paths
/// resolve against the original directory. Fragments are dropped.
fn resolve_location(base: &Uri, location: &str) -> Result<Uri, HttpError> {
    let location = location.split('#').next().unwrap_or_default().trim();
    if location.is_empty() {
        return Err(invalid(location, "empty reference"));
    }

    let (scheme, rest) = if has_scheme(location) {
        let (scheme, rest) = location.split_once(':').unwrap_or_default();
        (scheme.to_ascii_lowercase(), rest)
    } else {
        (base.scheme_str().unwrap_or("http").to_owned(), location)
    };

    let (authority, reference) = match rest.strip_prefix("//") {
        Some(after) => {
            let end = after.find(['/', '?']).unwrap_or(after.len());
            (after[..end].to_owned(), &after[end..])
        }
        None if has_scheme(location) => return Err(invalid(location, "missing authority")),
        None => match base.authority() {
            Some(authority) => (authority.to_string(), rest),
            None => return Err(invalid(location, "original request has no authority")),
        },
    };

    let (path, query) = match reference.split_once('?') {
        Some((path, query)) => (path, Some(query)),
        None => (reference, None),
    };

    let path = if path.is_empty() {
        base.path().to_owned()
    } else if path.starts_with('/') {
        remove_dot_segments(path)
    } else {
        let directory = base.path().rfind('/').map_or("/", |i| &base.path()[..=i]);
        remove_dot_segments(&format!("{directory}{path}"))
    };

    let path_and_query = match query {
        Some(query) => format!("{path}?{query}"),
        None => path,
    };

    Uri::builder()
        .scheme(scheme.as_str())
        .authority(authority.as_str())
        .path_and_query(path_and_query)
        .build()
        .map_err(|e| invalid(location, e))
}

fn remove_dot_segments(path: &str) -> String {
    let mut output: Vec<&str> = Vec::new();
    let segments: Vec<&str> = path.split('/').skip(1).collect();
    let last = segments.len().saturating_sub(1);
    for (i, segment) in segments.iter().enumerate() {
        match *segment {
            "." => {
                if i == last {
                    output.push("");
                }
            }
            ".." => {
                output.pop();
                if i == last {
                    output.push("");
                }
            }
            other => output.push(other),
        }
    }
    format!("/{}", output.join("/"))
}
