//! Cookie persistence across requests.

use crate::chain::{Plugin, RequestHandler};
use crate::clock::{Clock, SystemClock, unix_seconds};
use crate::message::Request;
use crate::promise::Promise;
use http::header::{COOKIE, SET_COOKIE};
use http::{HeaderValue, Uri};
use parking_lot::Mutex;
use std::sync::Arc;

/// A cookie received through `Set-Cookie`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cookie {
    pub name: String,
    pub value: String,
    /// Lowercase domain without a leading dot.
    pub domain: String,
    /// Only sent to exactly `domain` when no `Domain` attribute was given.
    pub host_only: bool,
    pub path: String,
    /// Unix seconds; `None` for session cookies.
    pub expires: Option<i64>,
    pub secure: bool,
    pub http_only: bool,
}

impl Cookie {
    /// Parse a `Set-Cookie` value received for `uri`.
    ///
    /// Returns `None` for malformed cookies and for cookies whose `Domain`
    /// does not cover the request host.
    #[must_use]
    pub fn parse(header: &str, uri: &Uri, now: i64) -> Option<Self> {
        let host = uri.host()?.to_ascii_lowercase();
        let mut parts = header.split(';');
        let (name, value) = parts.next()?.split_once('=')?;
        let name = name.trim();
        if name.is_empty() {
            return None;
        }

        let mut cookie = Self {
            name: name.to_owned(),
            value: value.trim().trim_matches('"').to_owned(),
            domain: host.clone(),
            host_only: true,
            path: default_path(uri.path()),
            expires: None,
            secure: false,
            http_only: false,
        };

        let mut max_age = None;
        for attribute in parts {
            let (key, argument) = match attribute.split_once('=') {
                Some((key, argument)) => (key.trim(), argument.trim()),
                None => (attribute.trim(), ""),
            };
            match key.to_ascii_lowercase().as_str() {
                "domain" if !argument.is_empty() => {
                    let domain = argument.trim_start_matches('.').to_ascii_lowercase();
                    if !domain_matches(&host, &domain) {
                        return None;
                    }
                    cookie.domain = domain;
                    cookie.host_only = false;
                }
                "path" if argument.starts_with('/') => cookie.path = argument.to_owned(),
                "max-age" => {
                    if let Ok(seconds) = argument.parse::<i64>() {
                        max_age = Some(if seconds <= 0 { i64::MIN } else { now.saturating_add(seconds) });
                    }
                }
                "expires" => {
                    if let Ok(time) = httpdate::parse_http_date(argument) {
                        cookie.expires = Some(unix_seconds(time));
                    }
                }
                "secure" => cookie.secure = true,
                "httponly" => cookie.http_only = true,
                _ => {}
            }
        }
        if max_age.is_some() {
            cookie.expires = max_age;
        }
        Some(cookie)
    }

    #[must_use]
    pub fn is_expired(&self, now: i64) -> bool {
        self.expires.is_some_and(|expires| expires <= now)
    }

    /// Whether the cookie should be sent with a request to `uri`.
    #[must_use]
    pub fn matches(&self, uri: &Uri, now: i64) -> bool {
        let Some(host) = uri.host().map(str::to_ascii_lowercase) else {
            return false;
        };
        let domain_ok = if self.host_only {
            host == self.domain
        } else {
            domain_matches(&host, &self.domain)
        };
        domain_ok
            && path_matches(uri.path(), &self.path)
            && (!self.secure || uri.scheme_str() == Some("https"))
            && !self.is_expired(now)
    }

    fn same_identity(&self, other: &Self) -> bool {
        self.name == other.name && self.domain == other.domain && self.path == other.path
    }
}

fn domain_matches(host: &str, domain: &str) -> bool {
    host == domain
        || (host.len() > domain.len()
            && host.ends_with(domain)
            && host.as_bytes()[host.len() - domain.len() - 1] == b'.')
}

fn path_matches(request_path: &str, cookie_path: &str) -> bool {
    let request_path = if request_path.is_empty() { "/" } else { request_path };
    request_path == cookie_path
        || (request_path.starts_with(cookie_path)
            && (cookie_path.ends_with('/') || request_path.as_bytes().get(cookie_path.len()) == Some(&b'/')))
}

fn default_path(path: &str) -> String {
    match path.rfind('/') {
        Some(0) | None => "/".to_owned(),
        Some(index) => path[..index].to_owned(),
    }
}

/// Cookie storage shared by [`CookiePlugin`] instances.
#[derive(Debug)]
pub struct CookieJar {
    clock: Arc<dyn Clock>,
    cookies: Mutex<Vec<Cookie>>,
}

impl CookieJar {
    #[must_use]
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    #[must_use]
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            cookies: Mutex::new(Vec::new()),
        }
    }

    /// Store `cookie`, replacing one with the same name, domain and path.
    /// An already expired cookie deletes its stored counterpart.
    pub fn add(&self, cookie: Cookie) {
        let now = self.clock.unix_now();
        let mut cookies = self.cookies.lock();
        cookies.retain(|stored| !stored.same_identity(&cookie));
        if !cookie.is_expired(now) {
            cookies.push(cookie);
        }
    }

    /// Cookies to send to `uri`, longest path first.
    #[must_use]
    pub fn cookies_for(&self, uri: &Uri) -> Vec<Cookie> {
        let now = self.clock.unix_now();
        let mut cookies = self.cookies.lock();
        cookies.retain(|cookie| !cookie.is_expired(now));
        let mut matching: Vec<Cookie> = cookies.iter().filter(|c| c.matches(uri, now)).cloned().collect();
        matching.sort_by(|a, b| b.path.len().cmp(&a.path.len()));
        matching
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.cookies.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.cookies.lock().is_empty()
    }

    pub fn clear(&self) {
        self.cookies.lock().clear();
    }

    fn now(&self) -> i64 {
        self.clock.unix_now()
    }
}

impl Default for CookieJar {
    fn default() -> Self {
        Self::new()
    }
}

/// Sends stored cookies and records `Set-Cookie` responses.
#[derive(Debug, Clone)]
pub struct CookiePlugin {
    jar: Arc<CookieJar>,
}

impl CookiePlugin {
    #[must_use]
    pub fn new(jar: Arc<CookieJar>) -> Self {
        Self { jar }
    }

    #[must_use]
    pub fn jar(&self) -> &Arc<CookieJar> {
        &self.jar
    }
}

impl Plugin for CookiePlugin {
    fn process(&self, mut request: Request, next: RequestHandler) -> Promise {
        let cookies = self.jar.cookies_for(request.uri());
        if !cookies.is_empty() {
            let mut line = cookies
                .iter()
                .map(|c| format!("{}={}", c.name, c.value))
                .collect::<Vec<_>>()
                .join("; ");
            if let Some(existing) = request.headers().get(COOKIE).and_then(|v| v.to_str().ok()) {
                line = format!("{existing}; {line}");
            }
            match HeaderValue::from_str(&line) {
                Ok(value) => {
                    request.headers_mut().insert(COOKIE, value);
                }
                Err(err) => tracing::warn!(error = %err, "skipping unencodable cookies"),
            }
        }

        let jar = Arc::clone(&self.jar);
        let uri = request.uri().clone();
        next.handle(request).map(move |response| {
            let now = jar.now();
            for value in response.headers().get_all(SET_COOKIE) {
                let Ok(value) = value.to_str() else {
                    continue;
                };
                match Cookie::parse(value, &uri, now) {
                    Some(cookie) => jar.add(cookie),
                    None => tracing::debug!(uri = %uri, "ignoring invalid Set-Cookie"),
                }
            }
            response
        })
    }
}
