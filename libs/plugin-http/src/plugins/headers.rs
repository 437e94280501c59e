//! Request header plugins.

use crate::chain::{Plugin, RequestHandler};
use crate::config::DEFAULT_USER_AGENT;
use crate::error::HttpError;
use crate::message::Request;
use crate::promise::Promise;
use http::header::{HeaderMap, HeaderName, HeaderValue, USER_AGENT};

fn header_map(pairs: &[(&str, &str)]) -> Result<HeaderMap, HttpError> {
    let mut map = HeaderMap::with_capacity(pairs.len());
    for (name, value) in pairs {
        map.append(HeaderName::from_bytes(name.as_bytes())?, HeaderValue::from_str(value)?);
    }
    Ok(map)
}

/// Sets headers, replacing any value already on the request.
#[derive(Debug, Clone)]
pub struct HeaderSetPlugin {
    headers: HeaderMap,
}

impl HeaderSetPlugin {
    #[must_use]
    pub fn new(headers: HeaderMap) -> Self {
        Self { headers }
    }

    /// # Errors
    /// Returns an error if a name or value is not a valid header.
    pub fn try_new(pairs: &[(&str, &str)]) -> Result<Self, HttpError> {
        header_map(pairs).map(Self::new)
    }
}

impl Plugin for HeaderSetPlugin {
    fn process(&self, mut request: Request, next: RequestHandler) -> Promise {
        for name in self.headers.keys() {
            request.headers_mut().remove(name);
        }
        for (name, value) in &self.headers {
            request.headers_mut().append(name.clone(), value.clone());
        }
        next.handle(request)
    }
}

/// Sets headers only when the request does not carry them yet.
#[derive(Debug, Clone)]
pub struct HeaderDefaultsPlugin {
    headers: HeaderMap,
}

impl HeaderDefaultsPlugin {
    #[must_use]
    pub fn new(headers: HeaderMap) -> Self {
        Self { headers }
    }

    /// # Errors
    /// Returns an error if a name or value is not a valid header.
    pub fn try_new(pairs: &[(&str, &str)]) -> Result<Self, HttpError> {
        header_map(pairs).map(Self::new)
    }
}

impl Plugin for HeaderDefaultsPlugin {
    fn process(&self, mut request: Request, next: RequestHandler) -> Promise {
        for name in self.headers.keys() {
            if !request.headers().contains_key(name) {
                for value in self.headers.get_all(name) {
                    request.headers_mut().append(name.clone(), value.clone());
                }
            }
        }
        next.handle(request)
    }
}

/// Appends header values next to existing ones.
#[derive(Debug, Clone)]
pub struct HeaderAppendPlugin {
    headers: HeaderMap,
}

impl HeaderAppendPlugin {
    #[must_use]
    pub fn new(headers: HeaderMap) -> Self {
        Self { headers }
    }

    /// # Errors
    /// Returns an error if a name or value is not a valid header.
    pub fn try_new(pairs: &[(&str, &str)]) -> Result<Self, HttpError> {
        header_map(pairs).map(Self::new)
    }
}

impl Plugin for HeaderAppendPlugin {
    fn process(&self, mut request: Request, next: RequestHandler) -> Promise {
        for (name, value) in &self.headers {
            request.headers_mut().append(name.clone(), value.clone());
        }
        next.handle(request)
    }
}

/// Strips headers from the request.
#[derive(Debug, Clone)]
pub struct HeaderRemovePlugin {
    names: Vec<HeaderName>,
}

impl HeaderRemovePlugin {
    #[must_use]
    pub fn new(names: Vec<HeaderName>) -> Self {
        Self { names }
    }

    /// # Errors
    /// Returns an error if a name is not a valid header name.
    pub fn try_new(names: &[&str]) -> Result<Self, HttpError> {
        let names = names
            .iter()
            .map(|n| HeaderName::from_bytes(n.as_bytes()))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self::new(names))
    }
}

impl Plugin for HeaderRemovePlugin {
    fn process(&self, mut request: Request, next: RequestHandler) -> Promise {
        for name in &self.names {
            request.headers_mut().remove(name);
        }
        next.handle(request)
    }
}

/// Adds a `User-Agent` header to requests that have none.
#[derive(Debug, Clone)]
pub struct UserAgentPlugin {
    user_agent: HeaderValue,
}

impl UserAgentPlugin {
    /// Create a new `UserAgentPlugin` with the specified user agent string
    ///
    /// # Errors
    /// Returns `HttpError::InvalidHeaderValue` if the user agent string is not valid
    pub fn try_new(user_agent: impl AsRef<str>) -> Result<Self, HttpError> {
        let user_agent = HeaderValue::from_str(user_agent.as_ref()).map_err(HttpError::InvalidHeaderValue)?;
        Ok(Self { user_agent })
    }
}

impl Default for UserAgentPlugin {
    fn default() -> Self {
        Self {
            user_agent: HeaderValue::from_static(DEFAULT_USER_AGENT),
        }
    }
}

impl Plugin for UserAgentPlugin {
    fn process(&self, mut request: Request, next: RequestHandler) -> Promise {
        if !request.headers().contains_key(USER_AGENT) {
            request.headers_mut().insert(USER_AGENT, self.user_agent.clone());
        }
        next.handle(request)
    }
}
