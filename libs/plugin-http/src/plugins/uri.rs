//! Plugins completing relative request URIs.

use crate::chain::{Plugin, RequestHandler};
use crate::error::{HttpError, InvalidUriKind};
use crate::message::{Request, with_uri};
use crate::promise::Promise;
use http::Uri;
use http::uri::{Authority, PathAndQuery, Scheme};
use std::collections::HashSet;

fn invalid(url: &str, kind: InvalidUriKind, reason: impl Into<String>) -> HttpError {
    HttpError::InvalidUri {
        url: url.to_owned(),
        kind,
        reason: reason.into(),
    }
}

fn parse(url: &str) -> Result<Uri, HttpError> {
    url.parse::<Uri>()
        .map_err(|e| invalid(url, InvalidUriKind::ParseError, e.to_string()))
}

/// Fills in scheme and authority.
#[derive(Debug, Clone)]
pub struct AddHostPlugin {
    scheme: Scheme,
    authority: Authority,
    replace: bool,
}

impl AddHostPlugin {
    /// # Errors
    /// Returns [`HttpError::InvalidUri`] unless `host` has a scheme and an
    /// authority.
    pub fn new(host: &str) -> Result<Self, HttpError> {
        let uri = parse(host)?;
        let scheme = uri
            .scheme()
            .cloned()
            .ok_or_else(|| invalid(host, InvalidUriKind::MissingScheme, "host needs a scheme"))?;
        let authority = uri
            .authority()
            .cloned()
            .ok_or_else(|| invalid(host, InvalidUriKind::MissingAuthority, "host needs an authority"))?;
        Ok(Self {
            scheme,
            authority,
            replace: false,
        })
    }

    /// Also override requests that already name a host.
    #[must_use]
    pub fn replace(mut self, replace: bool) -> Self {
        self.replace = replace;
        self
    }

    fn apply(&self, uri: &Uri) -> Result<Uri, HttpError> {
        if uri.authority().is_some() && !self.replace {
            return Ok(uri.clone());
        }
        let mut parts = uri.clone().into_parts();
        parts.scheme = Some(self.scheme.clone());
        parts.authority = Some(self.authority.clone());
        if parts.path_and_query.is_none() {
            parts.path_and_query = Some(PathAndQuery::from_static("/"));
        }
        Uri::from_parts(parts).map_err(|e| invalid(&uri.to_string(), InvalidUriKind::ParseError, e.to_string()))
    }
}

impl Plugin for AddHostPlugin {
    fn process(&self, request: Request, next: RequestHandler) -> Promise {
        match self.apply(request.uri()) {
            Ok(uri) => next.handle(with_uri(request, uri)),
            Err(err) => Promise::rejected(err),
        }
    }
}

/// URIs already prefixed during one dispatch.
#[derive(Debug, Clone, Default)]
struct PrefixedUris(HashSet<String>);

/// Prepends a base path.
///
/// A URI this plugin produced is not prefixed again when the chain restarts
/// with it.
#[derive(Debug, Clone)]
pub struct AddPathPlugin {
    prefix: String,
}

impl AddPathPlugin {
    /// # Errors
    /// Returns [`HttpError::InvalidUri`] if `prefix` is not an absolute path.
    pub fn new(prefix: &str) -> Result<Self, HttpError> {
        if !prefix.starts_with('/') || prefix.contains(['?', '#']) {
            return Err(invalid(prefix, InvalidUriKind::ParseError, "path prefix must be an absolute path"));
        }
        Ok(Self {
            prefix: prefix.trim_end_matches('/').to_owned(),
        })
    }

    fn apply(&self, uri: &Uri) -> Result<Uri, HttpError> {
        let path_and_query = match uri.query() {
            Some(query) => format!("{}{}?{query}", self.prefix, uri.path()),
            None => format!("{}{}", self.prefix, uri.path()),
        };
        let mut parts = uri.clone().into_parts();
        parts.path_and_query = Some(PathAndQuery::try_from(path_and_query).map_err(http::Error::from)?);
        Uri::from_parts(parts).map_err(|e| invalid(&uri.to_string(), InvalidUriKind::ParseError, e.to_string()))
    }
}

impl Plugin for AddPathPlugin {
    fn process(&self, request: Request, next: RequestHandler) -> Promise {
        let current = request.uri().to_string();
        if next.with_state(|done: &mut PrefixedUris| done.0.contains(&current)) {
            return next.handle(request);
        }
        match self.apply(request.uri()) {
            Ok(uri) => {
                let produced = uri.to_string();
                next.with_state(|done: &mut PrefixedUris| done.0.insert(produced));
                next.handle(with_uri(request, uri))
            }
            Err(err) => Promise::rejected(err),
        }
    }
}

/// Points relative requests at a base URI such as `https://api.test/v2`.
///
/// Runs [`AddHostPlugin`] itself and splices an [`AddPathPlugin`] in right
/// after it when the base has a path.
#[derive(Debug, Clone)]
pub struct BaseUriPlugin {
    host: AddHostPlugin,
    path: Option<AddPathPlugin>,
}

impl BaseUriPlugin {
    /// # Errors
    /// Returns [`HttpError::InvalidUri`] if `base` is not an absolute URI.
    pub fn new(base: &str) -> Result<Self, HttpError> {
        let uri = parse(base)?;
        let host = AddHostPlugin::new(base)?;
        let path = match uri.path() {
            "" | "/" => None,
            path => Some(AddPathPlugin::new(path)?),
        };
        Ok(Self { host, path })
    }

    #[must_use]
    pub fn replace(mut self, replace: bool) -> Self {
        self.host = self.host.replace(replace);
        self
    }
}

impl Plugin for BaseUriPlugin {
    fn process(&self, request: Request, next: RequestHandler) -> Promise {
        if let Some(path) = &self.path
            && (request.uri().authority().is_none() || self.host.replace)
        {
            next.insert_after(path.clone());
        }
        self.host.process(request, next)
    }
}
