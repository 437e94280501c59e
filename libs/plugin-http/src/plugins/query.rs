use crate::chain::{Plugin, RequestHandler};
use crate::error::{HttpError, InvalidUriKind};
use crate::message::{Request, with_uri};
use crate::promise::Promise;
use http::Uri;
use http::uri::PathAndQuery;
use serde::Serialize;

/// Adds query parameters the request does not already set.
#[derive(Debug, Clone)]
pub struct QueryDefaultsPlugin {
    defaults: Vec<(String, String)>,
}

impl QueryDefaultsPlugin {
    #[must_use]
    pub fn new(defaults: Vec<(String, String)>) -> Self {
        Self { defaults }
    }

    /// Build the defaults from any serializable key/value structure.
    ///
    /// # Errors
    /// Returns [`HttpError::Configuration`] if `defaults` does not
    /// serialize to a flat query string.
    pub fn from_serialize<T: Serialize>(defaults: &T) -> Result<Self, HttpError> {
        let encoded = serde_urlencoded::to_string(defaults)
            .map_err(|e| HttpError::Configuration(format!("invalid query defaults: {e}")))?;
        let pairs = serde_urlencoded::from_str(&encoded)
            .map_err(|e| HttpError::Configuration(format!("invalid query defaults: {e}")))?;
        Ok(Self::new(pairs))
    }

    fn apply(&self, uri: &Uri) -> Result<Uri, HttpError> {
        let mut pairs: Vec<(String, String)> = match uri.query() {
            Some(query) => serde_urlencoded::from_str(query).map_err(|e| HttpError::InvalidUri {
                url: uri.to_string(),
                kind: InvalidUriKind::ParseError,
                reason: e.to_string(),
            })?,
            None => Vec::new(),
        };
        let before = pairs.len();
        for (key, value) in &self.defaults {
            if !pairs.iter().any(|(k, _)| k == key) {
                pairs.push((key.clone(), value.clone()));
            }
        }
        if pairs.len() == before {
            return Ok(uri.clone());
        }

        let query = serde_urlencoded::to_string(&pairs)
            .map_err(|e| HttpError::Configuration(format!("cannot encode query: {e}")))?;
        let path_and_query = PathAndQuery::try_from(format!("{}?{query}", uri.path()))
            .map_err(http::Error::from)?;
        let mut parts = uri.clone().into_parts();
        parts.path_and_query = Some(path_and_query);
        Uri::from_parts(parts).map_err(|e| HttpError::InvalidUri {
            url: uri.to_string(),
            kind: InvalidUriKind::ParseError,
            reason: e.to_string(),
        })
    }
}

impl Plugin for QueryDefaultsPlugin {
    fn process(&self, request: Request, next: RequestHandler) -> Promise {
        match self.apply(request.uri()) {
            Ok(uri) => next.handle(with_uri(request, uri)),
            Err(err) => Promise::rejected(err),
        }
    }
}
