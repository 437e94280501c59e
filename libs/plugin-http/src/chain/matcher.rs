use crate::error::HttpError;
use crate::message::Request;
use http::Method;
use regex::Regex;

/// Predicate gating a conditional chain entry.
pub trait RequestMatcher: Send + Sync + 'static {
    fn matches(&self, request: &Request) -> bool;
}

impl<F> RequestMatcher for F
where
    F: Fn(&Request) -> bool + Send + Sync + 'static,
{
    fn matches(&self, request: &Request) -> bool {
        self(request)
    }
}

/// Matches on path and host patterns, methods and schemes.
///
/// Unset criteria match everything.
#[derive(Debug, Clone, Default)]
pub struct RegexRequestMatcher {
    path: Option<Regex>,
    host: Option<Regex>,
    methods: Vec<Method>,
    schemes: Vec<String>,
}

fn compile(pattern: &str) -> Result<Regex, HttpError> {
    Regex::new(pattern).map_err(|e| HttpError::Configuration(format!("invalid pattern '{pattern}': {e}")))
}

impl RegexRequestMatcher {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// # Errors
    ///
    /// Returns [`HttpError::Configuration`] for an invalid regex.
    pub fn path(mut self, pattern: &str) -> Result<Self, HttpError> {
        self.path = Some(compile(pattern)?);
        Ok(self)
    }

    /// # Errors
    ///
    /// Returns [`HttpError::Configuration`] for an invalid regex.
    pub fn host(mut self, pattern: &str) -> Result<Self, HttpError> {
        self.host = Some(compile(pattern)?);
        Ok(self)
    }

    #[must_use]
    pub fn methods(mut self, methods: impl IntoIterator<Item = Method>) -> Self {
        self.methods = methods.into_iter().collect();
        self
    }

    #[must_use]
    pub fn schemes<S: Into<String>>(mut self, schemes: impl IntoIterator<Item = S>) -> Self {
        self.schemes = schemes
            .into_iter()
            .map(|s| s.into().to_ascii_lowercase())
            .collect();
        self
    }
}

impl RequestMatcher for RegexRequestMatcher {
    fn matches(&self, request: &Request) -> bool {
        let uri = request.uri();

        if let Some(path) = &self.path
            && !path.is_match(uri.path())
        {
            return false;
        }
        if let Some(host) = &self.host
            && !uri.host().is_some_and(|h| host.is_match(h))
        {
            return false;
        }
        if !self.methods.is_empty() && !self.methods.contains(request.method()) {
            return false;
        }
        if !self.schemes.is_empty() {
            let scheme = uri.scheme_str().unwrap_or_default().to_ascii_lowercase();
            if !self.schemes.contains(&scheme) {
                return false;
            }
        }
        true
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn request(method: Method, uri: &str) -> Request {
        http::Request::builder()
            .method(method)
            .uri(uri)
            .body(Bytes::new())
            .unwrap()
    }

    #[test]
    fn test_empty_matcher_matches_everything() {
        let matcher = RegexRequestMatcher::new();
        assert!(matcher.matches(&request(Method::DELETE, "ftp://any.test/x")));
    }

    #[test]
    fn test_all_criteria_must_match() {
        let matcher = RegexRequestMatcher::new()
            .path("^/api/")
            .unwrap()
            .host(r"(^|\.)example\.com$")
            .unwrap()
            .methods([Method::GET, Method::POST])
            .schemes(["HTTPS"]);

        assert!(matcher.matches(&request(Method::GET, "https://api.example.com/api/users")));
        assert!(!matcher.matches(&request(Method::GET, "http://api.example.com/api/users")));
        assert!(!matcher.matches(&request(Method::PUT, "https://api.example.com/api/users")));
        assert!(!matcher.matches(&request(Method::GET, "https://example.org/api/users")));
        assert!(!matcher.matches(&request(Method::GET, "https://example.com/web")));
    }

    #[test]
    fn test_invalid_pattern_is_configuration_error() {
        let err = RegexRequestMatcher::new().path("(unclosed").unwrap_err();
        assert!(matches!(err, HttpError::Configuration(_)));
    }
}
