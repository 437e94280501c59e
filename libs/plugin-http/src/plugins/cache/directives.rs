//! `Cache-Control` parsing and freshness computation.

use crate::clock::unix_seconds;
use crate::config::{CacheConfig, CacheDirective};
use http::HeaderMap;
use http::header::{AGE, CACHE_CONTROL, EXPIRES};
use std::collections::HashMap;
use std::time::{Duration, SystemTime};

/// Status codes whose responses may be stored.
const CACHEABLE_STATUSES: [u16; 7] = [200, 203, 300, 301, 302, 404, 410];

/// Parsed `Cache-Control` header (all occurrences merged).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct CacheControl {
    directives: HashMap<String, Option<String>>,
}

impl CacheControl {
    pub(crate) fn parse(headers: &HeaderMap) -> Self {
        let mut directives = HashMap::new();
        for value in headers.get_all(CACHE_CONTROL) {
            let Ok(value) = value.to_str() else {
                continue;
            };
            for part in value.split(',') {
                let part = part.trim();
                if part.is_empty() {
                    continue;
                }
                let (name, argument) = match part.split_once('=') {
                    Some((name, argument)) => (name, Some(argument.trim().trim_matches('"').to_owned())),
                    None => (part, None),
                };
                directives.insert(name.trim().to_ascii_lowercase(), argument);
            }
        }
        Self { directives }
    }

    pub(crate) fn has(&self, name: &str) -> bool {
        self.directives.contains_key(name)
    }

    /// `max-age` in seconds. A malformed value counts as zero.
    pub(crate) fn max_age(&self) -> Option<u64> {
        self.directives
            .get("max-age")
            .map(|argument| argument.as_deref().and_then(|v| v.parse().ok()).unwrap_or(0))
    }
}

/// Whether `status` and the response directives allow storing.
pub(crate) fn is_cacheable(config: &CacheConfig, status: u16, headers: &HeaderMap) -> bool {
    if !CACHEABLE_STATUSES.contains(&status) {
        return false;
    }
    let control = CacheControl::parse(headers);
    ![CacheDirective::NoCache, CacheDirective::Private, CacheDirective::NoStore]
        .into_iter()
        .any(|directive| config.respects(directive) && control.has(directive.as_str()))
}

/// Freshness lifetime of a response.
///
/// Unless `max-age` is respected the configured default applies as is.
/// Otherwise `max-age` minus `Age` wins, then `Expires` relative to `now`,
/// then the default.
pub(crate) fn max_age(config: &CacheConfig, headers: &HeaderMap, now: SystemTime) -> Option<Duration> {
    if !config.respects(CacheDirective::MaxAge) {
        return config.default_ttl;
    }

    if let Some(max_age) = CacheControl::parse(headers).max_age() {
        let age = headers
            .get(AGE)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<u64>().ok())
            .unwrap_or(0);
        return Some(Duration::from_secs(max_age.saturating_sub(age)));
    }

    if let Some(expires) = headers
        .get(EXPIRES)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| httpdate::parse_http_date(v).ok())
    {
        let remaining = unix_seconds(expires).saturating_sub(unix_seconds(now));
        return Some(Duration::from_secs(u64::try_from(remaining).unwrap_or(0)));
    }

    config.default_ttl
}
