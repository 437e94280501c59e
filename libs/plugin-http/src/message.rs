//! Message aliases and helpers shared by plugins and transports.
//!
//! Requests and responses are plain `http` types with fully buffered
//! [`Bytes`] bodies, so a plugin can hold on to a copy of the request it
//! forwarded (redirect, retry) without any rewind logic.

use bytes::Bytes;
use http::header::HeaderName;
use http::{HeaderMap, Uri};

/// Request flowing through the plugin chain.
pub type Request = http::Request<Bytes>;

/// Response flowing back through the plugin chain.
pub type Response = http::Response<Bytes>;

/// Clone a request including its extensions.
#[must_use]
pub fn clone_request(request: &Request) -> Request {
    let mut cloned = http::Request::new(request.body().clone());
    *cloned.method_mut() = request.method().clone();
    *cloned.uri_mut() = request.uri().clone();
    *cloned.version_mut() = request.version();
    *cloned.headers_mut() = request.headers().clone();
    *cloned.extensions_mut() = request.extensions().clone();
    cloned
}

/// Clone a response including its extensions.
#[must_use]
pub fn clone_response(response: &Response) -> Response {
    let mut cloned = http::Response::new(response.body().clone());
    *cloned.status_mut() = response.status();
    *cloned.version_mut() = response.version();
    *cloned.headers_mut() = response.headers().clone();
    *cloned.extensions_mut() = response.extensions().clone();
    cloned
}

/// Return a copy of `request` pointing at `uri`.
#[must_use]
pub fn with_uri(mut request: Request, uri: Uri) -> Request {
    *request.uri_mut() = uri;
    request
}

/// Join all values of a header into one comma separated string.
///
/// Non UTF-8 values are skipped.
#[must_use]
pub fn header_line(headers: &HeaderMap, name: &HeaderName) -> Option<String> {
    let values: Vec<&str> = headers
        .get_all(name)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .collect();
    if values.is_empty() {
        None
    } else {
        Some(values.join(", "))
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;

    #[derive(Clone, Debug, PartialEq)]
    struct Marker(u32);

    #[test]
    fn test_clone_request_keeps_extensions_and_repeated_headers() {
        let mut request = http::Request::builder()
            .method("POST")
            .uri("https://example.com/a?b=c")
            .header("x-multi", "1")
            .header("x-multi", "2")
            .body(Bytes::from_static(b"payload"))
            .unwrap();
        request.extensions_mut().insert(Marker(7));

        let cloned = clone_request(&request);

        assert_eq!(cloned.method(), http::Method::POST);
        assert_eq!(cloned.uri(), request.uri());
        assert_eq!(cloned.headers().get_all("x-multi").iter().count(), 2);
        assert_eq!(cloned.body(), request.body());
        assert_eq!(cloned.extensions().get::<Marker>(), Some(&Marker(7)));
    }

    #[test]
    fn test_header_line_joins_values() {
        let mut headers = HeaderMap::new();
        headers.append("cache-control", "max-age=10".parse().unwrap());
        headers.append("cache-control", "public".parse().unwrap());

        assert_eq!(
            header_line(&headers, &http::header::CACHE_CONTROL).as_deref(),
            Some("max-age=10, public")
        );
        assert_eq!(header_line(&headers, &http::header::ETAG), None);
    }
}
