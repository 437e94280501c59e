//! `Content-Encoding` decoding.

use crate::chain::{Plugin, RequestHandler};
use crate::error::HttpError;
use crate::message::{Request, Response, header_line};
use crate::promise::Promise;
use bytes::Bytes;
use flate2::read::{DeflateDecoder, GzDecoder, ZlibDecoder};
use http::HeaderValue;
use http::header::{ACCEPT_ENCODING, CONTENT_ENCODING, CONTENT_LENGTH};
use std::io::Read;

/// Default cap on a decoded body (10 MiB).
pub const DEFAULT_MAX_DECODED_SIZE: usize = 10 * 1024 * 1024;

/// Decodes gzip and deflate response bodies.
///
/// Adds `Accept-Encoding: gzip, deflate` when the request has none. Unknown
/// encodings are left untouched. Decoding stops with
/// [`HttpError::BodyTooLarge`] once the output exceeds the configured size.
#[derive(Debug, Clone, Copy)]
pub struct DecoderPlugin {
    use_content_encoding: bool,
    max_decoded_size: usize,
}

impl Default for DecoderPlugin {
    fn default() -> Self {
        Self {
            use_content_encoding: true,
            max_decoded_size: DEFAULT_MAX_DECODED_SIZE,
        }
    }
}

impl DecoderPlugin {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Do not advertise or decode `Content-Encoding`.
    #[must_use]
    pub fn use_content_encoding(mut self, enabled: bool) -> Self {
        self.use_content_encoding = enabled;
        self
    }

    #[must_use]
    pub fn max_decoded_size(mut self, limit: usize) -> Self {
        self.max_decoded_size = limit;
        self
    }

    fn decode(self, mut response: Response) -> Result<Response, HttpError> {
        let Some(encodings) = header_line(response.headers(), &CONTENT_ENCODING).map(|v| {
            v.split(',')
                .map(|e| e.trim().to_ascii_lowercase())
                .filter(|e| !e.is_empty())
                .collect::<Vec<_>>()
        }) else {
            return Ok(response);
        };

        // Encodings are listed in application order, so undo them back to front.
        let mut body = response.body().clone();
        let mut remaining = encodings.clone();
        while let Some(encoding) = remaining.last() {
            let decoded = match encoding.as_str() {
                "gzip" | "x-gzip" => read_limited(GzDecoder::new(body.as_ref()), encoding, self.max_decoded_size)?,
                "deflate" => inflate(&body, self.max_decoded_size)?,
                "identity" => body.to_vec(),
                _ => break,
            };
            body = Bytes::from(decoded);
            remaining.pop();
        }

        if remaining.len() == encodings.len() {
            return Ok(response);
        }

        tracing::trace!(encodings = ?encodings, decoded = body.len(), "decoded response body");
        let headers = response.headers_mut();
        if remaining.is_empty() {
            headers.remove(CONTENT_ENCODING);
        } else {
            headers.insert(CONTENT_ENCODING, HeaderValue::from_str(&remaining.join(", "))?);
        }
        headers.insert(CONTENT_LENGTH, HeaderValue::from(body.len()));
        *response.body_mut() = body;
        Ok(response)
    }
}

/// `deflate` is zlib-wrapped per RFC 9110, but raw deflate streams are common.
fn inflate(body: &[u8], limit: usize) -> Result<Vec<u8>, HttpError> {
    match read_limited(ZlibDecoder::new(body), "deflate", limit) {
        Ok(decoded) => Ok(decoded),
        Err(HttpError::Decode { .. }) => read_limited(DeflateDecoder::new(body), "deflate", limit),
        Err(err) => Err(err),
    }
}

fn read_limited(reader: impl Read, encoding: &str, limit: usize) -> Result<Vec<u8>, HttpError> {
    let mut decoded = Vec::new();
    let cap = u64::try_from(limit).unwrap_or(u64::MAX).saturating_add(1);
    reader
        .take(cap)
        .read_to_end(&mut decoded)
        .map_err(|source| HttpError::Decode {
            encoding: encoding.to_owned(),
            source,
        })?;
    if decoded.len() > limit {
        return Err(HttpError::BodyTooLarge {
            limit,
            actual: decoded.len(),
        });
    }
    Ok(decoded)
}

impl Plugin for DecoderPlugin {
    fn process(&self, mut request: Request, next: RequestHandler) -> Promise {
        if !self.use_content_encoding {
            return next.handle(request);
        }
        if !request.headers().contains_key(ACCEPT_ENCODING) {
            request
                .headers_mut()
                .insert(ACCEPT_ENCODING, HeaderValue::from_static("gzip, deflate"));
        }
        let this = *self;
        next.handle(request).and_then(move |response| match this.decode(response) {
            Ok(response) => Promise::fulfilled(response),
            Err(err) => Promise::rejected(err),
        })
    }
}
