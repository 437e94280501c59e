//! Test doubles shared by the module tests.

use crate::client::HttpClient;
use crate::error::HttpError;
use crate::message::{Request, Response, clone_request};
use crate::promise::Promise;
use bytes::Bytes;
use parking_lot::Mutex;
use std::sync::Arc;

type Responder = Box<dyn Fn(&Request, usize) -> Result<Response, HttpError> + Send + Sync>;

/// Client recording every request and answering from a closure that gets
/// the request and its zero-based call index.
pub(crate) struct MockClient {
    requests: Mutex<Vec<Request>>,
    responder: Responder,
}

impl MockClient {
    pub(crate) fn new(
        responder: impl Fn(&Request, usize) -> Result<Response, HttpError> + Send + Sync + 'static,
    ) -> Arc<Self> {
        Arc::new(Self {
            requests: Mutex::new(Vec::new()),
            responder: Box::new(responder),
        })
    }

    pub(crate) fn status(status: u16) -> Arc<Self> {
        Self::new(move |_, _| Ok(response(status)))
    }

    pub(crate) fn calls(&self) -> usize {
        self.requests.lock().len()
    }

    pub(crate) fn request(&self, index: usize) -> Request {
        clone_request(&self.requests.lock()[index])
    }
}

impl HttpClient for MockClient {
    fn send_async_request(&self, request: Request) -> Promise {
        let index = {
            let mut requests = self.requests.lock();
            requests.push(clone_request(&request));
            requests.len() - 1
        };
        match (self.responder)(&request, index) {
            Ok(response) => Promise::fulfilled(response),
            Err(err) => Promise::rejected(err),
        }
    }
}

pub(crate) fn response(status: u16) -> Response {
    http::Response::builder()
        .status(status)
        .body(Bytes::new())
        .unwrap()
}

pub(crate) fn response_with(status: u16, headers: &[(&str, &str)], body: &'static [u8]) -> Response {
    let mut builder = http::Response::builder().status(status);
    for (name, value) in headers {
        builder = builder.header(*name, *value);
    }
    builder.body(Bytes::from_static(body)).unwrap()
}

pub(crate) fn get(uri: &str) -> Request {
    http::Request::get(uri).body(Bytes::new()).unwrap()
}

pub(crate) fn post(uri: &str, body: &'static [u8]) -> Request {
    http::Request::post(uri)
        .header("content-type", "text/plain")
        .header("content-length", body.len().to_string())
        .body(Bytes::from_static(body))
        .unwrap()
}
