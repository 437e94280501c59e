use crate::chain::{Plugin, RequestHandler};
use crate::error::HttpError;
use crate::message::Request;
use crate::promise::Promise;

/// Turns 4xx and 5xx responses into [`HttpError::ClientError`] and
/// [`HttpError::ServerError`]. The response stays reachable through
/// [`HttpError::response`].
#[derive(Debug, Clone, Copy, Default)]
pub struct ErrorPlugin {
    only_server_exception: bool,
}

impl ErrorPlugin {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Leave 4xx responses alone and only reject 5xx.
    #[must_use]
    pub fn only_server_exception(mut self, only: bool) -> Self {
        self.only_server_exception = only;
        self
    }
}

impl Plugin for ErrorPlugin {
    fn process(&self, request: Request, next: RequestHandler) -> Promise {
        let only_server = self.only_server_exception;
        next.handle(request).and_then(move |response| {
            let status = response.status();
            if status.is_client_error() && !only_server {
                return Promise::rejected(HttpError::ClientError {
                    status,
                    response: Box::new(response),
                });
            }
            if status.is_server_error() {
                return Promise::rejected(HttpError::ServerError {
                    status,
                    response: Box::new(response),
                });
            }
            Promise::fulfilled(response)
        })
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;
    use crate::client::{HttpClient, PluginClient};
    use crate::testing::{MockClient, get, response_with};

    #[tokio::test]
    async fn test_status_errors_carry_response() {
        let client = PluginClient::builder()
            .plugin(ErrorPlugin::new())
            .build(MockClient::new(|request, _| {
                let status = request.uri().path().trim_start_matches('/').parse().unwrap();
                Ok(response_with(status, &[], b"detail"))
            }));

        let err = client.send_async_request(get("http://e.test/404")).await.unwrap_err();
        assert!(matches!(err, HttpError::ClientError { status, .. } if status == 404));
        assert_eq!(err.response().unwrap().body().as_ref(), b"detail");

        let err = client.send_async_request(get("http://e.test/503")).await.unwrap_err();
        assert!(matches!(err, HttpError::ServerError { status, .. } if status == 503));

        let ok = client.send_async_request(get("http://e.test/302")).await.unwrap();
        assert_eq!(ok.status(), 302);
    }

    #[tokio::test]
    async fn test_only_server_exception() {
        let client = PluginClient::builder()
            .plugin(ErrorPlugin::new().only_server_exception(true))
            .build(MockClient::status(404));

        let response = client.send_async_request(get("http://e.test/")).await.unwrap();
        assert_eq!(response.status(), 404);
    }
}
