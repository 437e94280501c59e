use super::{TransportErrorCode, TransportFailure};
use bytes::Bytes;
use http_body::{Body, Frame, SizeHint};
use std::collections::VecDeque;
use std::convert::Infallible;
use std::pin::Pin;
use std::task::{Context, Poll};

/// Request body as handed to the engine.
///
/// Either one buffer or a queue of chunks sliced out of the same
/// allocation; the exact length is always known so the engine can set
/// `Content-Length`.
#[derive(Debug, Clone, Default)]
pub struct WireBody {
    chunks: VecDeque<Bytes>,
    remaining: usize,
}

impl WireBody {
    #[must_use]
    pub fn full(data: Bytes) -> Self {
        let remaining = data.len();
        let mut chunks = VecDeque::with_capacity(1);
        if !data.is_empty() {
            chunks.push_back(data);
        }
        Self { chunks, remaining }
    }

    /// Split `data` into `chunk_size` pieces without copying.
    #[must_use]
    pub fn chunked(data: Bytes, chunk_size: usize) -> Self {
        let chunk_size = chunk_size.max(1);
        let remaining = data.len();
        let mut chunks = VecDeque::with_capacity(remaining.div_ceil(chunk_size));
        let mut offset = 0;
        while offset < remaining {
            let end = (offset + chunk_size).min(remaining);
            chunks.push_back(data.slice(offset..end));
            offset = end;
        }
        Self { chunks, remaining }
    }

    /// Bytes not yet yielded.
    #[must_use]
    pub fn len(&self) -> usize {
        self.remaining
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.remaining == 0
    }

    /// Whether the body goes out in more than one frame.
    #[must_use]
    pub fn is_streamed(&self) -> bool {
        self.chunks.len() > 1
    }
}

impl Body for WireBody {
    type Data = Bytes;
    type Error = Infallible;

    fn poll_frame(
        mut self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        match self.chunks.pop_front() {
            Some(chunk) => {
                self.remaining -= chunk.len();
                Poll::Ready(Some(Ok(Frame::data(chunk))))
            }
            None => Poll::Ready(None),
        }
    }

    fn is_end_stream(&self) -> bool {
        self.chunks.is_empty()
    }

    fn size_hint(&self) -> SizeHint {
        SizeHint::with_exact(u64::try_from(self.remaining).unwrap_or(u64::MAX))
    }
}

pin_project_lite::pin_project! {
    /// Response body wrapper that fails once more than `limit` bytes
    /// have been read.
    pub struct LimitedBody<B> {
        #[pin]
        inner: B,
        limit: usize,
        read: usize,
    }
}

impl<B> LimitedBody<B> {
    #[must_use]
    pub fn new(inner: B, limit: usize) -> Self {
        Self {
            inner,
            limit,
            read: 0,
        }
    }

    #[must_use]
    pub fn bytes_read(&self) -> usize {
        self.read
    }
}

impl<B> Body for LimitedBody<B>
where
    B: Body<Data = Bytes>,
    B::Error: Into<crate::error::BoxError>,
{
    type Data = Bytes;
    type Error = TransportFailure;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let this = self.project();

        match this.inner.poll_frame(cx) {
            Poll::Ready(Some(Ok(frame))) => {
                if let Some(data) = frame.data_ref() {
                    *this.read += data.len();
                    if *this.read > *this.limit {
                        return Poll::Ready(Some(Err(TransportFailure::new(
                            TransportErrorCode::ReceiveError,
                            format!(
                                "response body too large: limit {} bytes, got {} bytes",
                                this.limit, this.read
                            ),
                        ))));
                    }
                }
                Poll::Ready(Some(Ok(frame)))
            }
            Poll::Ready(Some(Err(e))) => Poll::Ready(Some(Err(TransportFailure::new(
                TransportErrorCode::ReceiveError,
                "failed to read response body",
            )
            .with_source(e)))),
            Poll::Ready(None) => Poll::Ready(None),
            Poll::Pending => Poll::Pending,
        }
    }

    fn is_end_stream(&self) -> bool {
        self.inner.is_end_stream()
    }

    fn size_hint(&self) -> SizeHint {
        self.inner.size_hint()
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;
    use http_body_util::{BodyExt, Full};

    #[tokio::test]
    async fn test_chunked_body_yields_all_bytes_in_order() {
        let body = WireBody::chunked(Bytes::from_static(b"abcdefghij"), 4);
        assert!(body.is_streamed());
        assert_eq!(body.size_hint().exact(), Some(10));

        let mut body = body;
        let mut frames = Vec::new();
        while let Some(frame) = body.frame().await {
            frames.push(frame.unwrap().into_data().unwrap());
        }

        assert_eq!(frames, vec!["abcd", "efgh", "ij"]);
        assert!(body.is_empty());
    }

    #[test]
    fn test_empty_full_body_is_end_stream() {
        let body = WireBody::full(Bytes::new());
        assert!(body.is_end_stream());
        assert!(!body.is_streamed());
    }

    #[tokio::test]
    async fn test_limited_body_within_limit() {
        let body = LimitedBody::new(Full::new(Bytes::from_static(b"hello")), 5);
        let collected = body.collect().await.unwrap().to_bytes();
        assert_eq!(collected.as_ref(), b"hello");
    }

    #[tokio::test]
    async fn test_limited_body_over_limit() {
        let body = LimitedBody::new(Full::new(Bytes::from_static(b"hello world")), 5);
        let err = body.collect().await.unwrap_err();
        assert_eq!(err.code, TransportErrorCode::ReceiveError);
        assert!(err.message.contains("limit 5"));
    }
}
