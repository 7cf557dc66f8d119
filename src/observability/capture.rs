//! Non-destructive traffic capture.
//!
//! # Responsibilities
//! - Tee request and response bodies into bounded buffers while the real
//!   consumer reads them
//! - Signal when a response body finishes, fails, or is dropped
//! - Snapshot method, URI, headers and status into a [`CapturedExchange`]
//!
//! # Design Decisions
//! - Frames are forwarded unchanged; only the copy is bounded
//! - Overflow truncates the copy and sets a flag, never the delivered bytes
//! - A dropped body still fires its hook so partial captures get flushed

use std::fmt;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard};
use std::task::{Context, Poll};
use std::time::Duration;

use axum::{
    body::Body,
    http::{response::Parts, HeaderMap, Method, Response, StatusCode},
};
use bytes::{Bytes, BytesMut};
use http_body::{Body as HttpBody, Frame, SizeHint};
use http_body_util::BodyExt;
use serde::Serialize;

use crate::error::GuardError;

/// Which side of the service the traffic belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Source {
    /// Requests made to this service.
    Inbound,
    /// Calls this service makes.
    Outbound,
}

impl Source {
    pub fn as_str(&self) -> &'static str {
        match self {
            Source::Inbound => "inbound",
            Source::Outbound => "outbound",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Request,
    Response,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Request => "request",
            Direction::Response => "response",
        }
    }
}

/// One side of an exchange as seen on the wire.
#[derive(Debug, Clone)]
pub struct CapturedExchange {
    pub source: Source,
    pub direction: Direction,
    pub method: Method,
    pub uri: String,
    /// Response only.
    pub status: Option<StatusCode>,
    /// Ordered; repeated names appear once per value.
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
    pub body_truncated: bool,
    /// Response only.
    pub elapsed: Option<Duration>,
    pub request_id: Option<String>,
}

/// Flatten a header map into ordered name/value pairs.
pub fn header_pairs(headers: &HeaderMap) -> Vec<(String, String)> {
    headers
        .iter()
        .map(|(name, value)| {
            (
                name.as_str().to_string(),
                String::from_utf8_lossy(value.as_bytes()).into_owned(),
            )
        })
        .collect()
}

#[derive(Debug)]
struct BufferInner {
    data: BytesMut,
    limit: usize,
    truncated: bool,
}

/// Shared, size-bounded copy of a body.
#[derive(Debug, Clone)]
pub struct CaptureBuffer {
    inner: Arc<Mutex<BufferInner>>,
}

impl CaptureBuffer {
    pub fn new(limit: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(BufferInner {
                data: BytesMut::new(),
                limit,
                truncated: false,
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, BufferInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Copy as much of `chunk` as the limit allows.
    pub fn append(&self, chunk: &[u8]) {
        let mut inner = self.lock();
        let room = inner.limit.saturating_sub(inner.data.len());
        if chunk.len() > room {
            inner.truncated = true;
        }
        let take = chunk.len().min(room);
        inner.data.extend_from_slice(&chunk[..take]);
    }

    /// Bytes captured so far and whether anything was dropped.
    pub fn snapshot(&self) -> (Bytes, bool) {
        let inner = self.lock();
        (Bytes::copy_from_slice(&inner.data), inner.truncated)
    }
}

/// How a teed body ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyOutcome {
    /// The stream reached its end.
    Completed,
    /// The stream yielded an error.
    Failed,
    /// The body was dropped before its end (client went away).
    Aborted,
}

type CompletionHook = Box<dyn FnOnce(BodyOutcome) + Send>;

/// Body decorator forwarding every frame while copying data into a buffer.
pub struct TeeBody<B> {
    inner: B,
    buffer: CaptureBuffer,
    on_complete: Option<CompletionHook>,
}

impl<B> TeeBody<B> {
    pub fn new(inner: B, buffer: CaptureBuffer) -> Self {
        Self {
            inner,
            buffer,
            on_complete: None,
        }
    }

    /// Run `hook` once when the body ends, fails or is dropped.
    pub fn on_complete(mut self, hook: impl FnOnce(BodyOutcome) + Send + 'static) -> Self {
        self.on_complete = Some(Box::new(hook));
        self
    }

    fn finish(&mut self, outcome: BodyOutcome) {
        if let Some(hook) = self.on_complete.take() {
            hook(outcome);
        }
    }
}

impl<B> fmt::Debug for TeeBody<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TeeBody")
            .field("buffer", &self.buffer)
            .field("pending_hook", &self.on_complete.is_some())
            .finish()
    }
}

impl<B> HttpBody for TeeBody<B>
where
    B: HttpBody<Data = Bytes> + Unpin,
{
    type Data = Bytes;
    type Error = B::Error;

    fn poll_frame(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let this = &mut *self;

        match Pin::new(&mut this.inner).poll_frame(cx) {
            Poll::Ready(Some(Ok(frame))) => {
                if let Some(data) = frame.data_ref() {
                    this.buffer.append(data);
                }
                // Consumers may stop polling once the body reports its end.
                if this.inner.is_end_stream() {
                    this.finish(BodyOutcome::Completed);
                }
                Poll::Ready(Some(Ok(frame)))
            }
            Poll::Ready(Some(Err(e))) => {
                this.finish(BodyOutcome::Failed);
                Poll::Ready(Some(Err(e)))
            }
            Poll::Ready(None) => {
                this.finish(BodyOutcome::Completed);
                Poll::Ready(None)
            }
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

impl<B> Drop for TeeBody<B> {
    fn drop(&mut self) {
        self.finish(BodyOutcome::Aborted);
    }
}

/// A fully read response.
#[derive(Debug)]
pub struct BufferedResponse {
    pub parts: Parts,
    pub body: Bytes,
}

/// Read a response to its end.
pub async fn buffer_response(response: Response<Body>) -> Result<BufferedResponse, GuardError> {
    let (parts, body) = response.into_parts();
    let body = body
        .collect()
        .await
        .map_err(|e| GuardError::ResponseCapture(e.to_string()))?
        .to_bytes();
    Ok(BufferedResponse { parts, body })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use axum::http::HeaderValue;
    use http_body_util::{BodyExt, Full, StreamBody};

    #[test]
    fn test_buffer_truncates_copy_only() {
        let buffer = CaptureBuffer::new(5);
        buffer.append(b"abc");
        buffer.append(b"defgh");
        let (data, truncated) = buffer.snapshot();
        assert_eq!(&data[..], b"abcde");
        assert!(truncated);
    }

    #[tokio::test]
    async fn test_tee_forwards_everything() {
        let buffer = CaptureBuffer::new(4);
        let chunks: Vec<Result<Frame<Bytes>, std::io::Error>> = vec![
            Ok(Frame::data(Bytes::from_static(b"hello "))),
            Ok(Frame::data(Bytes::from_static(b"world"))),
        ];
        let body = TeeBody::new(StreamBody::new(futures_util::stream::iter(chunks)), buffer.clone());

        let delivered = body.collect().await.unwrap().to_bytes();
        assert_eq!(&delivered[..], b"hello world");

        let (copy, truncated) = buffer.snapshot();
        assert_eq!(&copy[..], b"hell");
        assert!(truncated);
    }

    #[tokio::test]
    async fn test_hook_fires_once_on_completion() {
        let fired = Arc::new(AtomicUsize::new(0));
        let seen = fired.clone();
        let body = TeeBody::new(Full::new(Bytes::from_static(b"{}")), CaptureBuffer::new(64))
            .on_complete(move |outcome| {
                assert_eq!(outcome, BodyOutcome::Completed);
                seen.fetch_add(1, Ordering::SeqCst);
            });

        let bytes = body.collect().await.unwrap().to_bytes();
        assert_eq!(&bytes[..], b"{}");
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_hook_fires_on_drop() {
        let outcome = Arc::new(Mutex::new(None));
        let seen = outcome.clone();
        let body = TeeBody::new(Full::new(Bytes::from_static(b"partial")), CaptureBuffer::new(64))
            .on_complete(move |o| {
                *seen.lock().unwrap() = Some(o);
            });
        drop(body);
        assert_eq!(*outcome.lock().unwrap(), Some(BodyOutcome::Aborted));
    }

    #[tokio::test]
    async fn test_buffer_response() {
        let mut response = Response::new(Body::from("payload"));
        response
            .headers_mut()
            .insert("x-test", HeaderValue::from_static("1"));

        let buffered = buffer_response(response).await.unwrap();
        assert_eq!(&buffered.body[..], b"payload");
        assert_eq!(buffered.parts.headers["x-test"], "1");
    }

    #[test]
    fn test_header_pairs_keep_repeats() {
        let mut headers = HeaderMap::new();
        headers.append("set-cookie", HeaderValue::from_static("a=1"));
        headers.append("set-cookie", HeaderValue::from_static("b=2"));
        headers.insert("content-type", HeaderValue::from_static("text/plain"));

        let pairs = header_pairs(&headers);
        assert_eq!(pairs.len(), 3);
        assert_eq!(
            pairs.iter().filter(|(n, _)| n == "set-cookie").count(),
            2
        );
    }
}
