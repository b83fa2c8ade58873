//! Body helpers shared by the gateway layers
//!
//! `CaptureBody` forwards every frame of an inner body unchanged while keeping a
//! bounded copy of the data. When the stream ends (or the body is dropped early)
//! it hands the copy to a completion callback. The response cache and the request
//! logger both tee bodies through it.

use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Empty, Full};
use hyper::body::{Body, Bytes, Frame, SizeHint};
use std::pin::Pin;
use std::task::{Context, Poll};

/// Body type used on both sides of the gateway
pub type ProxyBody = BoxBody<Bytes, hyper::Error>;

pub fn full(data: impl Into<Bytes>) -> ProxyBody {
    Full::new(data.into()).map_err(|never| match never {}).boxed()
}

pub fn empty() -> ProxyBody {
    Empty::<Bytes>::new().map_err(|never| match never {}).boxed()
}

/// What a `CaptureBody` saw by the time it finished
#[derive(Debug, Clone)]
pub struct Captured {
    /// At most `limit` leading bytes of the body
    pub bytes: Bytes,
    /// Total number of data bytes that passed through
    pub total: u64,
    /// True when `total` exceeded the limit
    pub truncated: bool,
    /// True when the inner body reached its end without error
    pub complete: bool,
}

type OnComplete = Box<dyn FnOnce(Captured) + Send + Sync>;

pub struct CaptureBody {
    inner: ProxyBody,
    limit: usize,
    buf: Vec<u8>,
    total: u64,
    truncated: bool,
    on_complete: Option<OnComplete>,
}

impl CaptureBody {
    pub fn new<F>(inner: ProxyBody, limit: usize, on_complete: F) -> Self
    where
        F: FnOnce(Captured) + Send + Sync + 'static,
    {
        Self {
            inner,
            limit,
            buf: Vec::new(),
            total: 0,
            truncated: false,
            on_complete: Some(Box::new(on_complete)),
        }
    }

    pub fn boxed(self) -> ProxyBody {
        BodyExt::boxed(self)
    }

    fn finish(&mut self, complete: bool) {
        if let Some(callback) = self.on_complete.take() {
            callback(Captured {
                bytes: Bytes::from(std::mem::take(&mut self.buf)),
                total: self.total,
                truncated: self.truncated,
                complete,
            });
        }
    }
}

impl Body for CaptureBody {
    type Data = Bytes;
    type Error = hyper::Error;

    fn poll_frame(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Bytes>, hyper::Error>>> {
        let this = &mut *self;
        match Pin::new(&mut this.inner).poll_frame(cx) {
            Poll::Ready(Some(Ok(frame))) => {
                if let Some(data) = frame.data_ref() {
                    this.total += data.len() as u64;
                    let room = this.limit.saturating_sub(this.buf.len());
                    if data.len() > room {
                        this.truncated = true;
                    }
                    this.buf.extend_from_slice(&data[..data.len().min(room)]);
                }
                Poll::Ready(Some(Ok(frame)))
            }
            Poll::Ready(Some(Err(e))) => {
                this.finish(false);
                Poll::Ready(Some(Err(e)))
            }
            Poll::Ready(None) => {
                this.finish(true);
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

impl Drop for CaptureBody {
    fn drop(&mut self) {
        // Empty bodies can be dropped without ever being polled.
        let complete = self.inner.is_end_stream();
        self.finish(complete);
    }
}
