//! Streaming HTTP body type used for both locally-generated responses (404,
//! 502, 503, health checks) and proxied upstream bodies.
//!
//! The proxy must never buffer an upstream response body in memory, so
//! [`ProxyBody`] wraps whatever concrete body type a response needs —
//! a static byte buffer for locally-generated errors, or the upstream
//! [`hyper::body::Incoming`] passed straight through — behind one boxed,
//! type-erased `Body` implementation.

use std::{
    pin::Pin,
    task::{Context, Poll},
};

use bytes::Bytes;
use http_body_util::{BodyExt, Empty};
use hyper::body::{Body, Frame, SizeHint};

use crate::types::BoxError;

type BoxBody = http_body_util::combinators::UnsyncBoxBody<Bytes, BoxError>;

/// Type-erased streaming HTTP body.
pub struct ProxyBody(BoxBody);

impl ProxyBody {
    /// Wraps any body implementation that produces `Bytes` frames.
    pub fn new<B>(body: B) -> Self
    where
        B: Body<Data = Bytes> + Send + 'static,
        B::Error: Into<BoxError>,
    {
        Self(body.map_err(Into::into).boxed_unsync())
    }

    /// An empty body — used for 404/503 bodies with no content and for
    /// the health endpoint's response.
    pub fn empty() -> Self {
        Self::new(Empty::new())
    }
}

impl Default for ProxyBody {
    fn default() -> Self {
        Self::empty()
    }
}

impl From<&str> for ProxyBody {
    fn from(buf: &str) -> Self {
        Self::new(http_body_util::Full::from(buf.to_owned()))
    }
}

impl From<String> for ProxyBody {
    fn from(buf: String) -> Self {
        Self::new(http_body_util::Full::from(buf))
    }
}

impl From<Bytes> for ProxyBody {
    fn from(buf: Bytes) -> Self {
        Self::new(http_body_util::Full::from(buf))
    }
}

impl Body for ProxyBody {
    type Data = Bytes;
    type Error = BoxError;

    #[inline]
    fn poll_frame(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        Pin::new(&mut self.0).poll_frame(cx)
    }

    #[inline]
    fn size_hint(&self) -> SizeHint {
        self.0.size_hint()
    }

    #[inline]
    fn is_end_stream(&self) -> bool {
        self.0.is_end_stream()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn empty_body_ends_immediately() {
        let body = ProxyBody::empty();
        assert!(body.is_end_stream());
        assert_eq!(body.size_hint().exact(), Some(0));
    }

    #[tokio::test]
    async fn collects_string_body() {
        let body = ProxyBody::from("hello");
        let collected = body.collect().await.unwrap().to_bytes();
        assert_eq!(&collected[..], b"hello");
    }
}
