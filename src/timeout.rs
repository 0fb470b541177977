//! Idle and total deadlines for streamed backend response bodies.
//!
//! The per-request timeout only covers the backend producing response
//! headers. Once the body starts streaming, a stalled or endless backend is
//! cut off by [`TimeoutBody`] instead.

use bytes::Bytes;
use http_body::{Body, Frame, SizeHint};
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::time::{Instant, Sleep, sleep};

use crate::config::ForwardConfig;

/// Deadlines applied to a streamed body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamDeadlines {
    /// Longest wait between two frames.
    pub idle: Duration,
    /// Longest time the whole body may take.
    pub total: Duration,
}

impl StreamDeadlines {
    pub fn new(idle: Duration, total: Duration) -> Self {
        Self { idle, total }
    }
}

impl From<&ForwardConfig> for StreamDeadlines {
    fn from(config: &ForwardConfig) -> Self {
        Self::new(config.chunk_timeout, config.stream_timeout)
    }
}

/// Body wrapper that fails the stream when a deadline passes.
pub struct TimeoutBody<B> {
    inner: B,
    deadlines: StreamDeadlines,
    idle: Pin<Box<Sleep>>,
    total: Pin<Box<Sleep>>,
}

impl<B> TimeoutBody<B> {
    /// Wrap `inner`. Both clocks start now, when response headers have
    /// already been received.
    pub fn new(inner: B, deadlines: StreamDeadlines) -> Self {
        Self {
            inner,
            deadlines,
            idle: Box::pin(sleep(deadlines.idle)),
            total: Box::pin(sleep(deadlines.total)),
        }
    }

    pub fn deadlines(&self) -> StreamDeadlines {
        self.deadlines
    }
}

fn timed_out(what: &str, after: Duration) -> Box<dyn std::error::Error + Send + Sync> {
    std::io::Error::new(
        std::io::ErrorKind::TimedOut,
        format!("backend {what} timeout exceeded ({after:?})"),
    )
    .into()
}

impl<B> Body for TimeoutBody<B>
where
    B: Body<Data = Bytes> + Unpin,
    B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    type Data = Bytes;
    type Error = Box<dyn std::error::Error + Send + Sync>;

    fn poll_frame(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let this = &mut *self;

        if this.total.as_mut().poll(cx).is_ready() {
            return Poll::Ready(Some(Err(timed_out("stream", this.deadlines.total))));
        }

        match Pin::new(&mut this.inner).poll_frame(cx) {
            Poll::Ready(Some(Ok(frame))) => {
                this.idle.as_mut().reset(Instant::now() + this.deadlines.idle);
                Poll::Ready(Some(Ok(frame)))
            }
            Poll::Ready(Some(Err(e))) => Poll::Ready(Some(Err(e.into()))),
            Poll::Ready(None) => Poll::Ready(None),
            Poll::Pending => {
                if this.idle.as_mut().poll(cx).is_ready() {
                    Poll::Ready(Some(Err(timed_out("chunk", this.deadlines.idle))))
                } else {
                    Poll::Pending
                }
            }
        }
    }

    fn is_end_stream(&self) -> bool {
        self.inner.is_end_stream()
    }

    fn size_hint(&self) -> SizeHint {
        self.inner.size_hint()
    }
}
