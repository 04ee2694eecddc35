//! Idle timeout wrapper for socket read halves.
//!
//! A socket that stops delivering frames without closing (half-open TCP,
//! silently dropped NAT mapping) would otherwise never surface an error.

use futures::Stream;
use std::{
    future::Future,
    pin::Pin,
    task::{Context, Poll},
    time::Duration,
};
use tokio::time::{Instant, Sleep};

/// Ends the wrapped stream when no item arrives within `idle`.
///
/// The deadline resets on every item. After a timeout the stream yields
/// `None` and [`IdleTimeout::timed_out`] reports `true`.
#[derive(Debug)]
pub struct IdleTimeout<S> {
    inner: S,
    idle: Duration,
    deadline: Pin<Box<Sleep>>,
    timed_out: bool,
}

impl<S> IdleTimeout<S> {
    pub fn new(inner: S, idle: Duration) -> Self {
        Self {
            inner,
            idle,
            deadline: Box::pin(tokio::time::sleep(idle)),
            timed_out: false,
        }
    }

    pub fn timed_out(&self) -> bool {
        self.timed_out
    }
}

impl<S> Stream for IdleTimeout<S>
where
    S: Stream + Unpin,
{
    type Item = S::Item;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if self.timed_out {
            return Poll::Ready(None);
        }

        let idle = self.idle;
        match Pin::new(&mut self.inner).poll_next(cx) {
            Poll::Ready(Some(item)) => {
                self.deadline.as_mut().reset(Instant::now() + idle);
                Poll::Ready(Some(item))
            }
            Poll::Ready(None) => Poll::Ready(None),
            Poll::Pending => match self.deadline.as_mut().poll(cx) {
                Poll::Ready(()) => {
                    tracing::warn!(
                        idle_secs = idle.as_secs(),
                        "stream idle timeout, nothing received"
                    );
                    self.timed_out = true;
                    Poll::Ready(None)
                }
                Poll::Pending => Poll::Pending,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    #[tokio::test]
    async fn test_idle_stream_ends_with_timeout() {
        let mut stream = IdleTimeout::new(futures::stream::pending::<u8>(), Duration::from_millis(20));

        assert_eq!(stream.next().await, None);
        assert!(stream.timed_out());
        assert_eq!(stream.next().await, None);
    }

    #[tokio::test]
    async fn test_active_stream_passes_items_through() {
        let inner = futures::stream::iter(vec![1, 2, 3]);
        let mut stream = IdleTimeout::new(inner, Duration::from_secs(5));

        let items: Vec<_> = (&mut stream).collect().await;

        assert_eq!(items, vec![1, 2, 3]);
        assert!(!stream.timed_out());
    }
}
