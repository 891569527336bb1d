use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use futures::Stream;
use pin_project_lite::pin_project;
use tokio::time::{Instant, Sleep};

use quill_core::errors::ModelError;
use quill_core::stream::{TokenEvent, TokenStream};

pin_project! {
    /// Ends a token stream with `ModelError::Timeout` when no item arrives
    /// within `idle` of the previous one (or of the start).
    ///
    /// Also enforces the stream contract: nothing is yielded after a final
    /// event or an error, and an inner stream that ends without a final event
    /// yields one `Unavailable` error.
    pub struct IdleTimeout<S> {
        #[pin]
        inner: S,
        #[pin]
        deadline: Sleep,
        idle: Duration,
        done: bool,
    }
}

impl<S> IdleTimeout<S> {
    pub fn new(inner: S, idle: Duration) -> Self {
        Self {
            inner,
            deadline: tokio::time::sleep(idle),
            idle,
            done: false,
        }
    }
}

impl<S> Stream for IdleTimeout<S>
where
    S: Stream<Item = Result<TokenEvent, ModelError>>,
{
    type Item = Result<TokenEvent, ModelError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let mut this = self.project();
        if *this.done {
            return Poll::Ready(None);
        }

        match this.inner.as_mut().poll_next(cx) {
            Poll::Ready(Some(item)) => {
                this.deadline.as_mut().reset(Instant::now() + *this.idle);
                match &item {
                    Ok(event) if !event.is_final => {}
                    _ => *this.done = true,
                }
                Poll::Ready(Some(item))
            }
            Poll::Ready(None) => {
                *this.done = true;
                Poll::Ready(Some(Err(ModelError::Unavailable(
                    "stream ended before the final event".into(),
                ))))
            }
            Poll::Pending => {
                if this.deadline.as_mut().poll(cx).is_ready() {
                    *this.done = true;
                    return Poll::Ready(Some(Err(ModelError::Timeout(*this.idle))));
                }
                Poll::Pending
            }
        }
    }
}

/// Box `stream` behind an idle timeout.
pub fn with_idle_timeout<S>(stream: S, idle: Duration) -> TokenStream
where
    S: Stream<Item = Result<TokenEvent, ModelError>> + Send + 'static,
{
    Box::pin(IdleTimeout::new(stream, idle))
}
