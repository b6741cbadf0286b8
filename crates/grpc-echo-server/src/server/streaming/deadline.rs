use crate::server::{pipeline::ResponseStream, telemetry::increment_stream_deadlines};
use core::{
    pin::Pin,
    task::{Context, Poll},
    time::Duration,
};
use futures::Stream;
use grpc_echo_core::Error;
use tokio::time::{Instant, Sleep, sleep_until};
use tokio_util::sync::CancellationToken;
use tonic::Status;

/// A response stream that fails with `DEADLINE_EXCEEDED` once `deadline`
/// passes.
///
/// The deadline is checked before the inner stream on every poll, so an
/// expired stream never yields another item. On expiry the inner stream is
/// dropped and `token` is cancelled; dropping the adapter cancels `token` as
/// well.
pub struct DeadlineStream<T> {
    inner: Option<ResponseStream<T>>,
    sleep: Pin<Box<Sleep>>,
    limit: Duration,
    token: CancellationToken,
}

impl<T> DeadlineStream<T> {
    pub fn new(
        inner: ResponseStream<T>,
        deadline: Instant,
        limit: Duration,
        token: CancellationToken,
    ) -> Self {
        Self {
            inner: Some(inner),
            sleep: Box::pin(sleep_until(deadline)),
            limit,
            token,
        }
    }
}

impl<T> Stream for DeadlineStream<T> {
    type Item = Result<T, Status>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        let Some(inner) = this.inner.as_mut() else {
            return Poll::Ready(None);
        };

        if this.sleep.as_mut().poll(cx).is_ready() {
            this.token.cancel();
            // Dropping the handler's stream first lets inner stages observe
            // the expired scope.
            this.inner = None;
            increment_stream_deadlines();
            tracing::debug!(limit = ?this.limit, "stream deadline exceeded");
            return Poll::Ready(Some(Err(Error::DeadlineExceeded { limit: this.limit }.into())));
        }

        match inner.as_mut().poll_next(cx) {
            Poll::Ready(None) => {
                this.inner = None;
                Poll::Ready(None)
            }
            other => other,
        }
    }
}

impl<T> Drop for DeadlineStream<T> {
    fn drop(&mut self) {
        self.token.cancel();
    }
}
