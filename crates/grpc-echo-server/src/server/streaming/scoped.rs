use crate::server::pipeline::{CallScope, ResponseStream};
use core::{
    pin::Pin,
    task::{Context, Poll},
};
use futures::Stream;
use tonic::Status;

/// Ties a call's [`CallScope`] to the response stream handed to the
/// transport.
///
/// The scope is released when the transport drops the stream, which cancels
/// every stage still observing the call.
pub struct ScopedStream<T> {
    inner: ResponseStream<T>,
    _scope: CallScope,
}

impl<T> ScopedStream<T> {
    pub fn new(inner: ResponseStream<T>, scope: CallScope) -> Self {
        Self {
            inner,
            _scope: scope,
        }
    }
}

impl<T> Stream for ScopedStream<T> {
    type Item = Result<T, Status>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.get_mut().inner.as_mut().poll_next(cx)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.inner.size_hint()
    }
}
