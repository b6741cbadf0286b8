use crate::server::{
    pipeline::{ResponseStream, access_log::CallRecord},
    telemetry::{decrement_streams_inflight, increment_streams_inflight},
};
use core::{
    pin::Pin,
    task::{Context, Poll},
};
use futures::Stream;
use tonic::Status;

/// Finishes a streaming call's access-log record when the stream completes.
///
/// The record is emitted on the first error or at end of stream. If the
/// transport drops the stream before either happens, the record logs the call
/// as abandoned.
pub struct LoggedStream<T> {
    inner: ResponseStream<T>,
    record: Option<CallRecord>,
}

impl<T> LoggedStream<T> {
    pub fn new(inner: ResponseStream<T>, record: CallRecord) -> Self {
        increment_streams_inflight();
        Self {
            inner,
            record: Some(record),
        }
    }
}

impl<T> Stream for LoggedStream<T> {
    type Item = Result<T, Status>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if this.record.is_none() {
            return Poll::Ready(None);
        }

        let polled = this.inner.as_mut().poll_next(cx);
        match &polled {
            Poll::Ready(Some(Err(status))) => {
                if let Some(record) = this.record.take() {
                    record.emit(Some(status));
                }
            }
            Poll::Ready(None) => {
                if let Some(record) = this.record.take() {
                    record.emit(None);
                }
            }
            _ => {}
        }
        polled
    }
}

impl<T> Drop for LoggedStream<T> {
    fn drop(&mut self) {
        decrement_streams_inflight();
    }
}
