//! Bounded lifetime for server-streaming calls.

use super::{CallContext, Middleware, Next, ResponseStream};
use crate::server::{streaming::DeadlineStream, telemetry::increment_stream_deadlines};
use core::time::Duration;
use futures::future::BoxFuture;
use grpc_echo_core::Error;
use tokio::time::{Instant, sleep_until};
use tonic::Status;

/// Cuts streaming calls off after a fixed duration.
///
/// With no limit (or a zero limit) the stage is a pass-through. Otherwise the
/// rest of the chain runs in a child scope of the call whose deadline is
/// `limit` from stream start:
///
/// - if the handler is still setting up the stream when the deadline passes,
///   the call fails with `DEADLINE_EXCEEDED`;
/// - once the stream is live, the first poll after the deadline yields
///   `DEADLINE_EXCEEDED`, drops the handler's stream and cancels the child
///   scope.
///
/// The timer lives inside the returned stream, so it is released as soon as
/// the stream ends for any reason.
#[derive(Clone, Copy, Debug, Default)]
pub struct StreamDeadline {
    limit: Option<Duration>,
}

impl StreamDeadline {
    pub fn new(limit: Option<Duration>) -> Self {
        Self {
            limit: limit.filter(|d| !d.is_zero()),
        }
    }
}

impl<Req, T> Middleware<Req, ResponseStream<T>> for StreamDeadline
where
    Req: Send + 'static,
    T: Send + 'static,
{
    fn call<'a>(
        &'a self,
        ctx: CallContext,
        req: Req,
        next: Next<'a, Req, ResponseStream<T>>,
    ) -> BoxFuture<'a, Result<ResponseStream<T>, Status>> {
        let Some(limit) = self.limit else {
            return next.run(ctx, req);
        };

        Box::pin(async move {
            let scope = ctx.child(Instant::now() + limit);
            let deadline = scope.deadline().unwrap_or_else(|| Instant::now() + limit);
            // Cancels the child scope on every path that does not hand it
            // over to the stream.
            let guard = scope.cancellation().clone().drop_guard();

            let stream = tokio::select! {
                res = next.run(scope, req) => res?,
                () = sleep_until(deadline) => {
                    increment_stream_deadlines();
                    tracing::debug!(?limit, "stream deadline passed during setup");
                    return Err(Error::DeadlineExceeded { limit }.into());
                }
            };

            let token = guard.disarm();
            Ok(Box::pin(DeadlineStream::new(stream, deadline, limit, token)) as ResponseStream<T>)
        })
    }
}
