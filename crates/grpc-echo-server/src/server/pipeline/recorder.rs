//! Arrival and departure stamping for unary calls.

use super::{CallContext, Middleware, Next};
use futures::future::BoxFuture;
use grpc_echo_core::{
    clock::{Clock, SystemClock},
    types::Timestamped,
};
use tonic::Status;

/// Records when a call entered the pipeline and when its response left it.
///
/// The arrival time is read before the rest of the chain runs and the
/// departure time after it returns; both are written into the response only
/// if the call succeeded. Errors are returned untouched.
#[derive(Clone, Debug, Default)]
pub struct CallRecorder<C = SystemClock> {
    clock: C,
}

impl<C: Clock> CallRecorder<C> {
    pub const fn new(clock: C) -> Self {
        Self { clock }
    }
}

impl<Req, Resp, C> Middleware<Req, Resp> for CallRecorder<C>
where
    Req: Send + 'static,
    Resp: Timestamped + Send + 'static,
    C: Clock,
{
    fn call<'a>(
        &'a self,
        ctx: CallContext,
        req: Req,
        next: Next<'a, Req, Resp>,
    ) -> BoxFuture<'a, Result<Resp, Status>> {
        Box::pin(async move {
            let received_at = self.clock.now();
            let mut resp = next.run(ctx, req).await?;
            resp.stamp_received(received_at);
            resp.stamp_sent(self.clock.now());
            Ok(resp)
        })
    }
}
