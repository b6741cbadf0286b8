//! Call pipeline: ordered middleware stages in front of a handler.
//!
//! A [`Chain`] is built once per route at startup. Each call walks the chain
//! through a borrowed [`Next`] invoker, so composing stages costs nothing per
//! call beyond the stages' own futures.
//!
//! Stages are statically typed per route. A stage that only understands some
//! response shapes (for example [`CallRecorder`], which needs
//! [`Timestamped`](grpc_echo_core::types::Timestamped) responses, or
//! [`StreamDeadline`], which needs a [`ResponseStream`]) simply does not
//! implement [`Middleware`] for other routes, and cannot be added to them.
//!
//! ## Structure
//!
//! - [`context`] - [`CallContext`], the per-call state handed down the chain.
//! - [`access_log`] - one structured log event per call or stream.
//! - [`recorder`] - `received_at` / `sent_at` stamping for unary calls.
//! - [`deadline`] - bounded lifetime for streaming calls.

pub mod access_log;
pub mod context;
pub mod deadline;
pub mod recorder;

pub use access_log::AccessLog;
pub use context::{CallContext, CallScope, InFlight, PeerInfo};
pub use deadline::StreamDeadline;
pub use recorder::CallRecorder;

use core::{future::Future, pin::Pin};
use futures::{Stream, future::BoxFuture};
use std::sync::Arc;
use tonic::Status;

/// Response type of server-streaming routes.
pub type ResponseStream<T> = Pin<Box<dyn Stream<Item = Result<T, Status>> + Send + 'static>>;

/// The terminal stage of a chain.
pub trait Handler<Req, Resp>: Send + Sync + 'static {
    fn call(&self, ctx: CallContext, req: Req) -> BoxFuture<'_, Result<Resp, Status>>;
}

impl<Req, Resp, F, Fut> Handler<Req, Resp> for F
where
    F: Fn(CallContext, Req) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Resp, Status>> + Send + 'static,
{
    fn call(&self, ctx: CallContext, req: Req) -> BoxFuture<'_, Result<Resp, Status>> {
        Box::pin(self(ctx, req))
    }
}

/// A stage that may act before and after the rest of the chain.
///
/// Implementations call [`Next::run`] at most once to continue the call and
/// may inspect or annotate its result.
pub trait Middleware<Req, Resp>: Send + Sync + 'static {
    fn call<'a>(
        &'a self,
        ctx: CallContext,
        req: Req,
        next: Next<'a, Req, Resp>,
    ) -> BoxFuture<'a, Result<Resp, Status>>;
}

/// Invoker for the remainder of a chain.
pub struct Next<'a, Req, Resp> {
    stages: &'a [Arc<dyn Middleware<Req, Resp>>],
    handler: &'a dyn Handler<Req, Resp>,
}

impl<'a, Req, Resp> Next<'a, Req, Resp>
where
    Req: 'static,
    Resp: 'static,
{
    /// Runs the next stage, or the handler once all stages have run.
    pub fn run(self, ctx: CallContext, req: Req) -> BoxFuture<'a, Result<Resp, Status>> {
        match self.stages.split_first() {
            Some((stage, rest)) => stage.call(
                ctx,
                req,
                Next {
                    stages: rest,
                    handler: self.handler,
                },
            ),
            None => self.handler.call(ctx, req),
        }
    }
}

/// An ordered list of stages in front of a handler.
///
/// Stages run in the order they were added: the first added is the
/// outermost.
pub struct Chain<Req, Resp> {
    stages: Arc<[Arc<dyn Middleware<Req, Resp>>]>,
    handler: Arc<dyn Handler<Req, Resp>>,
}

impl<Req, Resp> Clone for Chain<Req, Resp> {
    fn clone(&self) -> Self {
        Self {
            stages: Arc::clone(&self.stages),
            handler: Arc::clone(&self.handler),
        }
    }
}

impl<Req, Resp> Chain<Req, Resp>
where
    Req: 'static,
    Resp: 'static,
{
    pub fn builder(handler: impl Handler<Req, Resp>) -> ChainBuilder<Req, Resp> {
        ChainBuilder {
            stages: Vec::new(),
            handler: Arc::new(handler),
        }
    }

    /// Runs a call through every stage and the handler.
    pub fn call(&self, ctx: CallContext, req: Req) -> BoxFuture<'_, Result<Resp, Status>> {
        Next {
            stages: &self.stages,
            handler: &*self.handler,
        }
        .run(ctx, req)
    }
}

pub struct ChainBuilder<Req, Resp> {
    stages: Vec<Arc<dyn Middleware<Req, Resp>>>,
    handler: Arc<dyn Handler<Req, Resp>>,
}

impl<Req, Resp> ChainBuilder<Req, Resp> {
    /// Appends a stage inside the ones already added.
    #[must_use]
    pub fn stage(mut self, stage: impl Middleware<Req, Resp>) -> Self {
        self.stages.push(Arc::new(stage));
        self
    }

    pub fn build(self) -> Chain<Req, Resp> {
        Chain {
            stages: self.stages.into(),
            handler: self.handler,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use tonic::{Code, metadata::MetadataMap};

    struct Trace {
        name: &'static str,
        events: Arc<Mutex<Vec<String>>>,
    }

    impl Middleware<u32, u32> for Trace {
        fn call<'a>(
            &'a self,
            ctx: CallContext,
            req: u32,
            next: Next<'a, u32, u32>,
        ) -> BoxFuture<'a, Result<u32, Status>> {
            Box::pin(async move {
                self.events.lock().push(format!("{} before", self.name));
                let res = next.run(ctx, req + 1).await;
                self.events.lock().push(format!("{} after", self.name));
                res.map(|v| v * 10)
            })
        }
    }

    fn ctx() -> CallContext {
        CallContext::new("/test/Call", MetadataMap::new(), PeerInfo::default())
    }

    #[tokio::test]
    async fn stages_run_outermost_first() {
        let events = Arc::new(Mutex::new(Vec::new()));
        let handler_events = Arc::clone(&events);
        let chain = Chain::builder(move |_ctx: CallContext, req: u32| {
            handler_events.lock().push(format!("handler {req}"));
            async move { Ok::<_, Status>(req) }
        })
        .stage(Trace {
            name: "outer",
            events: Arc::clone(&events),
        })
        .stage(Trace {
            name: "inner",
            events: Arc::clone(&events),
        })
        .build();

        let res = chain.call(ctx(), 1).await.unwrap();
        assert_eq!(res, 300);
        assert_eq!(
            *events.lock(),
            [
                "outer before",
                "inner before",
                "handler 3",
                "inner after",
                "outer after"
            ]
        );
    }

    #[tokio::test]
    async fn empty_chain_calls_the_handler() {
        let chain = Chain::builder(|_ctx: CallContext, req: u32| async move {
            Err::<u32, _>(Status::not_found(format!("{req}")))
        })
        .build();

        let err = chain.call(ctx(), 7).await.unwrap_err();
        assert_eq!(err.code(), Code::NotFound);
        assert_eq!(err.message(), "7");
    }

    #[tokio::test]
    async fn chains_are_reusable_across_calls() {
        let chain =
            Chain::builder(|_ctx: CallContext, req: u32| async move { Ok::<_, Status>(req) })
                .build();
        let cloned = chain.clone();
        let (a, b) = tokio::join!(chain.call(ctx(), 1), cloned.call(ctx(), 2));
        assert_eq!((a.unwrap(), b.unwrap()), (1, 2));
    }
}
