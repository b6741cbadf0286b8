//! The echo route.
//!
//! [`EchoService`] implements the generated `EchoService` trait. Each call
//! runs through `AccessLog -> CallRecorder -> EchoHandler`, so a response
//! carries all four lifecycle timestamps and every call leaves one access-log
//! event behind.

use crate::server::pipeline::{
    AccessLog, CallContext, CallRecorder, Chain, Handler, InFlight,
};
use core::future::Future;
use futures::future::BoxFuture;
use grpc_echo_core::{
    clock::{Clock, SystemClock},
    proto::{EchoRequest, EchoResponse, echo_service_server},
};
use std::collections::HashMap;
use tonic::{
    Request, Response, Status,
    metadata::{KeyAndValueRef, MetadataMap},
};

pub const ECHO_METHOD: &str = "/grpc_echo.v1.EchoService/Echo";

/// Builds the echo response from the call context and payload.
#[derive(Clone, Debug, Default)]
pub struct EchoHandler<C = SystemClock> {
    clock: C,
}

impl<C: Clock> EchoHandler<C> {
    pub const fn new(clock: C) -> Self {
        Self { clock }
    }

    fn respond(&self, ctx: &CallContext, req: EchoRequest) -> EchoResponse {
        EchoResponse {
            headers: collect_headers(ctx.metadata()),
            body: req.ping,
            remote_addr: ctx
                .peer()
                .remote
                .map(|addr| addr.ip().to_string())
                .unwrap_or_default(),
            ..Default::default()
        }
    }

    /// Runs `body` between the handler milestones.
    ///
    /// `handler_reached_at` is read before `body` starts and
    /// `handler_responded_at` once it completes with a response. A failed
    /// body leaves no timestamps.
    async fn timed<F>(&self, body: F) -> Result<EchoResponse, Status>
    where
        F: Future<Output = Result<EchoResponse, Status>>,
    {
        let reached_at = self.clock.now();
        let mut resp = body.await?;
        resp.stamp_handler_reached(reached_at);
        resp.stamp_handler_responded(self.clock.now());
        Ok(resp)
    }
}

impl<C: Clock> Handler<EchoRequest, EchoResponse> for EchoHandler<C> {
    fn call(&self, ctx: CallContext, req: EchoRequest) -> BoxFuture<'_, Result<EchoResponse, Status>> {
        Box::pin(self.timed(async move { Ok::<_, Status>(self.respond(&ctx, req)) }))
    }
}

/// Flattens request metadata into one string per key.
///
/// Repeated keys are joined with `,` in arrival order. Binary (`-bin`)
/// values are decoded and rendered as lossy UTF-8. HTTP/2 pseudo-headers
/// such as `:authority` never reach `MetadataMap`, so they are not echoed.
fn collect_headers(metadata: &MetadataMap) -> HashMap<String, String> {
    let mut headers: HashMap<String, String> = HashMap::with_capacity(metadata.keys_len());
    for entry in metadata.iter() {
        let (key, value) = match entry {
            KeyAndValueRef::Ascii(key, value) => (
                key.as_str(),
                match value.to_str() {
                    Ok(s) => s.to_string(),
                    Err(_) => String::from_utf8_lossy(value.as_encoded_bytes()).into_owned(),
                },
            ),
            KeyAndValueRef::Binary(key, value) => (
                key.as_str(),
                match value.to_bytes() {
                    Ok(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
                    Err(_) => String::from_utf8_lossy(value.as_encoded_bytes()).into_owned(),
                },
            ),
        };

        match headers.get_mut(key) {
            Some(joined) => {
                joined.push(',');
                joined.push_str(&value);
            }
            None => {
                headers.insert(key.to_string(), value);
            }
        }
    }
    headers
}

/// The tonic-facing echo service.
#[derive(Clone)]
pub struct EchoService {
    chain: Chain<EchoRequest, EchoResponse>,
    in_flight: InFlight,
}

impl EchoService {
    pub fn new(in_flight: InFlight) -> Self {
        Self::with_clock(SystemClock, in_flight)
    }

    /// Builds the route with a specific clock shared by the recorder and the
    /// handler.
    pub fn with_clock<C: Clock + Clone>(clock: C, in_flight: InFlight) -> Self {
        let chain = Chain::builder(EchoHandler::new(clock.clone()))
            .stage(AccessLog)
            .stage(CallRecorder::new(clock))
            .build();
        Self { chain, in_flight }
    }
}

#[tonic::async_trait]
impl echo_service_server::EchoService for EchoService {
    #[tracing::instrument(skip_all)]
    async fn echo(&self, req: Request<EchoRequest>) -> Result<Response<EchoResponse>, Status> {
        // Dropping the scope (including when the client goes away) cancels
        // the call.
        let (ctx, _scope) = CallContext::from_request(ECHO_METHOD, &req, &self.in_flight);
        let resp = self.chain.call(ctx, req.into_inner()).await?;
        Ok(Response::new(resp))
    }
}
