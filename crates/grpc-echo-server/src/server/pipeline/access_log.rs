//! Structured access logging for unary and streaming calls.
//!
//! [`AccessLog`] emits exactly one event per call:
//!
//! - unary calls log when the rest of the chain returns;
//! - streaming calls log when the response stream ends, fails, or is dropped
//!   by the transport.
//!
//! A call abandoned before completion (client disconnect, or a stream cut off
//! by its deadline) is logged with the code the caller observes:
//! `DEADLINE_EXCEEDED` when its scope's deadline has passed, `CANCELLED`
//! otherwise.
//!
//! The logger is a pure observer: results flow through unchanged.

use super::{CallContext, Middleware, Next, PeerInfo, ResponseStream};
use crate::server::{
    streaming::LoggedStream,
    telemetry::{increment_calls, record_call_duration},
};
use futures::future::BoxFuture;
use grpc_echo_core::{Error, proto::EchoResponse};
use std::net::SocketAddr;
use tokio::time::Instant;
use tonic::{Code, Status};
use tonic_health::pb::HealthCheckResponse;

/// Middleware emitting one `tracing` event per call.
#[derive(Clone, Copy, Debug, Default)]
pub struct AccessLog;

impl<Req, Resp> Middleware<Req, Resp> for AccessLog
where
    Req: Send + 'static,
    Resp: Logged,
{
    fn call<'a>(
        &'a self,
        ctx: CallContext,
        req: Req,
        next: Next<'a, Req, Resp>,
    ) -> BoxFuture<'a, Result<Resp, Status>> {
        let record = CallRecord::new(&ctx);
        Box::pin(async move {
            match next.run(ctx, req).await {
                Ok(resp) => Ok(resp.attach(record)),
                Err(status) => {
                    record.emit(Some(&status));
                    Err(status)
                }
            }
        })
    }
}

/// Responses the access logger knows when to finish logging for.
pub trait Logged: Sized + Send + 'static {
    /// Takes ownership of the pending record for a successful call.
    fn attach(self, record: CallRecord) -> Self;
}

impl Logged for EchoResponse {
    fn attach(self, record: CallRecord) -> Self {
        record.emit(None);
        self
    }
}

impl Logged for HealthCheckResponse {
    fn attach(self, record: CallRecord) -> Self {
        record.emit(None);
        self
    }
}

impl<T: Send + 'static> Logged for ResponseStream<T> {
    fn attach(self, record: CallRecord) -> Self {
        Box::pin(LoggedStream::new(self, record))
    }
}

/// A pending access-log event.
///
/// Emitted explicitly with [`CallRecord::emit`]; if dropped first, the call
/// was abandoned and is logged as deadline-exceeded or cancelled.
#[derive(Debug)]
pub struct CallRecord {
    method: &'static str,
    peer: PeerInfo,
    started: Instant,
    deadline: Option<Instant>,
    emitted: bool,
}

impl CallRecord {
    pub fn new(ctx: &CallContext) -> Self {
        Self {
            method: ctx.method(),
            peer: ctx.peer(),
            started: Instant::now(),
            deadline: ctx.deadline(),
            emitted: false,
        }
    }

    /// Logs the outcome of the call; `None` means success.
    pub fn emit(mut self, status: Option<&Status>) {
        self.log(status);
        self.emitted = true;
    }

    fn log(&self, status: Option<&Status>) {
        let elapsed_ms = self.started.elapsed().as_secs_f64() * 1000.0;
        increment_calls();
        record_call_duration(elapsed_ms);

        let ip = fmt_addr(self.peer.remote);
        let local_ip = fmt_addr(self.peer.local);
        match status {
            None => tracing::debug!(
                method = self.method,
                code = ?Code::Ok,
                peer.ip = %ip,
                peer.local_ip = %local_ip,
                peer.auth = self.peer.auth,
                elapsed_ms,
                "gRPC call"
            ),
            Some(status) if is_server_fault(status.code()) => tracing::warn!(
                method = self.method,
                code = ?status.code(),
                error = status.message(),
                peer.ip = %ip,
                peer.local_ip = %local_ip,
                peer.auth = self.peer.auth,
                elapsed_ms,
                "gRPC call"
            ),
            Some(status) => tracing::debug!(
                method = self.method,
                code = ?status.code(),
                error = status.message(),
                peer.ip = %ip,
                peer.local_ip = %local_ip,
                peer.auth = self.peer.auth,
                elapsed_ms,
                "gRPC call"
            ),
        }
    }

    fn abandoned_status(&self) -> Status {
        if self.deadline.is_some_and(|d| Instant::now() >= d) {
            Status::deadline_exceeded("call deadline exceeded")
        } else {
            Error::Cancelled.into()
        }
    }
}

impl Drop for CallRecord {
    fn drop(&mut self) {
        if !self.emitted {
            let status = self.abandoned_status();
            self.log(Some(&status));
        }
    }
}

fn is_server_fault(code: Code) -> bool {
    matches!(
        code,
        Code::Internal | Code::Unknown | Code::DataLoss | Code::Unimplemented
    )
}

fn fmt_addr(addr: Option<SocketAddr>) -> String {
    addr.map_or_else(|| String::from("-"), |a| a.to_string())
}
