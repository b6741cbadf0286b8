//! Per-call state shared by every pipeline stage.

use portable_atomic::{AtomicUsize, Ordering};
use std::{net::SocketAddr, sync::Arc};
use tokio::time::Instant;
use tokio_util::sync::{CancellationToken, DropGuard};
use tonic::{
    Request,
    metadata::MetadataMap,
    transport::server::{TcpConnectInfo, TlsConnectInfo},
};

/// Transport-level facts about the caller.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PeerInfo {
    pub remote: Option<SocketAddr>,
    pub local: Option<SocketAddr>,
    /// Whether the connection carries transport authentication (TLS).
    pub auth: bool,
}

impl PeerInfo {
    fn from_request<T>(request: &Request<T>) -> Self {
        Self {
            remote: request.remote_addr(),
            local: request.local_addr(),
            auth: request
                .extensions()
                .get::<TlsConnectInfo<TcpConnectInfo>>()
                .is_some(),
        }
    }
}

/// Ambient state of a single call.
///
/// Created once per call by the service entry point and handed by value down
/// the middleware chain. Stages that narrow the call's lifetime (see
/// [`CallContext::child`]) pass a derived context to the next stage; the
/// original stays untouched.
#[derive(Clone, Debug)]
pub struct CallContext {
    method: &'static str,
    metadata: MetadataMap,
    peer: PeerInfo,
    token: CancellationToken,
    deadline: Option<Instant>,
}

impl CallContext {
    /// Captures the context of an inbound request.
    ///
    /// The returned [`CallScope`] owns the call's cancellation: when it is
    /// dropped, every stage observing [`CallContext::cancellation`] is
    /// cancelled. Service entry points keep it alive for as long as the
    /// transport keeps the call open.
    pub fn from_request<T>(
        method: &'static str,
        request: &Request<T>,
        in_flight: &InFlight,
    ) -> (Self, CallScope) {
        let ctx = Self::new(
            method,
            request.metadata().clone(),
            PeerInfo::from_request(request),
        );
        let scope = CallScope {
            _cancel: ctx.token.clone().drop_guard(),
            _in_flight: in_flight.enter(),
        };
        (ctx, scope)
    }

    /// Builds a context without a transport, for driving chains directly.
    pub fn new(method: &'static str, metadata: MetadataMap, peer: PeerInfo) -> Self {
        Self {
            method,
            metadata,
            peer,
            token: CancellationToken::new(),
            deadline: None,
        }
    }

    /// Derives a child scope that ends no later than `deadline`.
    ///
    /// Cancelling the child leaves this context running; cancelling this
    /// context cancels the child.
    pub fn child(&self, deadline: Instant) -> Self {
        let deadline = match self.deadline {
            Some(current) => current.min(deadline),
            None => deadline,
        };
        Self {
            method: self.method,
            metadata: self.metadata.clone(),
            peer: self.peer,
            token: self.token.child_token(),
            deadline: Some(deadline),
        }
    }

    pub fn method(&self) -> &'static str {
        self.method
    }

    pub fn metadata(&self) -> &MetadataMap {
        &self.metadata
    }

    pub fn peer(&self) -> PeerInfo {
        self.peer
    }

    /// The call's cancellation scope.
    pub fn cancellation(&self) -> &CancellationToken {
        &self.token
    }

    /// The instant after which the call must not make progress, if bounded.
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }
}

/// Keeps a call's cancellation scope and in-flight registration alive.
///
/// Dropping it cancels the call's token and releases the in-flight slot.
#[derive(Debug)]
pub struct CallScope {
    _cancel: DropGuard,
    _in_flight: InFlightGuard,
}

/// Counts calls currently being served.
///
/// Cloned into every service; the lifecycle manager reads it when reporting a
/// degraded shutdown.
#[derive(Clone, Debug, Default)]
pub struct InFlight(Arc<AtomicUsize>);

impl InFlight {
    pub fn enter(&self) -> InFlightGuard {
        self.0.fetch_add(1, Ordering::AcqRel);
        InFlightGuard(Arc::clone(&self.0))
    }

    pub fn count(&self) -> usize {
        self.0.load(Ordering::Acquire)
    }
}

#[derive(Debug)]
pub struct InFlightGuard(Arc<AtomicUsize>);

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}
