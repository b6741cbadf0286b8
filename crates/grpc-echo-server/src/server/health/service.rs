//! `grpc.health.v1.Health` backed by the [`HealthRegistry`].
//!
//! Both methods run through the call pipeline:
//!
//! - `Check` - access logger, then a lookup. Names that were never set fail
//!   with `NOT_FOUND`.
//! - `Watch` - stream deadline, access logger, then a registry watch. Names
//!   that were never set report `SERVICE_UNKNOWN` and keep being watched.
//!   When the registry closes, the stream ends with `UNAVAILABLE`.

use super::HealthRegistry;
use crate::server::{
    pipeline::{AccessLog, CallContext, Chain, InFlight, ResponseStream, StreamDeadline},
    streaming::ScopedStream,
};
use core::time::Duration;
use futures::{StreamExt, stream};
use std::sync::Arc;
use tonic::{Request, Response, Status};
use tonic_health::{
    ServingStatus,
    pb::{HealthCheckRequest, HealthCheckResponse, health_check_response, health_server::Health},
};

pub const CHECK_METHOD: &str = "/grpc.health.v1.Health/Check";
pub const WATCH_METHOD: &str = "/grpc.health.v1.Health/Watch";

type CheckChain = Chain<HealthCheckRequest, HealthCheckResponse>;
type WatchChain = Chain<HealthCheckRequest, ResponseStream<HealthCheckResponse>>;

#[derive(Clone)]
pub struct HealthService {
    check: CheckChain,
    watch: WatchChain,
    in_flight: InFlight,
}

impl HealthService {
    /// Builds both method chains once. `stream_timeout` bounds `Watch`.
    pub fn new(
        registry: Arc<HealthRegistry>,
        stream_timeout: Option<Duration>,
        in_flight: InFlight,
    ) -> Self {
        let check_registry = Arc::clone(&registry);
        let check = Chain::builder(move |_ctx: CallContext, req: HealthCheckRequest| {
            let status = check_registry.check(&req.service);
            async move {
                match status {
                    Some(status) => Ok(response(Some(status))),
                    None => Err(Status::not_found(format!(
                        "unknown service {:?}",
                        req.service
                    ))),
                }
            }
        })
        .stage(AccessLog)
        .build();

        let watch = Chain::builder(move |ctx: CallContext, req: HealthCheckRequest| {
            let updates = watch_responses(&registry, &req.service);
            let cancelled = ctx.cancellation().clone().cancelled_owned();
            async move { Ok::<_, Status>(Box::pin(updates.take_until(cancelled)) as ResponseStream<_>) }
        })
        .stage(StreamDeadline::new(stream_timeout))
        .stage(AccessLog)
        .build();

        Self {
            check,
            watch,
            in_flight,
        }
    }
}

/// Registry updates as wire responses, ending in `UNAVAILABLE` once the
/// registry closes.
fn watch_responses(
    registry: &HealthRegistry,
    service: &str,
) -> impl futures::Stream<Item = Result<HealthCheckResponse, Status>> + Send + use<> {
    registry
        .watch(service)
        .map(|status| Ok(response(status)))
        .chain(stream::once(async {
            Err(Status::unavailable("health registry closed"))
        }))
}

/// `None` is a name nobody has set, reported as `SERVICE_UNKNOWN`.
fn response(status: Option<ServingStatus>) -> HealthCheckResponse {
    use health_check_response::ServingStatus as Wire;

    let wire = match status {
        Some(ServingStatus::Unknown) => Wire::Unknown,
        Some(ServingStatus::Serving) => Wire::Serving,
        Some(ServingStatus::NotServing) => Wire::NotServing,
        None => Wire::ServiceUnknown,
    };
    HealthCheckResponse {
        status: wire.into(),
    }
}

#[tonic::async_trait]
impl Health for HealthService {
    type WatchStream = ScopedStream<HealthCheckResponse>;

    #[tracing::instrument(skip_all, fields(service = %req.get_ref().service))]
    async fn check(
        &self,
        req: Request<HealthCheckRequest>,
    ) -> Result<Response<HealthCheckResponse>, Status> {
        let (ctx, _scope) = CallContext::from_request(CHECK_METHOD, &req, &self.in_flight);
        let resp = self.check.call(ctx, req.into_inner()).await?;
        Ok(Response::new(resp))
    }

    #[tracing::instrument(skip_all, fields(service = %req.get_ref().service))]
    async fn watch(
        &self,
        req: Request<HealthCheckRequest>,
    ) -> Result<Response<Self::WatchStream>, Status> {
        let (ctx, scope) = CallContext::from_request(WATCH_METHOD, &req, &self.in_flight);
        let stream = self.watch.call(ctx, req.into_inner()).await?;
        Ok(Response::new(ScopedStream::new(stream, scope)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::Instant;
    use tonic::Code;

    fn request(service: &str) -> Request<HealthCheckRequest> {
        Request::new(HealthCheckRequest {
            service: service.to_string(),
        })
    }

    fn status_of(resp: &HealthCheckResponse) -> health_check_response::ServingStatus {
        resp.status()
    }

    #[tokio::test]
    async fn check_reports_registered_status() {
        let registry = Arc::new(HealthRegistry::new());
        registry.set_status("", ServingStatus::Serving);
        let service = HealthService::new(Arc::clone(&registry), None, InFlight::default());

        let resp = service.check(request("")).await.unwrap().into_inner();
        assert_eq!(status_of(&resp), health_check_response::ServingStatus::Serving);

        let err = service.check(request("missing")).await.unwrap_err();
        assert_eq!(err.code(), Code::NotFound);
    }

    #[tokio::test]
    async fn watch_follows_status_changes() {
        let registry = Arc::new(HealthRegistry::new());
        let in_flight = InFlight::default();
        let service = HealthService::new(Arc::clone(&registry), None, in_flight.clone());

        let mut stream = service.watch(request("svc")).await.unwrap().into_inner();
        let first = stream.next().await.unwrap().unwrap();
        assert_eq!(
            status_of(&first),
            health_check_response::ServingStatus::ServiceUnknown
        );
        assert_eq!(in_flight.count(), 1);

        registry.set_status("svc", ServingStatus::NotServing);
        let next = stream.next().await.unwrap().unwrap();
        assert_eq!(
            status_of(&next),
            health_check_response::ServingStatus::NotServing
        );

        registry.close();
        let err = stream.next().await.unwrap().unwrap_err();
        assert_eq!(err.code(), Code::Unavailable);
        assert!(stream.next().await.is_none());

        drop(stream);
        assert_eq!(in_flight.count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn watch_is_cut_off_by_the_stream_deadline() {
        let registry = Arc::new(HealthRegistry::new());
        registry.set_status("", ServingStatus::Serving);
        let limit = Duration::from_millis(500);
        let service = HealthService::new(registry, Some(limit), InFlight::default());

        let start = Instant::now();
        let mut stream = service.watch(request("")).await.unwrap().into_inner();
        let first = stream.next().await.unwrap().unwrap();
        assert_eq!(status_of(&first), health_check_response::ServingStatus::Serving);

        let err = stream.next().await.unwrap().unwrap_err();
        assert_eq!(err.code(), Code::DeadlineExceeded);
        assert!(Instant::now() - start < limit + Duration::from_millis(100));
        assert!(stream.next().await.is_none());
    }
}
