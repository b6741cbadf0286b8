//! Server lifecycle: bind, serve, drain, stop.
//!
//! ```text
//! Idle -> Binding -> Serving -> Draining -> Stopped
//! ```
//!
//! Every transition is published on a `watch` channel (see
//! [`EchoServer::state`]). Health statuses follow the lifecycle: both the
//! overall status (`""`) and the echo service become serving once the
//! listener is up, and not-serving as soon as shutdown is requested, before
//! the listener stops accepting.
//!
//! Serving runs two futures joined with first-error-wins semantics: the
//! accept loop and the shutdown watcher. The watcher starts the drain when
//! the shutdown token is cancelled and gives in-flight calls
//! `shutdown_timeout` to finish. If they don't, the accept loop is dropped
//! and [`Error::DrainTimeout`] is returned.

use crate::server::{
    config::ServerConfig,
    health::{HealthRegistry, HealthService},
    pipeline::InFlight,
    service::EchoService,
};
use grpc_echo_core::{
    Error, Result,
    proto::{FILE_DESCRIPTOR_SET, echo_service_server::EchoServiceServer},
    types::{ECHO_SERVICE_NAME, OVERALL_HEALTH},
};
use socket2::{Domain, Protocol, Socket, Type};
use std::{
    io,
    net::{Ipv4Addr, Ipv6Addr, SocketAddr},
    sync::Arc,
};
use tokio::{net::TcpListener, sync::watch, time::timeout};
use tokio_stream::wrappers::TcpListenerStream;
use tokio_util::sync::CancellationToken;
use tonic::{
    codec::CompressionEncoding,
    transport::{Identity, Server, ServerTlsConfig},
};
use tonic_health::{ServingStatus, pb::health_server::HealthServer};
use tonic_reflection::server::Builder as ReflectionBuilder;
use tonic_web::GrpcWebLayer;
use tower::ServiceBuilder;
use tower_http::cors::{Any, CorsLayer};

/// Health keys tracking the lifecycle.
const HEALTH_KEYS: [&str; 2] = [OVERALL_HEALTH, ECHO_SERVICE_NAME];

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ServerState {
    Idle,
    Binding,
    Serving,
    Draining,
    Stopped,
}

pub struct EchoServer {
    config: ServerConfig,
    health: Arc<HealthRegistry>,
    in_flight: InFlight,
    state: watch::Sender<ServerState>,
}

impl EchoServer {
    pub fn new(config: ServerConfig) -> Self {
        let (state, _) = watch::channel(ServerState::Idle);
        Self {
            config,
            health: Arc::new(HealthRegistry::new()),
            in_flight: InFlight::default(),
            state,
        }
    }

    pub fn health(&self) -> Arc<HealthRegistry> {
        Arc::clone(&self.health)
    }

    /// Subscribes to lifecycle transitions.
    pub fn state(&self) -> watch::Receiver<ServerState> {
        self.state.subscribe()
    }

    /// Binds and serves until `shutdown` is cancelled.
    pub async fn run(self, shutdown: CancellationToken) -> Result<()> {
        let listener = self.bind().await?;
        self.serve(listener, shutdown).await
    }

    /// Opens the listener on the configured address.
    ///
    /// The IPv6 wildcard (`[::]`, what `:port` expands to) listens on every
    /// interface of both families.
    pub async fn bind(&self) -> Result<TcpListener> {
        self.state.send_replace(ServerState::Binding);
        let addr = self.config.addr.as_str();
        let bound = match addr.parse::<SocketAddr>() {
            Ok(wildcard) if wildcard.ip() == Ipv6Addr::UNSPECIFIED => bind_any(wildcard.port()),
            _ => TcpListener::bind(addr).await,
        };
        bound.map_err(|source| Error::Bind {
            addr: addr.to_string(),
            source,
        })
    }

    /// Serves on `listener` until `shutdown` is cancelled and the drain ends.
    ///
    /// # Errors
    ///
    /// - [`Error::Tls`] if the TLS material is rejected.
    /// - [`Error::Transport`] if the accept loop fails.
    /// - [`Error::DrainTimeout`] if in-flight calls outlive the grace period.
    pub async fn serve(self, listener: TcpListener, shutdown: CancellationToken) -> Result<()> {
        let local_addr = listener.local_addr().ok();
        let result = self.serve_inner(listener, shutdown).await;

        self.health.close();
        self.state.send_replace(ServerState::Stopped);
        match &result {
            Ok(()) => tracing::info!(addr = ?local_addr, "server stopped"),
            Err(e) => tracing::error!(addr = ?local_addr, error = %e, "server stopped with error"),
        }
        result
    }

    async fn serve_inner(&self, listener: TcpListener, shutdown: CancellationToken) -> Result<()> {
        let local_addr = listener.local_addr().ok();
        let max_message_size = self.config.max_message_size;

        let echo = EchoServiceServer::new(EchoService::new(self.in_flight.clone()))
            .max_decoding_message_size(max_message_size)
            .max_encoding_message_size(max_message_size)
            .send_compressed(CompressionEncoding::Zstd)
            .send_compressed(CompressionEncoding::Gzip)
            .send_compressed(CompressionEncoding::Deflate)
            .accept_compressed(CompressionEncoding::Zstd)
            .accept_compressed(CompressionEncoding::Gzip)
            .accept_compressed(CompressionEncoding::Deflate);

        let health = HealthServer::new(HealthService::new(
            self.health(),
            self.config.stream_timeout,
            self.in_flight.clone(),
        ))
        .max_decoding_message_size(max_message_size)
        .max_encoding_message_size(max_message_size);

        let reflection = ReflectionBuilder::configure()
            .register_encoded_file_descriptor_set(FILE_DESCRIPTOR_SET)
            .register_encoded_file_descriptor_set(tonic_health::pb::FILE_DESCRIPTOR_SET)
            .build_v1()
            .map_err(|e| Error::Internal {
                context: format!("reflection service: {e}"),
            })?;

        let router = self
            .transport()?
            .layer(
                ServiceBuilder::new()
                    .layer(
                        CorsLayer::new()
                            .allow_origin(Any)
                            .allow_methods(Any)
                            .allow_headers(Any),
                    )
                    .layer(GrpcWebLayer::new()),
            )
            .add_service(health)
            .add_service(reflection)
            .add_service(echo);

        for key in HEALTH_KEYS {
            self.health.set_status(key, ServingStatus::Serving);
        }
        self.state.send_replace(ServerState::Serving);
        if cfg!(debug_assertions) {
            tracing::info!(addr = ?local_addr, config = ?self.config, "serving");
        } else {
            tracing::info!(addr = ?local_addr, tls = self.config.tls.is_some(), "serving");
        }

        // `drain` stops the accept loop; `stopped` fires once it has returned.
        let drain = CancellationToken::new();
        let stopped = CancellationToken::new();

        let accept = {
            let drain = drain.clone();
            let stopped = stopped.clone().drop_guard();
            async move {
                let _stopped = stopped;
                router
                    .serve_with_incoming_shutdown(
                        TcpListenerStream::new(listener),
                        drain.cancelled_owned(),
                    )
                    .await
                    .map_err(Error::from)
            }
        };

        let watcher = async {
            tokio::select! {
                () = shutdown.cancelled() => {}
                // The accept loop ended on its own; its result decides.
                () = stopped.cancelled() => return Ok(()),
            }

            self.begin_drain();
            drain.cancel();

            let grace = self.config.shutdown_timeout;
            match timeout(grace, stopped.cancelled()).await {
                Ok(()) => {
                    tracing::info!("drain complete");
                    Ok(())
                }
                Err(_) => {
                    let in_flight = self.in_flight.count();
                    tracing::warn!(?grace, in_flight, "degraded shutdown: drain timed out");
                    Err(Error::DrainTimeout { grace, in_flight })
                }
            }
        };

        tokio::try_join!(accept, watcher).map(|_| ())
    }

    /// Flips health to not-serving, then ends health watches so their
    /// connections can close.
    fn begin_drain(&self) {
        for key in HEALTH_KEYS {
            self.health.set_status(key, ServingStatus::NotServing);
        }
        self.state.send_replace(ServerState::Draining);
        tracing::info!(in_flight = self.in_flight.count(), "shutdown requested, draining");
        self.health.close();
    }

    /// The transport with connection limits and TLS applied.
    fn transport(&self) -> Result<Server> {
        let config = &self.config;
        let adaptive_window = config.initial_stream_window_size.is_none()
            && config.initial_connection_window_size.is_none();

        let mut server = Server::builder()
            .accept_http1(true)
            .http2_adaptive_window(Some(adaptive_window))
            .initial_stream_window_size(config.initial_stream_window_size)
            .initial_connection_window_size(config.initial_connection_window_size)
            .max_concurrent_streams(config.max_concurrent_streams)
            .http2_max_header_list_size(config.max_header_list_size)
            .http2_keepalive_interval(config.keepalive_interval)
            .http2_keepalive_timeout(Some(config.keepalive_timeout));

        if let Some(age) = config.max_connection_age {
            server = server.max_connection_age(age);
        }

        if let Some(tls) = &config.tls {
            let identity = Identity::from_pem(&tls.cert, &tls.key);
            server = server
                .tls_config(ServerTlsConfig::new().identity(identity))
                .map_err(|e| Error::Tls {
                    reason: e.to_string(),
                })?;
        }

        Ok(server)
    }
}

/// Listens on `port` on every interface: dual-stack IPv6 regardless of the
/// host's `bindv6only` default, or IPv4 alone where IPv6 is unavailable.
fn bind_any(port: u16) -> io::Result<TcpListener> {
    match bind_socket(SocketAddr::from((Ipv6Addr::UNSPECIFIED, port))) {
        Err(e) if e.kind() != io::ErrorKind::AddrInUse => {
            tracing::debug!(error = %e, "IPv6 unavailable, listening on IPv4 only");
            bind_socket(SocketAddr::from((Ipv4Addr::UNSPECIFIED, port)))
        }
        bound => bound,
    }
}

fn bind_socket(addr: SocketAddr) -> io::Result<TcpListener> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    if addr.is_ipv6() {
        socket.set_only_v6(false)?;
    }
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(1024)?;
    TcpListener::from_std(socket.into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::time::Duration;
    use futures::StreamExt;
    use grpc_echo_core::proto::{EchoRequest, EchoResponse, echo_service_client::EchoServiceClient};
    use std::time::SystemTime;
    use tokio::{task::JoinHandle, time::Instant};
    use tonic::{
        Code,
        client::Grpc,
        codegen::http::uri::PathAndQuery,
        transport::{Channel, Endpoint},
    };
    use tonic_prost::ProstCodec;
    use tonic_health::pb::{
        HealthCheckRequest, health_check_response::ServingStatus as Wire,
        health_client::HealthClient,
    };

    /// How close to the client's send time every server timestamp must be.
    const MILESTONE_WINDOW: Duration = Duration::from_millis(10);

    struct Running {
        addr: SocketAddr,
        health: Arc<HealthRegistry>,
        state: watch::Receiver<ServerState>,
        shutdown: CancellationToken,
        task: JoinHandle<Result<()>>,
    }

    impl Running {
        async fn channel(&self) -> Channel {
            Channel::from_shared(format!("http://{}", self.addr))
                .unwrap()
                .connect()
                .await
                .unwrap()
        }
    }

    fn local_config() -> ServerConfig {
        ServerConfig {
            addr: "127.0.0.1:0".to_string(),
            ..ServerConfig::default()
        }
    }

    async fn start(config: ServerConfig) -> Running {
        let server = EchoServer::new(config);
        let health = server.health();
        let mut state = server.state();
        assert_eq!(health.check(OVERALL_HEALTH), None, "not serving before bind");

        let listener = server.bind().await.unwrap();
        let addr = listener.local_addr().unwrap();
        let shutdown = CancellationToken::new();
        let task = tokio::spawn(server.serve(listener, shutdown.clone()));
        state
            .wait_for(|s| *s == ServerState::Serving)
            .await
            .unwrap();

        Running {
            addr,
            health,
            state,
            shutdown,
            task,
        }
    }

    #[tokio::test]
    async fn echoes_hello_with_headers_and_timestamps() {
        let running = start(local_config()).await;
        let mut client = EchoServiceClient::new(running.channel().await);

        let mut req = tonic::Request::new(EchoRequest {
            ping: "hello".to_string(),
        });
        req.metadata_mut().insert("x-test", "1".parse().unwrap());
        req.metadata_mut().append("x-multi", "a".parse().unwrap());
        req.metadata_mut().append("x-multi", "b".parse().unwrap());

        // Warm the connection so the measured call is a plain round trip.
        client.echo(EchoRequest::default()).await.unwrap();

        let sent = SystemTime::now();
        let resp = client.echo(req).await.unwrap().into_inner();

        assert_eq!(resp.body, "hello");
        assert_eq!(resp.headers["x-test"], "1");
        assert_eq!(resp.headers["x-multi"], "a,b");
        assert_eq!(resp.remote_addr, "127.0.0.1");

        let milestones = resp.milestones().unwrap();
        assert!(milestones.is_sorted(), "{milestones:?}");
        for at in milestones {
            let lag = at.duration_since(sent).unwrap_or_default();
            assert!(lag < MILESTONE_WINDOW, "{lag:?} after send");
        }

        running.shutdown.cancel();
        running.task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn health_watch_is_cut_off_by_the_stream_timeout() {
        let running = start(ServerConfig {
            stream_timeout: Some(Duration::from_millis(500)),
            ..local_config()
        })
        .await;
        let mut client = HealthClient::new(running.channel().await);

        let start = Instant::now();
        let mut stream = client
            .watch(HealthCheckRequest::default())
            .await
            .unwrap()
            .into_inner();
        let first = stream.next().await.unwrap().unwrap();
        assert_eq!(first.status(), Wire::Serving);
        assert!(start.elapsed() < Duration::from_millis(200));

        let err = stream.next().await.unwrap().unwrap_err();
        assert_eq!(err.code(), Code::DeadlineExceeded);
        let elapsed = start.elapsed();
        assert!(
            elapsed >= Duration::from_millis(450) && elapsed < Duration::from_millis(1000),
            "cut off after {elapsed:?}"
        );

        running.shutdown.cancel();
        running.task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn shutdown_reports_not_serving_then_stops() {
        let mut running = start(local_config()).await;
        let mut client = HealthClient::new(running.channel().await);

        let check = client
            .check(HealthCheckRequest {
                service: ECHO_SERVICE_NAME.to_string(),
            })
            .await
            .unwrap()
            .into_inner();
        assert_eq!(check.status(), Wire::Serving);

        let unknown = client
            .check(HealthCheckRequest {
                service: "nope".to_string(),
            })
            .await
            .unwrap_err();
        assert_eq!(unknown.code(), Code::NotFound);

        let mut watch = client
            .watch(HealthCheckRequest::default())
            .await
            .unwrap()
            .into_inner();
        assert_eq!(watch.next().await.unwrap().unwrap().status(), Wire::Serving);

        running.shutdown.cancel();
        assert_eq!(
            watch.next().await.unwrap().unwrap().status(),
            Wire::NotServing
        );
        assert_eq!(
            watch.next().await.unwrap().unwrap_err().code(),
            Code::Unavailable
        );

        running.task.await.unwrap().unwrap();
        assert_eq!(*running.state.borrow_and_update(), ServerState::Stopped);
        assert_eq!(
            running.health.check(OVERALL_HEALTH),
            Some(ServingStatus::NotServing)
        );
    }

    #[tokio::test]
    async fn expired_grace_period_is_a_drain_timeout() {
        let grace = Duration::from_millis(300);
        let running = start(ServerConfig {
            shutdown_timeout: grace,
            ..local_config()
        })
        .await;

        // A client that never reads: the echoed body fills the connection's
        // 64 KiB flow-control window, so the watch below can't be flushed
        // and its call stays open through the drain.
        let channel = Endpoint::from_shared(format!("http://{}", running.addr))
            .unwrap()
            .initial_connection_window_size(65_535)
            .initial_stream_window_size(65_535)
            .connect()
            .await
            .unwrap();

        let mut grpc = Grpc::new(channel.clone());
        grpc.ready().await.unwrap();
        let _unread = grpc
            .server_streaming(
                tonic::Request::new(EchoRequest {
                    ping: "x".repeat(256 * 1024),
                }),
                PathAndQuery::from_static("/grpc_echo.v1.EchoService/Echo"),
                ProstCodec::<EchoRequest, EchoResponse>::default(),
            )
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        let _watch = HealthClient::new(channel)
            .watch(HealthCheckRequest::default())
            .await
            .unwrap();

        let start = Instant::now();
        running.shutdown.cancel();
        let err = running.task.await.unwrap().unwrap_err();
        assert!(start.elapsed() >= grace);
        match err {
            Error::DrainTimeout {
                grace: reported,
                in_flight,
            } => {
                assert_eq!(reported, grace);
                assert!(in_flight >= 1, "in flight: {in_flight}");
            }
            other => panic!("expected a drain timeout, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn wildcard_listens_on_ipv4_too() {
        let listener = bind_any(0).unwrap();
        let local = listener.local_addr().unwrap();
        assert!(local.ip().is_unspecified());

        let v4 = SocketAddr::from((Ipv4Addr::LOCALHOST, local.port()));
        let (client, accepted) = tokio::join!(tokio::net::TcpStream::connect(v4), listener.accept());
        client.unwrap();
        accepted.unwrap();
    }

    #[tokio::test]
    async fn wildcard_does_not_hide_a_taken_port() {
        let taken = bind_any(0).unwrap();
        let port = taken.local_addr().unwrap().port();

        let err = bind_any(port).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::AddrInUse);
    }

    #[tokio::test]
    async fn bind_failure_is_fatal() {
        let taken = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = taken.local_addr().unwrap();

        let server = EchoServer::new(ServerConfig {
            addr: addr.to_string(),
            ..ServerConfig::default()
        });
        let err = server.run(CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, Error::Bind { .. }), "{err:?}");
    }

    #[tokio::test]
    async fn invalid_tls_material_is_rejected() {
        let server = EchoServer::new(ServerConfig {
            tls: Some(crate::server::config::TlsMaterial {
                cert: b"not a certificate".to_vec(),
                key: b"not a key".to_vec(),
            }),
            ..local_config()
        });
        let mut state = server.state();
        let err = server.run(CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, Error::Tls { .. }), "{err:?}");
        assert_eq!(*state.borrow_and_update(), ServerState::Stopped);
    }
}
