use anyhow::{Context, bail};
use clap::Parser;
use core::time::Duration;
use grpc_echo_core::Error;
use std::path::PathBuf;

/// Default per-message size limit, matching the gRPC default.
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 4 * 1024 * 1024;

/// Runtime configuration for the `grpc-echo-server` binary.
///
/// All values are parsed from CLI arguments or environment variables (a
/// `.env` file is loaded first). Durations are whole seconds unless the flag
/// name says otherwise, and a zero value turns the corresponding limit off.
#[derive(Parser, Debug, Clone)]
#[command(
    name = "grpc-echo-server",
    version,
    about = "A gRPC echo server reporting headers, peer address and call timestamps"
)]
pub struct CliArgs {
    /// Address to listen on.
    ///
    /// `:port` listens on every interface. Example: ":8080", "127.0.0.1:50051"
    ///
    /// Environment variable: `ADDR`
    #[arg(short, long, env = "ADDR", default_value_t = String::from(":8080"))]
    pub addr: String,

    /// Emit logs as JSON instead of pretty text.
    #[arg(long, env = "JSON", default_value_t = false)]
    pub json: bool,

    /// Log at debug level, including every successful call.
    #[arg(long, env = "DEBUG", default_value_t = false)]
    pub debug: bool,

    /// Serve over TLS. Requires `--tls-cert` and `--tls-key`.
    #[arg(long, env = "TLS", default_value_t = false)]
    pub tls: bool,

    /// PEM certificate chain used with `--tls`.
    #[arg(long, env = "TLS_CERT")]
    pub tls_cert: Option<PathBuf>,

    /// PEM private key used with `--tls`.
    #[arg(long, env = "TLS_KEY")]
    pub tls_key: Option<PathBuf>,

    /// Maximum lifetime of a server-streaming call, in milliseconds.
    ///
    /// Environment variable: `STREAM_TIMEOUT_MS`
    #[arg(long, env = "STREAM_TIMEOUT_MS", default_value_t = 0)]
    pub stream_timeout_ms: u64,

    /// How long in-flight calls may take to finish once shutdown starts.
    ///
    /// Environment variable: `SHUTDOWN_TIMEOUT`
    #[arg(long, env = "SHUTDOWN_TIMEOUT", default_value_t = 10)]
    pub shutdown_timeout: u64,

    /// Interval between HTTP/2 keepalive pings.
    #[arg(long, env = "KEEPALIVE_INTERVAL", default_value_t = 0)]
    pub keepalive_interval: u64,

    /// How long to wait for a keepalive ping acknowledgement.
    #[arg(long, env = "KEEPALIVE_TIMEOUT", default_value_t = 20)]
    pub keepalive_timeout: u64,

    /// Maximum age of a connection before it is gracefully closed.
    #[arg(long, env = "MAX_CONNECTION_AGE", default_value_t = 0)]
    pub max_connection_age: u64,

    /// Maximum concurrent streams per connection.
    #[arg(long, env = "MAX_CONCURRENT_STREAMS", default_value_t = 0)]
    pub max_concurrent_streams: u32,

    /// Maximum size of a request's header list, in bytes.
    #[arg(long, env = "MAX_HEADER_LIST_SIZE", default_value_t = 0)]
    pub max_header_list_size: u32,

    /// Maximum size of a single encoded or decoded message, in bytes.
    #[arg(long, env = "MAX_MESSAGE_SIZE", default_value_t = DEFAULT_MAX_MESSAGE_SIZE)]
    pub max_message_size: usize,

    /// Initial HTTP/2 stream window, in bytes. Zero keeps the adaptive window.
    #[arg(long, env = "INITIAL_STREAM_WINDOW_SIZE", default_value_t = 0)]
    pub initial_stream_window_size: u32,

    /// Initial HTTP/2 connection window, in bytes. Zero keeps the adaptive
    /// window.
    #[arg(long, env = "INITIAL_CONNECTION_WINDOW_SIZE", default_value_t = 0)]
    pub initial_connection_window_size: u32,
}

/// PEM material for the TLS listener.
#[derive(Clone)]
pub struct TlsMaterial {
    pub cert: Vec<u8>,
    pub key: Vec<u8>,
}

impl core::fmt::Debug for TlsMaterial {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("TlsMaterial")
            .field("cert", &format_args!("{} bytes", self.cert.len()))
            .field("key", &"<redacted>")
            .finish()
    }
}

/// Validated server settings. `None` means the transport default.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub addr: String,
    pub json: bool,
    pub debug: bool,
    pub tls: Option<TlsMaterial>,
    pub stream_timeout: Option<Duration>,
    pub shutdown_timeout: Duration,
    pub keepalive_interval: Option<Duration>,
    pub keepalive_timeout: Duration,
    pub max_connection_age: Option<Duration>,
    pub max_concurrent_streams: Option<u32>,
    pub max_header_list_size: Option<u32>,
    pub max_message_size: usize,
    pub initial_stream_window_size: Option<u32>,
    pub initial_connection_window_size: Option<u32>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            addr: normalize_addr(":8080"),
            json: false,
            debug: false,
            tls: None,
            stream_timeout: None,
            shutdown_timeout: Duration::from_secs(10),
            keepalive_interval: None,
            keepalive_timeout: Duration::from_secs(20),
            max_connection_age: None,
            max_concurrent_streams: None,
            max_header_list_size: None,
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            initial_stream_window_size: None,
            initial_connection_window_size: None,
        }
    }
}

impl TryFrom<CliArgs> for ServerConfig {
    type Error = anyhow::Error;

    fn try_from(args: CliArgs) -> Result<Self, Self::Error> {
        if args.addr.trim().is_empty() {
            bail!(invalid("ADDR must not be empty"));
        }

        if args.max_message_size == 0 {
            bail!(invalid("MAX_MESSAGE_SIZE must be greater than 0"));
        }

        let tls = if args.tls {
            let (Some(cert), Some(key)) = (&args.tls_cert, &args.tls_key) else {
                bail!(invalid("TLS requires both TLS_CERT and TLS_KEY"));
            };
            Some(TlsMaterial {
                cert: std::fs::read(cert)
                    .with_context(|| format!("failed to read TLS certificate {}", cert.display()))?,
                key: std::fs::read(key)
                    .with_context(|| format!("failed to read TLS key {}", key.display()))?,
            })
        } else {
            None
        };

        Ok(Self {
            addr: normalize_addr(&args.addr),
            json: args.json,
            debug: args.debug,
            tls,
            stream_timeout: millis(args.stream_timeout_ms),
            shutdown_timeout: Duration::from_secs(args.shutdown_timeout),
            keepalive_interval: secs(args.keepalive_interval),
            keepalive_timeout: Duration::from_secs(args.keepalive_timeout),
            max_connection_age: secs(args.max_connection_age),
            max_concurrent_streams: nonzero(args.max_concurrent_streams),
            max_header_list_size: nonzero(args.max_header_list_size),
            max_message_size: args.max_message_size,
            initial_stream_window_size: nonzero(args.initial_stream_window_size),
            initial_connection_window_size: nonzero(args.initial_connection_window_size),
        })
    }
}

/// Expands `:port` to the IPv6 wildcard. The listener binds it dual-stack,
/// or as IPv4 alone on hosts without IPv6.
fn normalize_addr(addr: &str) -> String {
    let addr = addr.trim();
    match addr.strip_prefix(':') {
        Some(port) => format!("[::]:{port}"),
        None => addr.to_string(),
    }
}

fn invalid(reason: &str) -> Error {
    Error::InvalidConfig {
        reason: reason.to_string(),
    }
}

fn secs(n: u64) -> Option<Duration> {
    (n > 0).then(|| Duration::from_secs(n))
}

fn millis(n: u64) -> Option<Duration> {
    (n > 0).then(|| Duration::from_millis(n))
}

fn nonzero(n: u32) -> Option<u32> {
    (n > 0).then_some(n)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> anyhow::Result<ServerConfig> {
        let argv = std::iter::once("grpc-echo-server").chain(args.iter().copied());
        ServerConfig::try_from(CliArgs::try_parse_from(argv)?)
    }

    #[test]
    fn zero_values_disable_limits() {
        let config = parse(&["--addr", ":9000"]).unwrap();
        assert_eq!(config.addr, "[::]:9000");
        assert_eq!(config.stream_timeout, None);
        assert_eq!(config.keepalive_interval, None);
        assert_eq!(config.max_concurrent_streams, None);
        assert_eq!(config.shutdown_timeout, Duration::from_secs(10));
        assert_eq!(config.max_message_size, DEFAULT_MAX_MESSAGE_SIZE);
        assert!(config.tls.is_none());
    }

    #[test]
    fn explicit_values_are_kept() {
        let config = parse(&[
            "-a",
            "127.0.0.1:0",
            "--stream-timeout-ms",
            "500",
            "--keepalive-interval",
            "30",
            "--max-concurrent-streams",
            "64",
        ])
        .unwrap();
        assert_eq!(config.addr, "127.0.0.1:0");
        assert_eq!(config.stream_timeout, Some(Duration::from_millis(500)));
        assert_eq!(config.keepalive_interval, Some(Duration::from_secs(30)));
        assert_eq!(config.max_concurrent_streams, Some(64));
    }

    #[test]
    fn tls_requires_cert_and_key() {
        let err = parse(&["--addr", ":0", "--tls"]).unwrap_err();
        assert!(err.to_string().contains("TLS_CERT"));

        let err = parse(&[
            "--addr",
            ":0",
            "--tls",
            "--tls-cert",
            "/nonexistent/cert.pem",
            "--tls-key",
            "/nonexistent/key.pem",
        ])
        .unwrap_err();
        assert!(err.to_string().contains("certificate"));
    }

    #[test]
    fn bare_port_means_every_interface() {
        assert_eq!(normalize_addr(":8080"), "[::]:8080");
        assert_eq!(normalize_addr(" :50051 "), "[::]:50051");
        assert_eq!(normalize_addr("0.0.0.0:8080"), "0.0.0.0:8080");
        assert_eq!(normalize_addr("[::1]:8080"), "[::1]:8080");
        assert_eq!(ServerConfig::default().addr, "[::]:8080");
    }

    #[test]
    fn rejects_zero_message_size() {
        assert!(parse(&["--addr", ":0", "--max-message-size", "0"]).is_err());
    }
}
