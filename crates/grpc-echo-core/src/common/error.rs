//! Error types for the echo service.
//!
//! This module defines the central `Error` enum, which covers both fatal
//! startup and shutdown failures and the per-call conditions surfaced to
//! clients. It implements `From<Error>` for `tonic::Status` so call-level
//! errors reach the caller with a machine-distinguishable code.
//!
//! ## Error Cases
//! - `Bind`: The listener could not be opened (address in use, permission
//!   denied).
//! - `Tls`: TLS material could not be loaded or was rejected by the transport.
//! - `Transport`: The accept loop failed for a reason other than shutdown.
//! - `DrainTimeout`: Graceful drain did not finish within the grace period.
//! - `DeadlineExceeded`: A stream outlived its configured lifetime.
//! - `Cancelled`: The call's cancellation scope was cancelled.
//! - `Internal`: Any unexpected failure while serving a call.
//! - `InvalidConfig`: The configuration was rejected before startup.

use core::time::Duration;
use tonic::Status;

pub type Result<T> = core::result::Result<T, Error>;

/// Unified error type for the echo service.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// The listener could not be bound.
    #[error("listen on {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    /// TLS certificate or key material was unusable.
    #[error("TLS error: {reason}")]
    Tls { reason: String },

    /// The transport failed while serving.
    #[error("transport error: {0}")]
    Transport(#[from] tonic::transport::Error),

    /// Draining in-flight calls exceeded the grace period.
    #[error("graceful drain timed out after {grace:?} ({in_flight} calls still active)")]
    DrainTimeout { grace: Duration, in_flight: usize },

    /// A stream exceeded its configured lifetime.
    #[error("stream deadline of {limit:?} exceeded")]
    DeadlineExceeded { limit: Duration },

    /// The call was cancelled.
    #[error("call cancelled")]
    Cancelled,

    /// An unexpected failure while serving a call.
    #[error("internal error: {context}")]
    Internal { context: String },

    /// The server configuration was rejected.
    #[error("invalid configuration: {reason}")]
    InvalidConfig { reason: String },
}

impl From<Error> for Status {
    fn from(err: Error) -> Self {
        match err {
            Error::DeadlineExceeded { limit } => {
                Status::deadline_exceeded(format!("stream deadline of {limit:?} exceeded"))
            }
            Error::Cancelled => Status::cancelled("call cancelled"),
            Error::DrainTimeout { .. } => Status::unavailable("server is shutting down"),
            other => Status::internal(other.to_string()),
        }
    }
}
