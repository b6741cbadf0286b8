//! Server internals.
//!
//! ## Structure
//!
//! - [`config`] - CLI / environment configuration.
//! - [`pipeline`] - middleware chains run by every route.
//! - [`streaming`] - response stream adapters used by the pipeline.
//! - [`service`] - the echo route.
//! - [`health`] - health registry and `grpc.health.v1.Health`.
//! - [`lifecycle`] - bind, serve and graceful shutdown.
//! - [`telemetry`] - logging, tracing and metrics.

pub mod config;
pub mod health;
pub mod lifecycle;
pub mod pipeline;
pub mod service;
pub mod streaming;
pub mod telemetry;
