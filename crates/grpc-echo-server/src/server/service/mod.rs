//! gRPC entry point for the echo service.
//!
//! ## Structure
//!
//! - [`handler`] - [`EchoService`](handler::EchoService), the tonic service,
//!   and [`EchoHandler`](handler::EchoHandler), the terminal stage of its
//!   chain.

pub mod handler;

pub use handler::EchoService;
