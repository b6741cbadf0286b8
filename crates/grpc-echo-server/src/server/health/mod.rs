//! Service health: the status registry and the gRPC surface over it.

pub mod registry;
pub mod service;

pub use registry::HealthRegistry;
pub use service::HealthService;
