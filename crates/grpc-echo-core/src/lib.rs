#![doc = include_str!("../README.md")]

mod common;
pub use common::*;

/// gRPC service and message definitions generated from `proto/`.
///
/// ## Service
///
/// - `EchoService/Echo` - returns the request payload along with the headers,
///   caller address and lifecycle timestamps observed by the server.
///
/// ## Messages
///
/// - [`EchoRequest`](proto::EchoRequest) - a single text payload.
/// - [`EchoResponse`](proto::EchoResponse) - headers, body, remote address and
///   four `google.protobuf.Timestamp` milestones.
pub mod proto {
    tonic::include_proto!("grpc_echo.v1");

    /// Encoded file descriptor set for the reflection service.
    pub const FILE_DESCRIPTOR_SET: &[u8] = tonic::include_file_descriptor_set!("echo_descriptor");
}
