/// Builds the gRPC client and server code for the echo service using
/// `tonic-prost-build`.
///
/// The generated module is exposed as `grpc_echo_core::proto`, and the
/// encoded file descriptor set is written next to it so the server can
/// register the schema with the reflection service.
///
/// # Files and Paths
///
/// - Proto file: `proto/echo.proto`
/// - Includes: `proto/`
/// - Descriptor: `$OUT_DIR/echo_descriptor.bin`
///
/// `google.protobuf.Timestamp` is mapped onto `prost_types::Timestamp`.
///
/// # Panics
///
/// Panics if `OUT_DIR` is unset or code generation fails.
use std::env;
use std::path::PathBuf;
fn main() {
    let out_dir = PathBuf::from(env::var("OUT_DIR").unwrap());
    let descriptor_path = out_dir.join("echo_descriptor.bin");

    let mut config = tonic_prost_build::Config::new();
    config.file_descriptor_set_path(&descriptor_path);

    tonic_prost_build::configure()
        .compile_with_config(config, &["proto/echo.proto"], &["proto"])
        .unwrap();
}
