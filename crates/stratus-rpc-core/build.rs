/// Generates the gRPC client and server bindings for the worker protocol.
///
/// The protocol has a single bidirectional streaming method, so the service is
/// described with the `manual` builder instead of a `.proto` file. Message
/// types are declared by hand in `src/proto.rs` with `prost` derives, which
/// keeps the build free of a `protoc` dependency.
///
/// # Output
///
/// `$OUT_DIR/stratus.rpc.FunctionRpc.rs`, included from `src/proto.rs`:
///
/// ```rust,ignore
/// include!(concat!(env!("OUT_DIR"), "/stratus.rpc.FunctionRpc.rs"));
/// ```
///
/// # Panics
///
/// Panics if the generated file cannot be written to `OUT_DIR`.
use tonic_prost_build::manual::{Builder, Method, Service};

fn main() {
    let event_stream = Method::builder()
        .name("event_stream")
        .route_name("EventStream")
        .input_type("crate::proto::StreamingMessage")
        .output_type("crate::proto::StreamingMessage")
        .codec_path("tonic_prost::ProstCodec")
        .client_streaming()
        .server_streaming()
        .build();

    let service = Service::builder()
        .name("FunctionRpc")
        .package("stratus.rpc")
        .method(event_stream)
        .build();

    Builder::new().compile(&[service]);
    println!("cargo:rerun-if-changed=build.rs");
}
