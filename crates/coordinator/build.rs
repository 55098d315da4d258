//! Generates the Coordinator client and server stubs.
//!
//! Messages are plain `prost` structs in `src/lib.rs`, so only the service
//! glue is generated and no `protoc` is needed.

fn main() {
    let wait_barrier = tonic_build::manual::Method::builder()
        .name("wait_barrier")
        .route_name("WaitBarrier")
        .input_type("crate::proto::BarrierRequest")
        .output_type("crate::proto::BarrierResponse")
        .codec_path("tonic::codec::ProstCodec")
        .build();

    let service = tonic_build::manual::Service::builder()
        .name("Coordinator")
        .package("coordinator")
        .method(wait_barrier)
        .build();

    tonic_build::manual::Builder::new().compile(&[service]);
}
