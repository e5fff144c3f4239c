//! Build script for mofa-extproc
//!
//! Compiles the Envoy protocol subset when the `grpc` feature is enabled.

const PROTOS: &[&str] = &[
    "proto/envoy/config/core/v3/base.proto",
    "proto/envoy/service/ext_proc/v3/external_processor.proto",
    "proto/envoy/extensions/common/ratelimit/v3/ratelimit.proto",
    "proto/envoy/service/ratelimit/v3/rls.proto",
];

fn main() -> Result<(), Box<dyn std::error::Error>> {
    println!("cargo:rerun-if-changed=proto");

    if std::env::var_os("CARGO_FEATURE_GRPC").is_none() {
        return Ok(());
    }

    tonic_build::configure().compile_protos(PROTOS, &["proto"])?;
    Ok(())
}
