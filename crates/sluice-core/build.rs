/// Builds the gRPC client and server code for the `sluice.proto` definition
/// using `tonic-prost-build`.
///
/// This code generation step processes the Protocol Buffer definitions located
/// in the `proto` directory and emits Rust modules with gRPC bindings into the
/// crate's `OUT_DIR`. A file descriptor set is written next to them so the
/// server can register it with the reflection service.
///
/// # Files and Paths
///
/// - Proto file: `proto/sluice.proto`
/// - Includes: `proto/`
///
/// # Output
///
/// Generated code will be accessible in Rust via:
///
/// ```rust
/// pub mod proto {
///     tonic::include_proto!("sluice.v1");
/// }
/// ```
///
/// # Panics
///
/// This function will `panic!` if code generation fails.
use std::env;
use std::path::PathBuf;
fn main() {
    let out_dir = PathBuf::from(env::var("OUT_DIR").unwrap());
    let descriptor_path = out_dir.join("sluice_descriptor.bin");

    let mut config = tonic_prost_build::Config::new();
    config.file_descriptor_set_path(&descriptor_path);

    tonic_prost_build::configure()
        .compile_with_config(config, &["proto/sluice.proto"], &["proto"])
        .unwrap();

    println!("cargo:rerun-if-changed=proto/sluice.proto");
}
