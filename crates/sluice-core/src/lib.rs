#![doc = include_str!("../README.md")]

mod common;
pub use common::*;

/// Generated protobuf messages and the `Ingestion` client/server stubs.
pub mod proto {
    tonic::include_proto!("sluice.v1");

    /// Encoded file descriptor set, registered with the reflection service.
    pub const FILE_DESCRIPTOR_SET: &[u8] = tonic::include_file_descriptor_set!("sluice_descriptor");
}
