//! Client-facing gRPC surface.
//!
//! - [`handler`] - the `Ingestion` service entry point ([`handler::IngestionService`]).

pub mod handler;
