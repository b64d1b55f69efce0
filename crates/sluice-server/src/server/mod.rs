pub mod batch;
pub mod config;
pub mod lifecycle;
pub mod pool;
pub mod queue;
pub mod service;
pub mod streaming;
pub mod telemetry;
