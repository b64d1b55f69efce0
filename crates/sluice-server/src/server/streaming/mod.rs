//! Hand-off from formed batches to processing tasks.
//!
//! - [`coordinator`] - shared task ceiling ([`coordinator::ConcurrencyLimiter`]).
//! - [`processor`] - the batch processing collaborator contract.

pub mod coordinator;
pub mod processor;
