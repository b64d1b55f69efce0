//! Batch formation workers.
//!
//! - [`policy`] - depth-dependent size/deadline limits per tier.
//! - [`worker`] - the generic [`worker::BatchScheduler`] loop.
//! - [`manager`] - spawning and stopping the workers of both tiers.

pub mod manager;
pub mod policy;
pub mod worker;
