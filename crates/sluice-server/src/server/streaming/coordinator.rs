//! Dispatch of formed batches under a shared task ceiling.
//!
//! [`ConcurrencyLimiter`] spawns one tracked task per batch and is shared by
//! every batch worker of both tiers. Tasks sit in a [`TaskTracker`], which
//! drops them from its count when they finish, fail or panic, so the ceiling
//! check always reads a live number.
//!
//! ## Limit modes
//!
//! - [`LimitMode::Soft`] (default): when the ceiling is reached the caller
//!   waits for its tier's cooldown and then dispatches anyway. Check and spawn
//!   are not atomic, so concurrent workers can overshoot the ceiling for a
//!   while. That overshoot is accepted burst tolerance.
//! - [`LimitMode::Hard`]: a semaphore permit is acquired before spawning and
//!   released when the task ends. Dispatch blocks until a slot frees, which
//!   also bounds the number of tracked tasks.

use super::processor::BatchProcessor;
use crate::server::{
    batch::Batch,
    config::LimitMode,
    telemetry::{decrement_tasks_inflight, increment_cooldowns, increment_tasks_inflight},
};
use core::time::Duration;
use sluice_core::Error;
use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::task::TaskTracker;

pub struct ConcurrencyLimiter {
    ceiling: usize,
    mode: LimitMode,
    permits: Arc<Semaphore>,
    tracker: TaskTracker,
    processor: Arc<dyn BatchProcessor>,
}

impl ConcurrencyLimiter {
    pub fn new(ceiling: usize, mode: LimitMode, processor: Arc<dyn BatchProcessor>) -> Self {
        Self {
            ceiling,
            mode,
            permits: Arc::new(Semaphore::new(ceiling)),
            tracker: TaskTracker::new(),
            processor,
        }
    }

    pub const fn ceiling(&self) -> usize {
        self.ceiling
    }

    pub const fn mode(&self) -> LimitMode {
        self.mode
    }

    /// Number of processing tasks currently running.
    pub fn in_flight(&self) -> usize {
        self.tracker.len()
    }

    /// Hands `batch` to the processor on a new tracked task.
    ///
    /// In soft mode, a saturated limiter delays the dispatch by `cooldown`. In
    /// hard mode, the call waits for a free slot instead.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ServiceShutdown`] if the limiter was closed; the batch
    /// is dropped.
    pub async fn dispatch(&self, batch: Batch, cooldown: Duration) -> Result<(), Error> {
        if self.tracker.is_closed() {
            return Err(Error::ServiceShutdown);
        }

        let permit = match self.mode {
            LimitMode::Soft => {
                if self.tracker.len() >= self.ceiling {
                    tracing::warn!(
                        "Max concurrent tasks reached ({}), cooling down {:?} before dispatching {} batch",
                        self.ceiling,
                        cooldown,
                        batch.tier()
                    );
                    increment_cooldowns(batch.tier());
                    tokio::time::sleep(cooldown).await;
                }
                None
            }
            LimitMode::Hard => {
                let permit = Arc::clone(&self.permits)
                    .acquire_owned()
                    .await
                    .map_err(|_| Error::ServiceShutdown)?;
                Some(permit)
            }
        };

        self.spawn(batch, permit);
        Ok(())
    }

    fn spawn(&self, batch: Batch, permit: Option<OwnedSemaphorePermit>) {
        let processor = Arc::clone(&self.processor);
        let tier = batch.tier();

        tracing::info!(
            "Processing {} {tier} messages (active tasks: {})",
            batch.len(),
            self.tracker.len()
        );

        increment_tasks_inflight();
        self.tracker.spawn(async move {
            let _permit = permit;
            let _inflight = InflightGuard;
            if let Err(e) = processor.process(batch).await {
                tracing::error!("Processing of {tier} batch failed: {e:#}");
            }
        });
    }

    /// Stops accepting batches and waits up to `grace` for running tasks.
    ///
    /// Returns `true` if every task finished in time.
    pub async fn shutdown(&self, grace: Duration) -> bool {
        self.tracker.close();
        self.permits.close();
        tokio::time::timeout(grace, self.tracker.wait())
            .await
            .is_ok()
    }
}

/// Decrements the in-flight gauge however the task ends.
struct InflightGuard;

impl Drop for InflightGuard {
    fn drop(&mut self) {
        decrement_tasks_inflight();
    }
}
