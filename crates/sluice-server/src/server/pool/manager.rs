//! Lifecycle of the batch workers.
//!
//! This module defines [`SchedulerPool`], which spawns the configured number of
//! [`BatchScheduler`] tasks for each tier and stops them on shutdown. All
//! workers share one [`ConcurrencyLimiter`] and one [`CancellationToken`].

use super::{policy::BatchPolicy, worker::BatchScheduler};
use crate::server::{
    queue::{AdmissionQueues, Tier},
    streaming::coordinator::ConcurrencyLimiter,
};
use core::time::Duration;
use parking_lot::Mutex;
use sluice_core::Error;
use std::sync::Arc;
use tokio::{task::JoinHandle, time::timeout};
use tokio_util::sync::CancellationToken;

/// How long each worker gets to observe cancellation.
const WORKER_STOP_TIMEOUT: Duration = Duration::from_secs(3);

/// The running batch workers of both tiers.
pub struct SchedulerPool {
    workers: Mutex<Vec<(String, JoinHandle<()>)>>,
    limiter: Arc<ConcurrencyLimiter>,
    shutdown_token: CancellationToken,
    shutdown_timeout: Duration,
}

impl SchedulerPool {
    /// Spawns `workers_per_tier` schedulers for each of the two queues.
    pub fn spawn(
        queues: &AdmissionQueues,
        limiter: Arc<ConcurrencyLimiter>,
        workers_per_tier: usize,
        shutdown_timeout: Duration,
    ) -> Self {
        let shutdown_token = CancellationToken::new();
        let mut workers = Vec::with_capacity(workers_per_tier * 2);

        for worker_id in 0..workers_per_tier {
            for tier in [Tier::Priority, Tier::Normal] {
                let scheduler = BatchScheduler::new(
                    worker_id,
                    Arc::clone(queues.get(tier)),
                    BatchPolicy::for_tier(tier),
                    Arc::clone(&limiter),
                );
                let handle = tokio::spawn(scheduler.run(shutdown_token.child_token()));
                workers.push((format!("{tier} worker {worker_id}"), handle));
            }
        }

        Self {
            workers: Mutex::new(workers),
            limiter,
            shutdown_token,
            shutdown_timeout,
        }
    }

    pub fn limiter(&self) -> &Arc<ConcurrencyLimiter> {
        &self.limiter
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutdown_token.is_cancelled()
    }

    /// Stops the workers, then waits for in-flight processing tasks.
    ///
    /// - Cancels the shared token so no further batches are formed. Items
    ///   still queued are abandoned.
    /// - Waits (up to 3 seconds per worker) for each worker to exit.
    /// - Closes the limiter and waits up to the configured grace period for
    ///   running processing tasks.
    ///
    /// Calling this more than once is a no-op after the first call.
    pub async fn shutdown(&self) -> Result<(), Error> {
        // === Phase 1: Stop forming batches ===
        tracing::info!("Stopping batch workers");
        self.shutdown_token.cancel();

        let workers = core::mem::take(&mut *self.workers.lock());
        let stops = workers.into_iter().map(|(name, handle)| async move {
            match timeout(WORKER_STOP_TIMEOUT, handle).await {
                Ok(Ok(())) => tracing::trace!("{name} stopped"),
                Ok(Err(e)) => tracing::error!("{name} ended abnormally: {e}"),
                Err(_) => tracing::warn!("{name} did not stop in time"),
            }
        });
        futures::future::join_all(stops).await;

        // === Phase 2: Drain in-flight processing tasks ===
        tracing::info!(
            "Draining in-flight processing tasks ({} active)",
            self.limiter.in_flight()
        );
        if self.limiter.shutdown(self.shutdown_timeout).await {
            tracing::debug!("All processing tasks finished");
        } else {
            tracing::warn!(
                "Graceful drain timed out ({} tasks still active)",
                self.limiter.in_flight()
            );
        }

        tracing::info!("Scheduler pool shutdown complete");
        Ok(())
    }
}
