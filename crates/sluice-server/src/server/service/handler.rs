//! gRPC service implementation for streamed work ingestion.
//!
//! This module defines the [`IngestionService`] struct, which implements the
//! [`Ingestion`] service from the protobuf definition. Each client-streaming
//! call is one logical connection: every inbound [`WorkItem`] is routed to its
//! tier's admission queue without blocking, and one [`IngestionSummary`] with
//! the connection's totals is returned when the client finishes writing.
//!
//! ## Key Responsibilities
//!
//! - Own the two admission queues shared by all connections.
//! - Spawn the batch workers and the shared concurrency limiter.
//! - Count admitted and dropped items per connection.
//! - Refuse new connections once shutdown has begun.
//!
//! ## Related Modules
//!
//! - [`crate::server::queue`] - bounded admission queues.
//! - [`crate::server::pool`] - batch formation workers.
//! - [`crate::server::streaming`] - dispatch and processing.
use crate::server::{
    config::ServerConfig,
    pool::manager::SchedulerPool,
    queue::{Admission, AdmissionQueues, Tier},
    streaming::{
        coordinator::ConcurrencyLimiter,
        processor::{BatchProcessor, SimulatedProcessor, SimulatedSink},
    },
    telemetry::{
        decrement_connections_inflight, increment_connections_inflight, increment_items_dropped,
        increment_items_received,
    },
};
use futures::{Stream, TryStreamExt};
use sluice_core::{
    Error,
    proto::{IngestionSummary, WorkItem, ingestion_server::Ingestion},
};
use std::sync::Arc;
use tonic::{Request, Response, Status, Streaming};

/// gRPC service accepting streamed [`WorkItem`]s.
#[derive(Clone)]
pub struct IngestionService {
    config: ServerConfig,
    queues: AdmissionQueues,
    schedulers: Arc<SchedulerPool>,
}

impl IngestionService {
    /// Builds the service with the simulated processor and sink, configured
    /// from `config`.
    pub fn new(config: ServerConfig) -> Self {
        let sink = Arc::new(SimulatedSink::new(config.downstream_latency));
        let processor = Arc::new(SimulatedProcessor::new(config.item_latency, sink));
        Self::with_processor(config, processor)
    }

    /// Builds the service around a caller-supplied processor.
    ///
    /// Spawns `num_workers` batch workers per tier, so this must be called
    /// from within a Tokio runtime.
    pub fn with_processor(config: ServerConfig, processor: Arc<dyn BatchProcessor>) -> Self {
        let queues = AdmissionQueues::new(config.priority_capacity, config.normal_capacity);
        let limiter = Arc::new(ConcurrencyLimiter::new(
            config.max_concurrent_tasks,
            config.limit_mode,
            processor,
        ));
        let schedulers = SchedulerPool::spawn(
            &queues,
            limiter,
            config.num_workers,
            config.shutdown_timeout,
        );

        Self {
            config,
            queues,
            schedulers: Arc::new(schedulers),
        }
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn queues(&self) -> &AdmissionQueues {
        &self.queues
    }

    /// Current `(priority, normal)` queue depths.
    pub fn queue_depths(&self) -> (usize, usize) {
        (self.queues.priority.len(), self.queues.normal.len())
    }

    /// Admits every item of one inbound stream and returns the totals.
    ///
    /// Never waits for queue space: a full queue drops the item. A transport
    /// error from `stream` ends the call with that status; items admitted
    /// before it stay queued.
    pub async fn ingest<S>(&self, mut stream: S) -> Result<IngestionSummary, Status>
    where
        S: Stream<Item = Result<WorkItem, Status>> + Unpin,
    {
        if self.schedulers.is_shutting_down() {
            return Err(Error::ServiceShutdown.into());
        }

        increment_connections_inflight();
        let _connection = ConnectionGuard;

        let mut received = 0u64;
        let mut dropped = 0u64;

        while let Some(item) = stream.try_next().await? {
            let tier = Tier::of(&item);
            match self.queues.admit(item) {
                Admission::Admitted => {
                    received += 1;
                    increment_items_received(tier);
                }
                Admission::Rejected(item) => {
                    dropped += 1;
                    increment_items_dropped(tier);
                    tracing::warn!(
                        "{tier} queue full (depth {}), dropping item {}",
                        self.queues.get(tier).len(),
                        item.short_id()
                    );
                }
            }
        }

        let (priority_depth, normal_depth) = self.queue_depths();
        if dropped > 0 {
            tracing::warn!(
                "Stream closed: received {received}, dropped {dropped} \
                 (queue depths: priority {priority_depth}, normal {normal_depth})"
            );
        } else {
            tracing::info!(
                "Stream closed: received {received} \
                 (queue depths: priority {priority_depth}, normal {normal_depth})"
            );
        }

        Ok(IngestionSummary::completed(received, dropped))
    }

    /// Stops the batch workers and drains in-flight processing.
    ///
    /// New streams are refused from this point on. Items still sitting in
    /// the admission queues are not processed.
    pub async fn shutdown(&self) -> Result<(), Error> {
        self.schedulers.shutdown().await
    }
}

#[tonic::async_trait]
impl Ingestion for IngestionService {
    /// Handles one client-streaming upload.
    #[tracing::instrument(skip_all)]
    async fn stream_work(
        &self,
        req: Request<Streaming<WorkItem>>,
    ) -> Result<Response<IngestionSummary>, Status> {
        let summary = self.ingest(req.into_inner()).await?;
        Ok(Response::new(summary))
    }
}

struct ConnectionGuard;

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        decrement_connections_inflight();
    }
}
