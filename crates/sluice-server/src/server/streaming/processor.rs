//! Batch processing collaborator.
//!
//! The engine hands every dispatched [`Batch`] to a [`BatchProcessor`]. What
//! "processing" means is outside the engine: the shipped
//! [`SimulatedProcessor`] spends a fixed latency per item, derives a
//! [`DownstreamRecord`] from each, and forwards the records to a
//! [`DownstreamSink`] on a detached task. The batch counts as done as soon as
//! the records are handed off; downstream delivery is not awaited.

use crate::server::batch::Batch;
use core::time::Duration;
use std::sync::Arc;
use tokio::time::{Instant, sleep};

/// Consumes one batch.
#[tonic::async_trait]
pub trait BatchProcessor: Send + Sync + 'static {
    async fn process(&self, batch: Batch) -> anyhow::Result<()>;
}

/// Receives derived records after a batch has been processed.
#[tonic::async_trait]
pub trait DownstreamSink: Send + Sync + 'static {
    async fn send(&self, records: Vec<DownstreamRecord>) -> anyhow::Result<()>;
}

/// What a processed item turns into downstream.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DownstreamRecord {
    pub id: String,
    pub payload: String,
}

/// Sink standing in for a message bus or downstream service.
#[derive(Clone, Debug)]
pub struct SimulatedSink {
    latency: Duration,
}

impl SimulatedSink {
    pub const fn new(latency: Duration) -> Self {
        Self { latency }
    }
}

#[tonic::async_trait]
impl DownstreamSink for SimulatedSink {
    async fn send(&self, records: Vec<DownstreamRecord>) -> anyhow::Result<()> {
        sleep(self.latency).await;
        tracing::debug!("Delivered {} records downstream", records.len());
        Ok(())
    }
}

/// Processor with a fixed per-item cost, e.g. a transformation or a DB call.
#[derive(Clone)]
pub struct SimulatedProcessor {
    item_latency: Duration,
    sink: Arc<dyn DownstreamSink>,
}

impl SimulatedProcessor {
    pub fn new(item_latency: Duration, sink: Arc<dyn DownstreamSink>) -> Self {
        Self { item_latency, sink }
    }
}

#[tonic::async_trait]
impl BatchProcessor for SimulatedProcessor {
    async fn process(&self, batch: Batch) -> anyhow::Result<()> {
        let start = Instant::now();
        let tier = batch.tier();
        let size = batch.len();

        let mut records = Vec::with_capacity(size);
        for item in batch.into_items() {
            records.push(DownstreamRecord {
                id: item.id,
                payload: item.payload,
            });
            sleep(self.item_latency).await;
        }

        // Fire and forget: the batch is finished once the records are handed
        // off, a failed delivery only shows up in the logs.
        let sink = Arc::clone(&self.sink);
        tokio::spawn(async move {
            if let Err(e) = sink.send(records).await {
                tracing::warn!("Downstream delivery failed: {e:#}");
            }
        });

        tracing::info!(
            "Finished processing {tier} batch of {size} in {:.1}ms",
            start.elapsed().as_secs_f64() * 1000.0
        );
        Ok(())
    }
}
