//! Burst-driven load generator.
//!
//! A burst writes synthetic items until `max_messages` of them were accepted
//! by a stream, then closes the pool and reports the server summaries of
//! every stream.

use crate::{
    config::ProducerConfig,
    data::random_item,
    pool::{Connector, StreamPool},
    upload::upload_to_stream,
};
use core::time::Duration;
use sluice_core::{Error, proto::IngestionSummary};
use tokio_util::sync::CancellationToken;

/// Outcome of one burst.
#[derive(Debug, Default)]
pub struct BurstReport {
    /// Items written to a stream.
    pub sent: u64,
    /// Items dropped on the client before reaching a stream.
    pub failed: u64,
    /// One entry per stream, as returned by [`StreamPool::cleanup`].
    pub responses: Vec<Result<IngestionSummary, Error>>,
}

impl BurstReport {
    /// Sum of `(received, dropped)` over the summaries that came back.
    pub fn totals(&self) -> (u64, u64) {
        self.responses
            .iter()
            .flatten()
            .fold((0, 0), |(received, dropped), summary| {
                (received + summary.received, dropped + summary.dropped)
            })
    }

    /// Logs one line per stream and the totals.
    pub fn log(&self) {
        if self.responses.is_empty() {
            tracing::warn!("No responses received from any stream");
            return;
        }

        for (i, response) in self.responses.iter().enumerate() {
            match response {
                Ok(summary) => tracing::info!(
                    "Stream {} response: success={}, received={}, dropped={}, message='{}'",
                    i + 1,
                    summary.success,
                    summary.received,
                    summary.dropped,
                    summary.message
                ),
                Err(e) => tracing::warn!("Stream {} failed: {e}", i + 1),
            }
        }

        let (received, dropped) = self.totals();
        tracing::info!("Total across all streams: {received} received, {dropped} dropped");
    }
}

/// Runs one burst against `pool`.
///
/// Failed uploads are counted and do not count towards `max_messages`.
/// Cancelling `shutdown` ends the burst early; the pool is cleaned up either
/// way.
pub async fn run_burst<C: Connector>(
    pool: &StreamPool<C>,
    config: &ProducerConfig,
    init_timeout: Duration,
    shutdown: &CancellationToken,
) -> BurstReport {
    let mut report = BurstReport::default();

    while report.sent < config.max_messages && !shutdown.is_cancelled() {
        let item = random_item(&mut rand::rng(), config.priority_ratio);

        tokio::select! {
            biased;
            () = shutdown.cancelled() => break,
            () = tokio::time::sleep(config.send_interval) => {}
        }

        match upload_to_stream(pool, item, init_timeout).await {
            Ok(_) => report.sent += 1,
            Err(_) => {
                report.failed += 1;
                tracing::warn!("Data upload error");
            }
        }
    }

    if report.sent >= config.max_messages {
        tracing::info!("{} messages sent", report.sent);
    } else {
        tracing::info!("Burst interrupted after {} messages", report.sent);
    }

    report.responses = pool.cleanup().await;
    report
}

/// Runs the configured number of bursts, or until `shutdown` is cancelled.
pub async fn run<C: Connector>(
    pool: &StreamPool<C>,
    config: &ProducerConfig,
    init_timeout: Duration,
    shutdown: &CancellationToken,
) -> Vec<BurstReport> {
    tracing::info!("Starting producer");
    let mut reports = Vec::new();
    let mut burst = 0u64;

    while config.bursts.is_none_or(|bursts| burst < bursts) && !shutdown.is_cancelled() {
        burst += 1;
        tracing::info!("Starting burst {burst}");
        let report = run_burst(pool, config, init_timeout, shutdown).await;
        report.log();
        reports.push(report);
    }

    reports
}
