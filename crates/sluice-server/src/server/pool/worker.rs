use super::policy::BatchPolicy;
use crate::server::{
    batch::Batch,
    queue::AdmissionQueue,
    streaming::coordinator::ConcurrencyLimiter,
    telemetry::{increment_batches, record_batch_size},
};
use std::sync::Arc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Forms batches from one admission queue and dispatches them.
///
/// One scheduler type serves both tiers; the tier-specific numbers live in its
/// [`BatchPolicy`]. Several schedulers may drain the same queue.
pub struct BatchScheduler {
    worker_id: usize,
    queue: Arc<AdmissionQueue>,
    policy: BatchPolicy,
    limiter: Arc<ConcurrencyLimiter>,
}

impl BatchScheduler {
    pub fn new(
        worker_id: usize,
        queue: Arc<AdmissionQueue>,
        policy: BatchPolicy,
        limiter: Arc<ConcurrencyLimiter>,
    ) -> Self {
        Self {
            worker_id,
            queue,
            policy,
            limiter,
        }
    }

    /// Waits for the next batch.
    ///
    /// The first item opens the batch. The queue depth at that moment picks
    /// the limits, which hold for the whole batch. Further items are taken
    /// with waits of at most the policy's poll cap, and the batch closes on the
    /// first wait that times out, at its deadline, or when it is full.
    pub async fn next_batch(&self) -> Batch {
        let first = self.queue.pop().await;
        let opened = Instant::now();
        let depth = self.queue.len();
        let limits = self.policy.limits_for(depth);
        let deadline = opened + limits.deadline;

        let mut batch = Batch::new(self.policy.tier(), first, limits.max_items);
        while batch.len() < limits.max_items {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            match self
                .queue
                .pop_timeout(remaining.min(self.policy.poll_cap()))
                .await
            {
                Some(item) => batch.push(item),
                None => break,
            }
        }

        tracing::debug!(
            "Worker {} formed {} batch of {}/{} (depth {depth}) in {:?}",
            self.worker_id,
            self.policy.tier(),
            batch.len(),
            limits.max_items,
            opened.elapsed()
        );
        batch
    }

    /// Runs batch cycles until `shutdown` is cancelled.
    ///
    /// A failed dispatch is logged and the loop moves on; processing failures
    /// stay inside their own task.
    pub async fn run(self, shutdown: CancellationToken) {
        let tier = self.policy.tier();
        tracing::debug!("{tier} worker {} started", self.worker_id);

        loop {
            let batch = tokio::select! {
                biased;
                () = shutdown.cancelled() => break,
                batch = self.next_batch() => batch,
            };

            record_batch_size(tier, batch.len());
            increment_batches(tier);

            if let Err(e) = self.limiter.dispatch(batch, self.policy.cooldown()).await {
                tracing::error!("{tier} worker {} failed to dispatch: {e}", self.worker_id);
                if shutdown.is_cancelled() {
                    break;
                }
            }
        }

        tracing::debug!("{tier} worker {} stopped", self.worker_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::{
        config::LimitMode,
        pool::policy::{BatchLimits, DepthRule},
        queue::{Admission, Tier},
        streaming::processor::BatchProcessor,
    };
    use core::time::Duration;
    use sluice_core::proto::WorkItem;
    use tokio::sync::mpsc;

    struct Recorder(mpsc::UnboundedSender<(Instant, Vec<String>)>);

    #[tonic::async_trait]
    impl BatchProcessor for Recorder {
        async fn process(&self, batch: Batch) -> anyhow::Result<()> {
            let ids = batch.into_items().into_iter().map(|i| i.id).collect();
            self.0.send((Instant::now(), ids))?;
            Ok(())
        }
    }

    fn item(id: usize, priority: bool) -> WorkItem {
        WorkItem {
            id: format!("{id}"),
            priority,
            ..Default::default()
        }
    }

    fn scheduler(
        queue: &Arc<AdmissionQueue>,
        policy: BatchPolicy,
    ) -> (BatchScheduler, mpsc::UnboundedReceiver<(Instant, Vec<String>)>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let limiter = Arc::new(ConcurrencyLimiter::new(
            5,
            LimitMode::Soft,
            Arc::new(Recorder(tx)),
        ));
        (
            BatchScheduler::new(0, Arc::clone(queue), policy, limiter),
            rx,
        )
    }

    fn fill(queue: &AdmissionQueue, ids: core::ops::Range<usize>, priority: bool) {
        for id in ids {
            assert!(matches!(queue.try_push(item(id, priority)), Admission::Admitted));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn late_second_item_joins_until_deadline() {
        let queue = Arc::new(AdmissionQueue::new(Tier::Priority, 15));
        let (scheduler, _rx) = scheduler(&queue, BatchPolicy::priority());

        fill(&queue, 0..1, true);
        let producer = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(100)).await;
                fill(&queue, 1..2, true);
            })
        };

        let start = Instant::now();
        let batch = scheduler.next_batch().await;
        let elapsed = start.elapsed();
        producer.await.unwrap();

        assert_eq!(batch.len(), 2);
        assert_eq!(batch.items()[1].id, "1");
        assert!(elapsed >= Duration::from_millis(500), "{elapsed:?}");
        assert!(elapsed < Duration::from_millis(600), "{elapsed:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn full_batch_dispatches_immediately() {
        let queue = Arc::new(AdmissionQueue::new(Tier::Priority, 15));
        let (scheduler, _rx) = scheduler(&queue, BatchPolicy::priority());

        // First pop leaves depth 2: max 3 items.
        fill(&queue, 0..3, true);
        let start = Instant::now();
        let batch = scheduler.next_batch().await;

        assert_eq!(batch.len(), 3);
        assert_eq!(start.elapsed(), Duration::ZERO);
        assert!(queue.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn depth_is_sampled_once_at_batch_start() {
        let queue = Arc::new(AdmissionQueue::new(Tier::Priority, 15));
        let (scheduler, _rx) = scheduler(&queue, BatchPolicy::priority());

        // Depth 9 after the first pop selects max 7.
        fill(&queue, 0..10, true);
        let first = scheduler.next_batch().await;
        assert_eq!(first.len(), 7);
        let ids: Vec<_> = first.items().iter().map(|i| i.id.as_str()).collect();
        assert_eq!(ids, ["0", "1", "2", "3", "4", "5", "6"]);

        // Three left: depth 2 after the first pop, max 3.
        let second = scheduler.next_batch().await;
        assert_eq!(second.len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn normal_tier_sizes_by_depth() {
        let queue = Arc::new(AdmissionQueue::new(Tier::Normal, 25));
        let (scheduler, _rx) = scheduler(&queue, BatchPolicy::normal());

        fill(&queue, 0..20, false);
        assert_eq!(scheduler.next_batch().await.len(), 8);
        assert_eq!(scheduler.next_batch().await.len(), 8);
        // Four left: depth 3, max 5, so the batch waits out one poll cap.
        let start = Instant::now();
        assert_eq!(scheduler.next_batch().await.len(), 4);
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_secs(1), "{elapsed:?}");
        assert!(elapsed < Duration::from_secs(2), "{elapsed:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn batch_latency_is_bounded_by_deadline_plus_poll_cap() {
        let ms = Duration::from_millis;
        let policy = BatchPolicy::new(
            Tier::Normal,
            vec![DepthRule {
                below: 100,
                limits: BatchLimits::new(1_000, ms(300)),
            }],
            BatchLimits::new(1_000, ms(300)),
            ms(100),
            ms(0),
        );
        let queue = Arc::new(AdmissionQueue::new(Tier::Normal, 100));
        let (scheduler, _rx) = scheduler(&queue, policy.clone());

        fill(&queue, 0..1, false);
        let trickle = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move {
                for id in 1..50 {
                    tokio::time::sleep(ms(40)).await;
                    if let Admission::Rejected(_) = queue.try_push(item(id, false)) {
                        break;
                    }
                }
            })
        };

        let start = Instant::now();
        let batch = scheduler.next_batch().await;
        let elapsed = start.elapsed();
        trickle.abort();

        assert!(batch.len() > 1);
        assert!(batch.len() <= 1_000);
        assert!(elapsed <= policy.max_latency(), "{elapsed:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn run_dispatches_until_cancelled() {
        let queue = Arc::new(AdmissionQueue::new(Tier::Priority, 15));
        let (scheduler, mut rx) = scheduler(&queue, BatchPolicy::priority());
        let shutdown = CancellationToken::new();
        let worker = tokio::spawn(scheduler.run(shutdown.clone()));

        fill(&queue, 0..3, true);
        let (_, ids) = rx.recv().await.unwrap();
        assert_eq!(ids, ["0", "1", "2"]);

        fill(&queue, 3..4, true);
        let (_, ids) = rx.recv().await.unwrap();
        assert_eq!(ids, ["3"]);

        shutdown.cancel();
        worker.await.unwrap();
    }
}
