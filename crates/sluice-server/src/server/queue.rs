//! Bounded admission queues.
//!
//! Each [`AdmissionQueue`] is a fixed-capacity FIFO shared by every ingestion
//! connection (producers) and every batch worker of its tier (consumers).
//! Admission never waits: [`AdmissionQueue::try_push`] either stores the item
//! or hands it straight back as [`Admission::Rejected`]. Consumers wait for
//! items with [`AdmissionQueue::pop`] or the time-boxed
//! [`AdmissionQueue::pop_timeout`].
//!
//! The queue is the only synchronization point between connections and
//! workers. The item buffer sits behind a short-held lock and waiting
//! consumers park on a [`Notify`].

use core::{fmt, time::Duration};
use parking_lot::Mutex;
use sluice_core::proto::WorkItem;
use std::{collections::VecDeque, sync::Arc};
use tokio::sync::Notify;

/// Priority class of a work item; selects its queue and batching policy.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Tier {
    Priority,
    Normal,
}

impl Tier {
    /// Tier an item is routed to.
    pub const fn of(item: &WorkItem) -> Self {
        if item.priority {
            Tier::Priority
        } else {
            Tier::Normal
        }
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Tier::Priority => "priority",
            Tier::Normal => "normal",
        }
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of an admission attempt.
#[must_use]
#[derive(Debug)]
pub enum Admission {
    /// The item is now owned by the queue.
    Admitted,
    /// The queue was full; the item is returned to the caller to be dropped.
    Rejected(WorkItem),
}

/// Fixed-capacity FIFO of [`WorkItem`]s.
pub struct AdmissionQueue {
    tier: Tier,
    capacity: usize,
    items: Mutex<VecDeque<WorkItem>>,
    available: Notify,
}

impl AdmissionQueue {
    pub fn new(tier: Tier, capacity: usize) -> Self {
        Self {
            tier,
            capacity,
            items: Mutex::new(VecDeque::with_capacity(capacity)),
            available: Notify::new(),
        }
    }

    pub const fn tier(&self) -> Tier {
        self.tier
    }

    pub const fn capacity(&self) -> usize {
        self.capacity
    }

    /// Current number of queued items.
    pub fn len(&self) -> usize {
        self.items.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.lock().is_empty()
    }

    /// Appends `item` if there is room, without waiting.
    pub fn try_push(&self, item: WorkItem) -> Admission {
        {
            let mut items = self.items.lock();
            if items.len() >= self.capacity {
                return Admission::Rejected(item);
            }
            items.push_back(item);
        }
        self.available.notify_one();
        Admission::Admitted
    }

    /// Removes the oldest item, if any, without waiting.
    pub fn try_pop(&self) -> Option<WorkItem> {
        let mut items = self.items.lock();
        let item = items.pop_front();
        // Pass the wakeup along so a second parked consumer sees the rest.
        if item.is_some() && !items.is_empty() {
            self.available.notify_one();
        }
        item
    }

    /// Waits until an item is available and removes it.
    ///
    /// Cancel safe: an item is only taken after the final wakeup, never across
    /// an await point.
    pub async fn pop(&self) -> WorkItem {
        loop {
            let notified = self.available.notified();
            if let Some(item) = self.try_pop() {
                return item;
            }
            notified.await;
        }
    }

    /// Like [`pop`](Self::pop) but gives up after `wait`.
    pub async fn pop_timeout(&self, wait: Duration) -> Option<WorkItem> {
        tokio::time::timeout(wait, self.pop()).await.ok()
    }
}

impl fmt::Debug for AdmissionQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AdmissionQueue")
            .field("tier", &self.tier)
            .field("capacity", &self.capacity)
            .field("len", &self.len())
            .finish()
    }
}

/// The priority and normal queues, shared across all connections.
#[derive(Clone, Debug)]
pub struct AdmissionQueues {
    pub priority: Arc<AdmissionQueue>,
    pub normal: Arc<AdmissionQueue>,
}

impl AdmissionQueues {
    pub fn new(priority_capacity: usize, normal_capacity: usize) -> Self {
        Self {
            priority: Arc::new(AdmissionQueue::new(Tier::Priority, priority_capacity)),
            normal: Arc::new(AdmissionQueue::new(Tier::Normal, normal_capacity)),
        }
    }

    pub fn get(&self, tier: Tier) -> &Arc<AdmissionQueue> {
        match tier {
            Tier::Priority => &self.priority,
            Tier::Normal => &self.normal,
        }
    }

    /// Routes `item` to its tier's queue.
    pub fn admit(&self, item: WorkItem) -> Admission {
        self.get(Tier::of(&item)).try_push(item)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::Instant;

    fn item(id: usize, priority: bool) -> WorkItem {
        WorkItem {
            id: format!("item-{id:04}"),
            priority,
            ..Default::default()
        }
    }

    #[test]
    fn full_queue_rejects_without_blocking() {
        let queue = AdmissionQueue::new(Tier::Priority, 15);
        let mut accepted = 0;
        let mut rejected = Vec::new();

        for i in 0..20 {
            match queue.try_push(item(i, true)) {
                Admission::Admitted => accepted += 1,
                Admission::Rejected(item) => rejected.push(item.id),
            }
        }

        assert_eq!(accepted, 15);
        assert_eq!(queue.len(), 15);
        assert_eq!(
            rejected,
            (15..20).map(|i| format!("item-{i:04}")).collect::<Vec<_>>()
        );

        // The first 15, in arrival order.
        for i in 0..15 {
            assert_eq!(queue.try_pop().map(|w| w.id), Some(format!("item-{i:04}")));
        }
        assert!(queue.is_empty());
    }

    #[test]
    fn received_plus_dropped_equals_attempts() {
        for capacity in [1, 3, 15, 25] {
            for attempts in [0, capacity, capacity + 1, capacity * 3] {
                let queue = AdmissionQueue::new(Tier::Normal, capacity);
                let (mut received, mut dropped) = (0, 0);
                for i in 0..attempts {
                    match queue.try_push(item(i, false)) {
                        Admission::Admitted => received += 1,
                        Admission::Rejected(_) => dropped += 1,
                    }
                }
                assert_eq!(received + dropped, attempts);
                assert_eq!(received, attempts.min(capacity));
                assert!(queue.len() <= capacity);
            }
        }
    }

    #[test]
    fn routes_by_priority_flag() {
        let queues = AdmissionQueues::new(1, 1);
        assert!(matches!(queues.admit(item(0, true)), Admission::Admitted));
        assert!(matches!(queues.admit(item(1, false)), Admission::Admitted));
        assert!(matches!(queues.admit(item(2, true)), Admission::Rejected(_)));
        assert_eq!(queues.priority.len(), 1);
        assert_eq!(queues.normal.len(), 1);
    }

    #[tokio::test]
    async fn pop_waits_for_push() {
        let queue = Arc::new(AdmissionQueue::new(Tier::Normal, 4));
        let consumer = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move { queue.pop().await })
        };
        tokio::task::yield_now().await;
        assert!(matches!(queue.try_push(item(7, false)), Admission::Admitted));

        let popped = consumer.await.unwrap();
        assert_eq!(popped.id, "item-0007");
    }

    #[tokio::test(start_paused = true)]
    async fn pop_timeout_gives_up() {
        let queue = AdmissionQueue::new(Tier::Priority, 4);
        let start = Instant::now();
        assert!(queue.pop_timeout(Duration::from_millis(500)).await.is_none());
        assert!(start.elapsed() >= Duration::from_millis(500));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_consumers_drain_everything_once() {
        const ITEMS: usize = 2_000;
        let queue = Arc::new(AdmissionQueue::new(Tier::Normal, 25));

        let consumers: Vec<_> = (0..4)
            .map(|_| {
                let queue = Arc::clone(&queue);
                tokio::spawn(async move {
                    let mut seen = Vec::new();
                    while let Some(item) = queue.pop_timeout(Duration::from_millis(200)).await {
                        seen.push(item.id);
                    }
                    seen
                })
            })
            .collect();

        let mut pushed = 0;
        while pushed < ITEMS {
            if let Admission::Admitted = queue.try_push(item(pushed, false)) {
                pushed += 1;
            } else {
                tokio::task::yield_now().await;
            }
        }

        let mut all = Vec::new();
        for consumer in consumers {
            all.extend(consumer.await.unwrap());
        }
        all.sort();
        all.dedup();
        assert_eq!(all.len(), ITEMS);
    }
}
