use super::queue::Tier;
use sluice_core::proto::WorkItem;

/// A non-empty run of items taken from one admission queue in FIFO order.
///
/// A batch is created from the item that opened it, so it can never be empty.
/// It is moved into exactly one processing task.
#[derive(Debug, Clone, PartialEq)]
pub struct Batch {
    tier: Tier,
    items: Vec<WorkItem>,
}

impl Batch {
    pub fn new(tier: Tier, first: WorkItem, max_items: usize) -> Self {
        let mut items = Vec::with_capacity(max_items.max(1));
        items.push(first);
        Self { tier, items }
    }

    pub fn push(&mut self, item: WorkItem) {
        self.items.push(item);
    }

    pub const fn tier(&self) -> Tier {
        self.tier
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Always false; kept for clippy's `len_without_is_empty`.
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn items(&self) -> &[WorkItem] {
        &self.items
    }

    pub fn into_items(self) -> Vec<WorkItem> {
        self.items
    }
}
