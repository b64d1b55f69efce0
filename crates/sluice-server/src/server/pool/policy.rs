//! Depth-dependent batch sizing.
//!
//! A [`BatchPolicy`] maps the depth of a queue, sampled once when a batch
//! opens, to a [`BatchLimits`] pair: how many items the batch may hold and how
//! long it may stay open. Shallow queues get small, quick batches; deep queues
//! get larger batches with longer deadlines. The priority tier is tuned tighter
//! than the normal tier at every depth.
//!
//! | tier     | depth  | max items | deadline | poll cap | cooldown |
//! |----------|--------|-----------|----------|----------|----------|
//! | priority | < 3    | 3         | 0.5 s    | 0.5 s    | 0.5 s    |
//! | priority | < 7    | 5         | 0.8 s    |          |          |
//! | priority | else   | 7         | 1.0 s    |          |          |
//! | normal   | < 8    | 5         | 2.0 s    | 1.0 s    | 1.0 s    |
//! | normal   | else   | 8         | 3.0 s    |          |          |

use crate::server::queue::Tier;
use core::time::Duration;

/// Size and time bounds for one batch.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BatchLimits {
    pub max_items: usize,
    pub deadline: Duration,
}

impl BatchLimits {
    pub const fn new(max_items: usize, deadline: Duration) -> Self {
        Self {
            max_items,
            deadline,
        }
    }
}

/// Limits applied while the sampled depth is strictly below `below`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DepthRule {
    pub below: usize,
    pub limits: BatchLimits,
}

/// Batching parameters for one tier.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BatchPolicy {
    tier: Tier,
    rules: Vec<DepthRule>,
    fallback: BatchLimits,
    poll_cap: Duration,
    cooldown: Duration,
}

impl BatchPolicy {
    /// Builds a policy. `rules` are checked in ascending `below` order; the
    /// first match wins and `fallback` applies past the last threshold.
    pub fn new(
        tier: Tier,
        mut rules: Vec<DepthRule>,
        fallback: BatchLimits,
        poll_cap: Duration,
        cooldown: Duration,
    ) -> Self {
        rules.sort_by_key(|rule| rule.below);
        Self {
            tier,
            rules,
            fallback,
            poll_cap,
            cooldown,
        }
    }

    pub fn priority() -> Self {
        Self::new(
            Tier::Priority,
            vec![
                DepthRule {
                    below: 3,
                    limits: BatchLimits::new(3, Duration::from_millis(500)),
                },
                DepthRule {
                    below: 7,
                    limits: BatchLimits::new(5, Duration::from_millis(800)),
                },
            ],
            BatchLimits::new(7, Duration::from_secs(1)),
            Duration::from_millis(500),
            Duration::from_millis(500),
        )
    }

    pub fn normal() -> Self {
        Self::new(
            Tier::Normal,
            vec![DepthRule {
                below: 8,
                limits: BatchLimits::new(5, Duration::from_secs(2)),
            }],
            BatchLimits::new(8, Duration::from_secs(3)),
            Duration::from_secs(1),
            Duration::from_secs(1),
        )
    }

    pub fn for_tier(tier: Tier) -> Self {
        match tier {
            Tier::Priority => Self::priority(),
            Tier::Normal => Self::normal(),
        }
    }

    pub const fn tier(&self) -> Tier {
        self.tier
    }

    /// Longest single wait for the next item while a batch is open.
    pub const fn poll_cap(&self) -> Duration {
        self.poll_cap
    }

    /// Delay applied before dispatch when the task ceiling is reached.
    pub const fn cooldown(&self) -> Duration {
        self.cooldown
    }

    pub fn limits_for(&self, depth: usize) -> BatchLimits {
        self.rules
            .iter()
            .find(|rule| depth < rule.below)
            .map_or(self.fallback, |rule| rule.limits)
    }

    /// Upper bound on the time between a batch opening and its dispatch.
    pub fn max_latency(&self) -> Duration {
        let longest = self
            .rules
            .iter()
            .map(|rule| rule.limits.deadline)
            .chain(core::iter::once(self.fallback.deadline))
            .max()
            .unwrap_or(self.fallback.deadline);
        longest + self.poll_cap
    }
}
