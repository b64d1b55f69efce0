//! Synthetic work items.

use ferroid::id::ULID;
use prost_types::Timestamp;
use rand::{Rng, seq::IndexedRandom};
use sluice_core::proto::{Status, WorkItem};
use std::time::SystemTime;

pub const USERNAMES: &[&str] = &[
    "alice_johnson",
    "bob_smith",
    "charlie_brown",
    "diana_prince",
    "eve_wilson",
    "frank_miller",
    "grace_kelly",
    "henry_davis",
    "ivy_chen",
    "jack_taylor",
    "karen_white",
    "liam_martinez",
    "mia_rodriguez",
    "noah_anderson",
    "olivia_thomas",
    "paul_walker",
    "quinn_foster",
    "rachel_green",
    "sam_wilson",
    "tina_turner",
    "user_001",
    "admin_user",
    "test_account",
    "demo_user",
    "guest_access",
];

pub const PAYLOADS: &[&str] = &[
    "Process payment transaction",
    "Generate monthly report",
    "Send email notification",
    "Update user profile",
    "Create backup snapshot",
    "Validate authentication token",
    "Calculate analytics metrics",
    "Sync data to external service",
    "Generate PDF document",
    "Process image upload",
    "Update inventory levels",
    "Send push notification",
    "Process order fulfillment",
    "Generate invoice",
    "Validate form submission",
    "Process refund request",
    "Update search index",
    "Send SMS notification",
    "Generate API response",
    "Process webhook event",
    "Update cache entries",
    "Process subscription renewal",
    "Generate audit log",
    "Validate API key",
    "Process batch job",
];

const STATUSES: [Status; 3] = [Status::NotStarted, Status::InProgress, Status::Completed];

/// A random item with a fresh ULID id, stamped now. `priority_ratio` is the
/// probability of the priority flag.
pub fn random_item<R: Rng + ?Sized>(rng: &mut R, priority_ratio: f64) -> WorkItem {
    let status = STATUSES.choose(rng).copied().unwrap_or(Status::NotStarted);
    WorkItem {
        id: ULID::now().to_string(),
        username: pick(rng, USERNAMES),
        payload: pick(rng, PAYLOADS),
        status: status.into(),
        priority: rng.random_bool(priority_ratio.clamp(0.0, 1.0)),
        timestamp: Some(Timestamp::from(SystemTime::now())),
    }
}

fn pick<R: Rng + ?Sized>(rng: &mut R, options: &[&str]) -> String {
    options.choose(rng).copied().unwrap_or_default().to_owned()
}
