//! # Shared defaults and protocol helpers
//!
//! Constants that both sides of the `Ingestion` service agree on, plus small
//! conveniences on the generated message types.
//!
//! The capacities, ceilings and timeouts here are the defaults of the CLI
//! flags exposed by the server and producer binaries; they are not enforced
//! by the protocol itself.

use crate::proto::{IngestionSummary, WorkItem};
use core::time::Duration;

/// Fully qualified gRPC service name of `Ingestion`.
pub const INGESTION_SERVICE_NAME: &str = "sluice.v1.Ingestion";

/// Message returned in every successful [`IngestionSummary`].
pub const UPLOAD_SUCCESS_MESSAGE: &str = "Upload successful";

/// Default listen/connect port.
pub const DEFAULT_PORT: u16 = 50051;

/// Default capacity of the priority admission queue.
pub const DEFAULT_PRIORITY_CAPACITY: usize = 15;

/// Default capacity of the normal admission queue.
pub const DEFAULT_NORMAL_CAPACITY: usize = 25;

/// Default soft ceiling on in-flight processing tasks, shared by both tiers.
pub const DEFAULT_MAX_CONCURRENT_TASKS: usize = 5;

/// Default number of write streams held by a client pool.
pub const DEFAULT_POOL_SIZE: usize = 6;

/// Largest message either side will encode or decode (50 MiB).
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 50 * 1024 * 1024;

/// HTTP/2 keepalive ping interval.
pub const DEFAULT_KEEPALIVE_INTERVAL: Duration = Duration::from_secs(30);

/// Time to wait for a keepalive ping acknowledgement.
pub const DEFAULT_KEEPALIVE_TIMEOUT: Duration = Duration::from_secs(5);

/// Number of characters of an item id shown in log lines.
const SHORT_ID_LEN: usize = 8;

impl WorkItem {
    /// Leading characters of the id, for log lines.
    pub fn short_id(&self) -> &str {
        match self.id.char_indices().nth(SHORT_ID_LEN) {
            Some((idx, _)) => &self.id[..idx],
            None => &self.id,
        }
    }
}

impl IngestionSummary {
    /// Summary for a connection that closed cleanly.
    pub fn completed(received: u64, dropped: u64) -> Self {
        Self {
            success: true,
            received,
            dropped,
            message: UPLOAD_SUCCESS_MESSAGE.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_id_truncates_long_ids() {
        let item = WorkItem {
            id: "01JABCDEFGHJKMNPQRSTVWXYZ0".into(),
            ..Default::default()
        };
        assert_eq!(item.short_id(), "01JABCDE");

        let item = WorkItem {
            id: "abc".into(),
            ..Default::default()
        };
        assert_eq!(item.short_id(), "abc");
    }

    #[test]
    fn completed_summary_reports_success() {
        let summary = IngestionSummary::completed(15, 5);
        assert!(summary.success);
        assert_eq!(summary.received, 15);
        assert_eq!(summary.dropped, 5);
        assert_eq!(summary.message, UPLOAD_SUCCESS_MESSAGE);
    }
}
