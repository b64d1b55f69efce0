//! Producer-side write policy.
//!
//! An item gets exactly one attempt. Whatever goes wrong, the item is dropped
//! and the error returned for counting; a transport fault also resets the
//! pool so the next upload starts from a fresh connection.

use crate::pool::{Connector, HandleId, StreamPool};
use core::time::Duration;
use sluice_core::{Error, proto::WorkItem};

/// Writes `item` to the next stream of `pool`.
///
/// Getting the stream, including any (re-)initialization of the pool, is
/// bounded by `init_timeout`.
///
/// # Errors
///
/// - [`Error::InitTimeout`] if no stream was ready in time.
/// - [`Error::Initialization`] if the pool could not be set up.
/// - [`Error::Transport`] if the write failed; the pool is reset first.
pub async fn upload_to_stream<C: Connector>(
    pool: &StreamPool<C>,
    item: WorkItem,
    init_timeout: Duration,
) -> Result<HandleId, Error> {
    let acquire = async {
        if !pool.is_initialized() {
            tracing::warn!("gRPC client not initialized");
            pool.initialize().await?;
        }
        pool.get_stream().await
    };

    let handle = match tokio::time::timeout(init_timeout, acquire).await {
        Ok(Ok(handle)) => handle,
        Ok(Err(e)) => {
            tracing::warn!("Could not get a stream: {e}, dropping message");
            return Err(e);
        }
        Err(_) => {
            tracing::warn!("Timeout waiting for gRPC connection/stream, dropping message");
            return Err(Error::InitTimeout);
        }
    };

    let id = handle.id();
    match handle.write(item).await {
        Ok(()) => Ok(id),
        Err(e) => {
            tracing::warn!("gRPC error: {e}, dropping message");
            pool.reset_connection().await;
            Err(e)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::{
        OpenStream,
        tests::{pool, reset_while_waiting},
    };
    use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use futures::StreamExt;
    use sluice_core::proto::IngestionSummary;

    const INIT_TIMEOUT: Duration = Duration::from_millis(100);

    /// Connector whose `connect` takes longer than the upload time box.
    struct SlowConnector;

    #[tonic::async_trait]
    impl Connector for SlowConnector {
        type Connection = ();

        async fn connect(&self) -> Result<(), Error> {
            tokio::time::sleep(Duration::from_secs(1)).await;
            Ok(())
        }

        async fn open_stream(&self, _conn: &(), id: HandleId) -> Result<OpenStream, Error> {
            Ok(OpenStream::spawn(id, 1, |_items| async {
                Ok(IngestionSummary::completed(0, 0))
            }))
        }
    }

    /// Connector whose first generation of streams dies after one item.
    #[derive(Default)]
    struct FlakyConnector {
        connects: AtomicUsize,
        healthy: AtomicBool,
    }

    #[tonic::async_trait]
    impl Connector for FlakyConnector {
        type Connection = ();

        async fn connect(&self) -> Result<(), Error> {
            self.connects.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn open_stream(&self, _conn: &(), id: HandleId) -> Result<OpenStream, Error> {
            let healthy = self.healthy.load(Ordering::SeqCst);
            Ok(OpenStream::spawn(id, 1, move |mut items| async move {
                let mut received = 0;
                while items.next().await.is_some() {
                    received += 1;
                    if !healthy {
                        return Err(Error::Transport {
                            context: String::from("connection reset"),
                        });
                    }
                }
                Ok(IngestionSummary::completed(received, 0))
            }))
        }
    }

    #[tokio::test]
    async fn upload_initializes_lazily() {
        let pool = pool(2);
        let first = upload_to_stream(&pool, WorkItem::default(), INIT_TIMEOUT)
            .await
            .unwrap();
        let second = upload_to_stream(&pool, WorkItem::default(), INIT_TIMEOUT)
            .await
            .unwrap();
        assert_eq!((first.index, second.index), (0, 1));

        let received: u64 = pool
            .cleanup()
            .await
            .into_iter()
            .map(|r| r.unwrap().received)
            .sum();
        assert_eq!(received, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_initialization_drops_the_item() {
        let pool = StreamPool::new(SlowConnector, 2);
        let err = upload_to_stream(&pool, WorkItem::default(), INIT_TIMEOUT)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InitTimeout));
        assert!(!pool.is_initialized());
    }

    #[tokio::test]
    async fn write_fault_resets_and_recovers() {
        let pool = StreamPool::new(FlakyConnector::default(), 1);

        // The first item is accepted, then the call dies.
        let before = upload_to_stream(&pool, WorkItem::default(), INIT_TIMEOUT)
            .await
            .unwrap();
        let handle = pool.get_stream().await.unwrap();
        while !handle.is_closed() {
            tokio::task::yield_now().await;
        }
        drop(handle);

        let err = upload_to_stream(&pool, WorkItem::default(), INIT_TIMEOUT)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Transport { .. }));
        assert!(!pool.is_initialized());

        pool.connector().healthy.store(true, Ordering::SeqCst);
        let after = upload_to_stream(&pool, WorkItem::default(), INIT_TIMEOUT)
            .await
            .unwrap();
        assert_ne!(before, after);
        assert_eq!(after.generation, before.generation + 1);
        assert_eq!(pool.connector().connects.load(Ordering::SeqCst), 2);
    }

    /// Connector whose reconnects take longer than the upload time box.
    #[derive(Default)]
    struct SlowReconnector {
        connects: AtomicUsize,
    }

    #[tonic::async_trait]
    impl Connector for SlowReconnector {
        type Connection = ();

        async fn connect(&self) -> Result<(), Error> {
            if self.connects.fetch_add(1, Ordering::SeqCst) > 0 {
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
            Ok(())
        }

        async fn open_stream(&self, _conn: &(), id: HandleId) -> Result<OpenStream, Error> {
            Ok(OpenStream::spawn(id, 1, |mut items| async move {
                while items.next().await.is_some() {}
                Ok(IngestionSummary::completed(0, 0))
            }))
        }
    }

    #[tokio::test(start_paused = true)]
    async fn reinitialization_after_a_concurrent_reset_is_time_boxed() {
        let pool = StreamPool::new(SlowReconnector::default(), 2);
        pool.initialize().await.unwrap();

        let started = tokio::time::Instant::now();
        let upload = upload_to_stream(&pool, WorkItem::default(), INIT_TIMEOUT);
        let err = reset_while_waiting(&pool, upload).await.unwrap_err();

        assert!(matches!(err, Error::InitTimeout));
        assert!(started.elapsed() < Duration::from_secs(1));
        assert!(!pool.is_initialized());
    }
}
