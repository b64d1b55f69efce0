//! Pool of long-lived client-streaming calls.
//!
//! A [`StreamPool`] owns one transport connection and a fixed number of open
//! write streams over it, and hands the streams out round-robin. It has two
//! states, initialized and not initialized, and every transition runs under
//! one pool-wide async lock:
//!
//! - [`StreamPool::initialize`] connects and opens all streams, or keeps
//!   nothing on failure.
//! - [`StreamPool::cleanup`] ends every stream, collects the server summaries
//!   and drops the connection.
//! - [`StreamPool::reset_connection`] is the recovery path after a failed
//!   write; the next [`StreamPool::get_stream`] reinitializes from scratch.
//!
//! Writes happen on [`StreamHandle`] clones outside the lock.

pub mod connector;
pub mod handle;

pub use connector::{Connector, GrpcConnection, GrpcConnector};
pub use handle::{HandleId, OpenStream, StreamHandle, WorkStream};

use core::sync::atomic::{AtomicBool, Ordering};
use sluice_core::{Error, proto::IngestionSummary};
use tokio::sync::Mutex;

struct PoolState<T> {
    conn: Option<T>,
    streams: Vec<OpenStream>,
    cursor: usize,
    generation: u64,
}

impl<T> PoolState<T> {
    fn is_initialized(&self) -> bool {
        self.conn.is_some() && !self.streams.is_empty()
    }
}

pub struct StreamPool<C: Connector> {
    connector: C,
    pool_size: usize,
    /// Mirrors the locked state for lock-free checks.
    initialized: AtomicBool,
    state: Mutex<PoolState<C::Connection>>,
}

impl<C: Connector> StreamPool<C> {
    /// Creates an uninitialized pool. Nothing is dialed until first use.
    ///
    /// A `pool_size` of 0 is treated as 1.
    pub fn new(connector: C, pool_size: usize) -> Self {
        Self {
            connector,
            pool_size: pool_size.max(1),
            initialized: AtomicBool::new(false),
            state: Mutex::new(PoolState {
                conn: None,
                streams: Vec::new(),
                cursor: 0,
                generation: 0,
            }),
        }
    }

    pub const fn connector(&self) -> &C {
        &self.connector
    }

    pub const fn pool_size(&self) -> usize {
        self.pool_size
    }

    /// Lock-free view of the initialized flag. May be stale by the time the
    /// caller acts on it.
    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::Acquire)
    }

    /// Generation of the current (or last) set of streams.
    pub async fn generation(&self) -> u64 {
        self.state.lock().await.generation
    }

    /// Connects and opens `pool_size` streams unless already initialized.
    ///
    /// Concurrent callers serialize on the pool lock, so the setup runs at
    /// most once. If the returned future is dropped part-way, nothing is
    /// kept.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Initialization`] if connecting or opening any stream
    /// fails. Streams opened so far are closed and the pool stays
    /// uninitialized, so a later call may retry.
    pub async fn initialize(&self) -> Result<(), Error> {
        let mut state = self.state.lock().await;
        self.initialize_locked(&mut state).await
    }

    async fn initialize_locked(
        &self,
        state: &mut PoolState<C::Connection>,
    ) -> Result<(), Error> {
        if state.is_initialized() {
            return Ok(());
        }

        let generation = state.generation + 1;
        let conn = self.connector.connect().await.map_err(|e| {
            let e = as_initialization(e);
            tracing::error!("Failed to initialize gRPC client: {e}");
            e
        })?;

        let mut streams = Vec::with_capacity(self.pool_size);
        for index in 0..self.pool_size {
            let id = HandleId { generation, index };
            match self.connector.open_stream(&conn, id).await {
                Ok(stream) => streams.push(stream),
                Err(e) => {
                    let e = as_initialization(e);
                    tracing::error!("Failed to initialize gRPC client: {e}");
                    // Dropping the handles ends the calls opened so far.
                    drop(streams);
                    drop(conn);
                    return Err(e);
                }
            }
        }

        state.conn = Some(conn);
        state.streams = streams;
        state.cursor = 0;
        state.generation = generation;
        self.initialized.store(true, Ordering::Release);

        tracing::info!(
            "Initialized gRPC client and {} streams (generation {generation})",
            self.pool_size
        );
        Ok(())
    }

    /// Returns the next stream in round-robin order, initializing first if
    /// needed.
    ///
    /// # Errors
    ///
    /// Propagates [`Error::Initialization`] from an implicit
    /// [`initialize`](Self::initialize).
    pub async fn get_stream(&self) -> Result<StreamHandle, Error> {
        let mut state = self.state.lock().await;
        self.initialize_locked(&mut state).await?;

        let index = state.cursor;
        state.cursor = (index + 1) % state.streams.len();
        Ok(state.streams[index].handle().clone())
    }

    /// Ends every stream, waits for the server summaries and resets the pool.
    ///
    /// Streams are closed even if callers still hold their handles. One
    /// result per stream, in stream order; a failed stream yields an error
    /// without affecting the others. Safe to call repeatedly; an
    /// uninitialized pool returns an empty list.
    pub async fn cleanup(&self) -> Vec<Result<IngestionSummary, Error>> {
        let mut state = self.state.lock().await;
        self.cleanup_locked(&mut state).await
    }

    async fn cleanup_locked(
        &self,
        state: &mut PoolState<C::Connection>,
    ) -> Vec<Result<IngestionSummary, Error>> {
        self.initialized.store(false, Ordering::Release);
        state.cursor = 0;
        let streams = core::mem::take(&mut state.streams);

        let responses =
            futures::future::join_all(streams.into_iter().map(OpenStream::finish)).await;
        state.conn = None;
        responses
    }

    /// Tears the pool down after a transport fault so the next
    /// [`get_stream`](Self::get_stream) reinitializes.
    pub async fn reset_connection(&self) {
        let mut state = self.state.lock().await;
        tracing::info!("Resetting gRPC connection");
        let responses = self.cleanup_locked(&mut state).await;
        let failed = responses.iter().filter(|r| r.is_err()).count();
        tracing::debug!(
            "Discarded {} stream summaries during reset ({failed} failed)",
            responses.len()
        );
    }

    /// `false` when uninitialized or when any stream's call has ended.
    ///
    /// Never dials and never blocks on a write.
    pub async fn is_healthy(&self) -> bool {
        let state = self.state.lock().await;
        state.is_initialized() && state.streams.iter().all(|s| !s.handle().is_closed())
    }
}

fn as_initialization(e: Error) -> Error {
    match e {
        Error::Initialization { .. } => e,
        other => Error::Initialization {
            reason: other.to_string(),
        },
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use core::{future::Future, pin::pin, sync::atomic::AtomicUsize, time::Duration};
    use futures::{FutureExt, StreamExt};
    use std::sync::Arc;

    /// In-process connector: every stream counts what it receives.
    #[derive(Default)]
    pub(crate) struct LocalConnector {
        pub connects: AtomicUsize,
        /// Fail `connect` while set.
        pub refuse: AtomicBool,
        /// Fail `open_stream` for this index, if set.
        pub fail_stream: Option<usize>,
        /// Make streams end immediately with an error.
        pub broken_calls: AtomicBool,
        /// Make the call with this index fail once its writes end.
        pub fail_call: Option<usize>,
    }

    #[tonic::async_trait]
    impl Connector for LocalConnector {
        type Connection = ();

        async fn connect(&self) -> Result<(), Error> {
            self.connects.fetch_add(1, Ordering::SeqCst);
            if self.refuse.load(Ordering::SeqCst) {
                return Err(Error::Transport {
                    context: String::from("connection refused"),
                });
            }
            Ok(())
        }

        async fn open_stream(&self, _conn: &(), id: HandleId) -> Result<OpenStream, Error> {
            if self.fail_stream == Some(id.index) {
                return Err(Error::Initialization {
                    reason: format!("stream {id} refused"),
                });
            }
            let broken = self.broken_calls.load(Ordering::SeqCst);
            let fails = self.fail_call == Some(id.index);
            Ok(OpenStream::spawn(id, 8, move |mut items| async move {
                if broken {
                    return Err(Error::Transport {
                        context: String::from("reset by peer"),
                    });
                }
                let mut received = 0;
                while items.next().await.is_some() {
                    received += 1;
                }
                if fails {
                    return Err(Error::Transport {
                        context: format!("stream {id} lost its summary"),
                    });
                }
                Ok(IngestionSummary::completed(received, 0))
            }))
        }
    }

    pub(crate) fn pool(size: usize) -> StreamPool<LocalConnector> {
        StreamPool::new(LocalConnector::default(), size)
    }

    /// Resets `pool` while `fut` is parked on the pool lock, after `fut` has
    /// already seen the pool as initialized.
    pub(crate) async fn reset_while_waiting<C, F>(pool: &StreamPool<C>, fut: F) -> F::Output
    where
        C: Connector,
        F: Future,
    {
        let mut state = pool.state.lock().await;
        let mut fut = pin!(fut);
        assert!(fut.as_mut().now_or_never().is_none());
        let _ = pool.cleanup_locked(&mut state).await;
        drop(state);
        fut.await
    }

    #[tokio::test]
    async fn round_robin_over_the_pool() {
        let pool = pool(3);
        let mut indices = Vec::new();
        for _ in 0..7 {
            indices.push(pool.get_stream().await.unwrap().id().index);
        }
        assert_eq!(indices, [0, 1, 2, 0, 1, 2, 0]);
    }

    #[tokio::test]
    async fn each_handle_once_per_rotation() {
        let pool = pool(6);
        let mut first: Vec<_> = Vec::new();
        for _ in 0..6 {
            first.push(pool.get_stream().await.unwrap().id());
        }
        let mut sorted = first.clone();
        sorted.sort();
        sorted.dedup();
        assert_eq!(sorted.len(), 6);
        assert_eq!(pool.get_stream().await.unwrap().id(), first[0]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 8)]
    async fn concurrent_initialize_connects_once() {
        let pool = Arc::new(pool(4));
        let tasks: Vec<_> = (0..16)
            .map(|_| {
                let pool = Arc::clone(&pool);
                tokio::spawn(async move { pool.initialize().await })
            })
            .collect();
        for task in tasks {
            task.await.unwrap().unwrap();
        }
        assert_eq!(pool.connector.connects.load(Ordering::SeqCst), 1);
        assert!(pool.is_healthy().await);
    }

    #[tokio::test]
    async fn cleanup_collects_summaries_and_is_idempotent() {
        let pool = pool(2);
        for _ in 0..5 {
            let handle = pool.get_stream().await.unwrap();
            handle.write(Default::default()).await.unwrap();
        }

        let responses = pool.cleanup().await;
        let received: Vec<_> = responses
            .into_iter()
            .map(|r| r.unwrap().received)
            .collect();
        assert_eq!(received, [3, 2]);
        assert!(!pool.is_initialized());
        assert!(!pool.is_healthy().await);

        assert!(pool.cleanup().await.is_empty());
    }

    #[tokio::test]
    async fn failed_connect_leaves_pool_reusable() {
        let pool = pool(2);
        pool.connector.refuse.store(true, Ordering::SeqCst);

        let err = pool.initialize().await.unwrap_err();
        assert!(matches!(err, Error::Initialization { .. }));
        assert!(!pool.is_initialized());
        assert!(pool.get_stream().await.is_err());

        pool.connector.refuse.store(false, Ordering::SeqCst);
        assert!(pool.get_stream().await.is_ok());
        assert!(pool.is_initialized());
    }

    #[tokio::test]
    async fn failed_stream_tears_down_partial_setup() {
        let pool = StreamPool::new(
            LocalConnector {
                fail_stream: Some(2),
                ..Default::default()
            },
            4,
        );

        let err = pool.initialize().await.unwrap_err();
        assert!(err.to_string().contains("refused"));
        assert!(!pool.is_initialized());
        assert!(!pool.is_healthy().await);
        assert!(pool.cleanup().await.is_empty());
    }

    #[tokio::test]
    async fn reset_forces_a_new_generation() {
        let pool = pool(3);
        let before = pool.get_stream().await.unwrap().id();
        assert_eq!(before.generation, 1);

        pool.reset_connection().await;
        assert!(!pool.is_initialized());

        let after = pool.get_stream().await.unwrap().id();
        assert_eq!(after.generation, 2);
        assert_eq!(after.index, 0);
        assert_ne!(before, after);
        assert_eq!(pool.connector.connects.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn ended_call_makes_pool_unhealthy() {
        let pool = pool(2);
        pool.connector.broken_calls.store(true, Ordering::SeqCst);
        pool.initialize().await.unwrap();

        let handle = pool.get_stream().await.unwrap();
        while !handle.is_closed() {
            tokio::task::yield_now().await;
        }
        assert!(!pool.is_healthy().await);
        assert!(pool.is_initialized());
    }

    #[tokio::test]
    async fn cleanup_does_not_wait_for_held_handles() {
        let pool = pool(2);
        let held = pool.get_stream().await.unwrap();
        held.write(Default::default()).await.unwrap();

        let responses = tokio::time::timeout(Duration::from_secs(3), pool.cleanup())
            .await
            .expect("cleanup waited on a held handle");
        let received: Vec<_> = responses
            .into_iter()
            .map(|r| r.unwrap().received)
            .collect();
        assert_eq!(received, [1, 0]);

        assert!(held.is_closed());
        assert!(held.write(Default::default()).await.is_err());

        // The pool lock is free again.
        assert_eq!(pool.get_stream().await.unwrap().id().generation, 2);
    }

    #[tokio::test]
    async fn cleanup_tolerates_one_failed_stream() {
        let pool = StreamPool::new(
            LocalConnector {
                fail_call: Some(1),
                ..Default::default()
            },
            3,
        );
        for _ in 0..7 {
            let handle = pool.get_stream().await.unwrap();
            handle.write(Default::default()).await.unwrap();
        }

        let responses = pool.cleanup().await;
        assert_eq!(responses.len(), 3);
        assert_eq!(responses[0].as_ref().unwrap().received, 3);
        assert!(matches!(responses[1], Err(Error::Transport { .. })));
        assert_eq!(responses[2].as_ref().unwrap().received, 2);
        assert!(!pool.is_initialized());
    }
}
