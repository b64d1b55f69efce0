use core::{fmt, future::Future};
use futures::{StreamExt, stream::BoxStream};
use sluice_core::{
    Error,
    proto::{IngestionSummary, WorkItem},
};
use tokio::{sync::mpsc, task::JoinHandle};
use tokio_util::sync::{CancellationToken, DropGuard};

/// Inbound side of one call: the items written through its handles.
pub type WorkStream = BoxStream<'static, WorkItem>;

/// Identity of one stream within one pool generation.
///
/// `generation` grows on every successful pool initialization, so a handle
/// kept across a reset never compares equal to a fresh one.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HandleId {
    pub generation: u64,
    pub index: usize,
}

impl fmt::Display for HandleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.generation, self.index)
    }
}

/// Write side of one open client-streaming call.
///
/// Handles are cheap clones of the pool's own sender. Closing the stream
/// through the pool ends the call even while clones are still held; their
/// later writes fail.
#[derive(Clone, Debug)]
pub struct StreamHandle {
    id: HandleId,
    tx: mpsc::Sender<WorkItem>,
}

impl StreamHandle {
    pub const fn id(&self) -> HandleId {
        self.id
    }

    /// Queues `item` on the call, waiting while its buffer is full.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Transport`] if the call has already ended.
    pub async fn write(&self, item: WorkItem) -> Result<(), Error> {
        self.tx.send(item).await.map_err(|_| Error::Transport {
            context: format!("stream {} is closed", self.id),
        })
    }

    /// `true` once the call has ended and can take no more writes.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// A stream as held by the pool: the write handle plus the task driving the
/// call, whose output is the server's final summary.
///
/// Dropping it without [`finish`](Self::finish) still closes the call.
pub struct OpenStream {
    handle: StreamHandle,
    response: JoinHandle<Result<IngestionSummary, Error>>,
    closed: DropGuard,
}

impl OpenStream {
    /// Opens a buffered stream and spawns `call` on its inbound side.
    ///
    /// `call` receives the items written through the handle and resolves to
    /// the summary once the stream ends.
    pub fn spawn<F, Fut>(id: HandleId, buffer: usize, call: F) -> Self
    where
        F: FnOnce(WorkStream) -> Fut,
        Fut: Future<Output = Result<IngestionSummary, Error>> + Send + 'static,
    {
        let (tx, rx) = mpsc::channel(buffer);
        let closed = CancellationToken::new();
        let response = tokio::spawn(call(inbound(rx, closed.clone())));
        Self {
            handle: StreamHandle { id, tx },
            response,
            closed: closed.drop_guard(),
        }
    }

    pub fn handle(&self) -> &StreamHandle {
        &self.handle
    }

    /// Signals end-of-writes and waits for the summary.
    ///
    /// Items already buffered are still delivered. Writes through handles
    /// that are still held fail from here on.
    pub async fn finish(self) -> Result<IngestionSummary, Error> {
        let Self {
            handle,
            response,
            closed,
        } = self;
        let id = handle.id;
        drop(closed);
        drop(handle);
        match response.await {
            Ok(result) => result,
            Err(e) => Err(Error::ChannelError {
                context: format!("stream {id} task failed: {e}"),
            }),
        }
    }
}

/// Yields from `rx` until every sender is gone or `closed` fires. On close
/// the channel stops taking writes and the buffered items are drained.
fn inbound(rx: mpsc::Receiver<WorkItem>, closed: CancellationToken) -> WorkStream {
    futures::stream::unfold((rx, closed), |(mut rx, closed)| async move {
        let item = tokio::select! {
            biased;
            item = rx.recv() => item,
            () = closed.cancelled() => {
                rx.close();
                rx.recv().await
            }
        };
        item.map(|item| (item, (rx, closed)))
    })
    .boxed()
}

impl fmt::Debug for OpenStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OpenStream")
            .field("id", &self.handle.id)
            .field("closed", &self.handle.is_closed())
            .finish()
    }
}
