//! Transport seam of the stream pool.
//!
//! A [`Connector`] knows how to reach the server and how to open one
//! client-streaming call over an established connection. [`GrpcConnector`] is
//! the tonic implementation; tests plug in in-process connectors.

use super::handle::{HandleId, OpenStream, WorkStream};
use crate::config::ClientConfig;
use sluice_core::{
    Error,
    proto::{WorkItem, ingestion_client::IngestionClient},
};
use std::net::SocketAddr;
use tonic::transport::{Channel, Endpoint};

#[tonic::async_trait]
pub trait Connector: Send + Sync + 'static {
    /// Established transport shared by all streams of one pool generation.
    type Connection: Send + Sync + 'static;

    /// Establishes the transport.
    async fn connect(&self) -> Result<Self::Connection, Error>;

    /// Opens one client-streaming call over `conn`.
    async fn open_stream(&self, conn: &Self::Connection, id: HandleId)
    -> Result<OpenStream, Error>;
}

/// Connects to every replica behind the configured address.
#[derive(Clone, Debug)]
pub struct GrpcConnector {
    config: ClientConfig,
}

impl GrpcConnector {
    pub fn new(config: ClientConfig) -> Self {
        Self { config }
    }

    async fn resolve(&self) -> Result<Vec<SocketAddr>, Error> {
        let mut addrs: Vec<SocketAddr> = tokio::net::lookup_host(&self.config.server_addr)
            .await
            .map_err(|e| Error::Initialization {
                reason: format!("failed to resolve {}: {e}", self.config.server_addr),
            })?
            .collect();
        addrs.sort_unstable();
        addrs.dedup();

        if addrs.is_empty() {
            return Err(Error::Initialization {
                reason: format!("{} resolved to no addresses", self.config.server_addr),
            });
        }
        Ok(addrs)
    }

    async fn connect_replica(&self, addr: SocketAddr) -> Result<Channel, Error> {
        let endpoint = Endpoint::from_shared(format!("http://{addr}"))
            .map_err(|e| Error::Initialization {
                reason: format!("invalid endpoint {addr}: {e}"),
            })?
            .connect_timeout(self.config.connect_timeout)
            .http2_keep_alive_interval(self.config.keepalive_interval)
            .keep_alive_timeout(self.config.keepalive_timeout)
            .keep_alive_while_idle(true);

        endpoint.connect().await.map_err(|e| Error::Initialization {
            reason: format!("failed to connect to {addr}: {e}"),
        })
    }
}

/// One client stub per reachable replica.
#[derive(Clone, Debug)]
pub struct GrpcConnection {
    replicas: Vec<IngestionClient<Channel>>,
}

impl GrpcConnection {
    pub fn replicas(&self) -> usize {
        self.replicas.len()
    }
}

#[tonic::async_trait]
impl Connector for GrpcConnector {
    type Connection = GrpcConnection;

    /// Resolves the address and connects to each replica eagerly.
    ///
    /// Unreachable replicas are skipped with a warning; the connection fails
    /// only if none can be reached.
    async fn connect(&self) -> Result<GrpcConnection, Error> {
        let addrs = self.resolve().await?;
        let mut replicas = Vec::with_capacity(addrs.len());
        let mut last_error = None;

        for addr in addrs {
            match self.connect_replica(addr).await {
                Ok(channel) => {
                    tracing::debug!("Connected to replica {addr}");
                    replicas.push(
                        IngestionClient::new(channel)
                            .max_encoding_message_size(self.config.max_message_size)
                            .max_decoding_message_size(self.config.max_message_size),
                    );
                }
                Err(e) => {
                    tracing::warn!("Skipping replica: {e}");
                    last_error = Some(e);
                }
            }
        }

        match (replicas.is_empty(), last_error) {
            (true, Some(e)) => Err(e),
            _ => Ok(GrpcConnection { replicas }),
        }
    }

    /// Opens stream `id.index` on replica `id.index % replicas`.
    async fn open_stream(
        &self,
        conn: &GrpcConnection,
        id: HandleId,
    ) -> Result<OpenStream, Error> {
        let mut client = conn
            .replicas
            .get(id.index % conn.replicas.len().max(1))
            .cloned()
            .ok_or_else(|| Error::Initialization {
                reason: String::from("no replica to open a stream on"),
            })?;

        Ok(OpenStream::spawn(
            id,
            self.config.stream_buffer_size,
            move |items| async move {
                let response = client.stream_work(CallStream(items)).await?;
                Ok(response.into_inner())
            },
        ))
    }
}

/// Pass-through wrapper around [`WorkStream`]. A concrete, non-generic stream
/// type lets rustc prove the tonic call future `Send`; awaiting it on the
/// boxed `dyn Stream` directly hits a higher-ranked lifetime error.
struct CallStream(WorkStream);

impl futures::Stream for CallStream {
    type Item = WorkItem;

    fn poll_next(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Option<Self::Item>> {
        self.0.as_mut().poll_next(cx)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.0.size_hint()
    }
}
