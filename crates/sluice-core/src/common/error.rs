//! Error types for the ingestion service and its client pool.
//!
//! This module defines the central `Error` enum, which captures the failures
//! that cross a component boundary. It implements `From<Error>` for
//! `tonic::Status` so server-side errors propagate to clients with appropriate
//! status codes and messages.
//!
//! Expected outcomes such as a full admission queue or an elapsed batch
//! deadline are not errors and never appear here.
//!
//! ## Error Cases
//! - `ChannelError`: An internal communication failure between tasks.
//! - `Initialization`: The client pool could not establish its channel or
//!   streams.
//! - `InitTimeout`: Opportunistic pool initialization did not finish in time.
//! - `Transport`: A write or RPC on an established stream failed.
//! - `ServiceShutdown`: A request arrived while the service was shutting down.

use tonic::Status;

pub type Result<T> = core::result::Result<T, Error>;

/// Unified error type for the ingestion service.
#[derive(Clone, thiserror::Error, Debug)]
pub enum Error {
    /// Internal channel send/receive failure (e.g., closed channel).
    #[error("Channel error: {context}")]
    ChannelError { context: String },

    /// Channel or stream setup failed; nothing acquired was kept.
    #[error("Initialization failed: {reason}")]
    Initialization { reason: String },

    /// Opportunistic initialization exceeded its time box.
    #[error("Initialization timed out")]
    InitTimeout,

    /// A write or call on an established stream failed.
    #[error("Transport error: {context}")]
    Transport { context: String },

    /// The service is in the process of shutting down.
    #[error("Service is shutting down")]
    ServiceShutdown,
}

impl From<Status> for Error {
    fn from(status: Status) -> Self {
        Error::Transport {
            context: format!("{:?}: {}", status.code(), status.message()),
        }
    }
}

impl From<Error> for Status {
    fn from(err: Error) -> Self {
        match err {
            Error::ChannelError { context } => {
                Status::internal(format!("Channel error: {}", context))
            }
            Error::Initialization { reason } => Status::unavailable(reason),
            Error::InitTimeout => Status::deadline_exceeded("Initialization timed out"),
            Error::Transport { context } => Status::unavailable(context),
            Error::ServiceShutdown => Status::unavailable("Service is shutting down"),
        }
    }
}
