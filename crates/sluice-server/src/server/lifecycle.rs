//! Bounded server exit.
//!
//! Graceful HTTP/2 shutdown waits for every open call to finish, and a
//! client-streaming call only finishes when its producer stops writing.
//! [`serve_with_grace`] caps that wait.

use core::{future::Future, time::Duration};
use tokio_util::sync::CancellationToken;

/// How the serve future ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ServeExit {
    /// Every connection closed on its own.
    Drained,
    /// The grace period ran out with calls still open.
    Forced,
}

/// Drives `serve` to completion, but gives up `grace` after `shutdown` is
/// cancelled. Open calls are dropped on a forced exit.
///
/// # Errors
///
/// Returns whatever error `serve` resolves to.
pub async fn serve_with_grace<F, E>(
    serve: F,
    shutdown: &CancellationToken,
    grace: Duration,
) -> Result<ServeExit, E>
where
    F: Future<Output = Result<(), E>>,
{
    let deadline = async {
        shutdown.cancelled().await;
        tokio::time::sleep(grace).await;
    };

    tokio::select! {
        result = serve => result.map(|()| ServeExit::Drained),
        () = deadline => {
            tracing::warn!("Open streams still running after {grace:?}, forcing shutdown");
            Ok(ServeExit::Forced)
        }
    }
}
