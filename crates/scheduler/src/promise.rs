//! Single-assignment completion cells.
//!
//! Pipelined compilation hands the compiler two write-once cells: one for
//! its type signatures and one for its finished result. The compiler writes
//! exactly once; any number of downstream readers attach and observe the
//! same value. A completer dropped without writing resolves every reader
//! with [`PromiseDropped`], which the traversal classifies as an upstream
//! failure rather than a hang.

use futures::FutureExt;
use thiserror::Error;
use tokio::sync::oneshot;

use crate::task::{SharedTask, memoize};

/// The producer was dropped without completing its promise.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("promise was dropped before completion")]
pub struct PromiseDropped;

/// The write-once side of a promise.
#[derive(Debug)]
pub struct PromiseCompleter<T> {
    tx: oneshot::Sender<T>,
}

impl<T> PromiseCompleter<T> {
    /// Completes the promise, waking every reader.
    ///
    /// Returns the value back when all readers are gone, mirroring
    /// [`oneshot::Sender::send`]; completing an abandoned promise is not an
    /// error the producer can act on.
    pub fn complete(self, value: T) -> Result<(), T> {
        self.tx.send(value)
    }
}

/// The read side of a promise; cheap to clone, all clones observe the same
/// completion.
#[derive(Clone)]
pub struct Promise<T: Clone> {
    shared: SharedTask<Result<T, PromiseDropped>>,
}

impl<T: Clone> std::fmt::Debug for Promise<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Promise").finish_non_exhaustive()
    }
}

impl<T> Promise<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// Waits for the producer to complete the promise.
    pub async fn wait(&self) -> Result<T, PromiseDropped> {
        self.shared.clone().await
    }

    /// Returns the completion if the promise has already resolved.
    pub fn peek(&self) -> Option<Result<T, PromiseDropped>> {
        self.shared.clone().now_or_never()
    }
}

/// Creates a connected completer/reader pair.
pub fn promise<T>() -> (PromiseCompleter<T>, Promise<T>)
where
    T: Clone + Send + Sync + 'static,
{
    let (tx, rx) = oneshot::channel();
    let shared = memoize(async move { rx.await.map_err(|_| PromiseDropped) });
    (PromiseCompleter { tx }, Promise { shared })
}
