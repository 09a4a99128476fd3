//! Memoized task plumbing.

use futures::{
    FutureExt,
    future::{BoxFuture, Shared},
};
use std::future::Future;

/// A lazily-evaluated, memoized task.
///
/// The first poll drives the underlying future; every later subscriber (and
/// every re-poll of a clone) observes the same cached output. This is the
/// shape every cross-client result in the scheduler takes: compile results,
/// populating-products chains, java signals.
pub type SharedTask<T> = Shared<BoxFuture<'static, T>>;

/// Memoizes a future into a [`SharedTask`].
pub fn memoize<F, T>(future: F) -> SharedTask<T>
where
    F: Future<Output = T> + Send + 'static,
    T: Clone + Send + Sync + 'static,
{
    future.boxed().shared()
}

/// A [`SharedTask`] that is already complete.
pub fn ready_task<T>(value: T) -> SharedTask<T>
where
    T: Clone + Send + Sync + 'static,
{
    memoize(std::future::ready(value))
}

/// Returns the output of a memoized task if it has already completed.
pub fn peek<T>(task: &SharedTask<T>) -> Option<T>
where
    T: Clone + Send + Sync + 'static,
{
    task.clone().now_or_never()
}
