//! The two-executor scheduling model.

use tokio::runtime::Handle;

/// The pair of executors the scheduler spawns onto.
///
/// `compute` is expected to be bounded (CPU-count sized) and runs compilation
/// transformations and DAG composition. `io` runs everything that may block
/// indefinitely: awaiting another client's compilation, event replay, disk
/// deletion, and background population of classes directories. Cross
/// compilation waits must never land on `compute`, otherwise a handful of
/// deduplicated clients can starve the compiler itself.
#[derive(Debug, Clone)]
pub struct Executors {
    /// Bounded executor for compilation work.
    pub compute: Handle,
    /// Unbounded executor for blocking-style waits.
    pub io: Handle,
}

impl Executors {
    /// Creates an executor pair from explicit runtime handles.
    pub const fn new(compute: Handle, io: Handle) -> Self {
        Self { compute, io }
    }

    /// Uses the current tokio runtime for both roles.
    ///
    /// Suitable for tests and for embedders that already size their runtime
    /// for mixed workloads.
    ///
    /// # Panics
    ///
    /// Panics when called outside a tokio runtime, like [`Handle::current`].
    pub fn current() -> Self {
        let handle = Handle::current();
        Self { compute: handle.clone(), io: handle }
    }
}
