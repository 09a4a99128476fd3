//! Scheduler-internal error classification.
//!
//! Errors carry a severity that decides how the traversal reacts: localized
//! errors poison a single node, blocking errors poison the node and its
//! transitive dependents, and fatal errors indicate a broken scheduler
//! invariant.

use std::time::Duration;

use derive_more::Display;
use thiserror::Error;

use crate::{bundle::SetupError, reporter::ReporterError};

/// How far an error is allowed to propagate.
#[derive(Debug, PartialEq, Eq, Display, Clone, Copy)]
pub enum ErrorSeverity {
    /// Affects one node of one client; sibling work continues.
    #[display("localized")]
    Localized,
    /// Blocks the node and everything depending on it.
    #[display("blocking")]
    Blocking,
    /// A scheduler invariant is broken; nothing can be trusted.
    #[display("fatal")]
    Fatal,
}

/// The interface for a classified scheduler error.
pub trait SchedulerTaskError {
    /// The severity of the error.
    fn severity(&self) -> ErrorSeverity;
}

impl SchedulerTaskError for SetupError {
    fn severity(&self) -> ErrorSeverity {
        // Setup failures are localized to their leaf by design of the
        // bundle contract.
        ErrorSeverity::Localized
    }
}

/// An error observed while replaying mirrored events to a late subscriber.
#[derive(Debug, Error)]
pub enum ReplayError {
    /// The producing compilation emitted no event for the whole
    /// disconnection timeout.
    #[error("no event observed from the producing compilation for {elapsed:?}")]
    Disconnected {
        /// How long the subscriber waited.
        elapsed: Duration,
    },
    /// The subscriber's own reporter rejected a replayed event.
    #[error(transparent)]
    Reporter(#[from] ReporterError),
}

impl SchedulerTaskError for ReplayError {
    fn severity(&self) -> ErrorSeverity {
        match self {
            // A disconnect re-dispatches; only this client's wait is affected.
            Self::Disconnected { .. } => ErrorSeverity::Localized,
            Self::Reporter(_) => ErrorSeverity::Localized,
        }
    }
}
