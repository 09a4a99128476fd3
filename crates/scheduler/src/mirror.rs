//! The event mirror: a multicast, FIFO, replayable-from-start stream of
//! reporter and logger actions.
//!
//! The producing compilation appends events through its observed sinks; any
//! number of late subscribers open cursors that replay the log from the very
//! beginning and then follow the live tail. Subscribers hold read cursors
//! only; the sink side belongs to the producing compilation, and closing it
//! is what lets replay loops terminate.

use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::Notify;

use crate::reporter::{CompileStatus, LogLevel, Problem};

/// One reporter/logger action, as observed by the event mirror.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CompilationEvent {
    /// A compilation attempt started.
    Started {
        /// Name of the project being compiled.
        project: String,
    },
    /// The compiler emitted a diagnostic.
    Problem {
        /// Name of the project being compiled.
        project: String,
        /// The diagnostic.
        problem: Problem,
    },
    /// The build logger emitted a line.
    Log {
        /// Verbosity of the line.
        level: LogLevel,
        /// The line itself.
        message: String,
    },
    /// A compilation attempt ended.
    Ended {
        /// Name of the project being compiled.
        project: String,
        /// Terminal status of the attempt.
        status: CompileStatus,
    },
}

#[derive(Debug, Default)]
struct MirrorState {
    events: Vec<CompilationEvent>,
    closed: bool,
}

/// The shared event log of one running compilation.
#[derive(Debug, Default)]
pub struct EventMirror {
    state: Mutex<MirrorState>,
    notify: Notify,
}

impl EventMirror {
    /// Creates an empty, open mirror.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends an event to the log and wakes waiting cursors.
    ///
    /// Events published after [`EventMirror::close`] are dropped; the
    /// producing compilation has already emitted its end event by then.
    pub fn publish(&self, event: CompilationEvent) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if state.closed {
            return;
        }
        state.events.push(event);
        drop(state);
        self.notify.notify_waiters();
    }

    /// Closes the mirror; cursors drain the remaining events and terminate.
    pub fn close(&self) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.closed = true;
        drop(state);
        self.notify.notify_waiters();
    }

    /// Number of events appended so far.
    pub fn len(&self) -> usize {
        self.state.lock().unwrap_or_else(PoisonError::into_inner).events.len()
    }

    /// Whether no event has been appended yet.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A subscriber's read position into an [`EventMirror`].
#[derive(Debug)]
pub struct MirrorCursor {
    mirror: Arc<EventMirror>,
    position: usize,
}

impl MirrorCursor {
    /// Opens a cursor replaying `mirror` from the very first event.
    pub fn from_start(mirror: Arc<EventMirror>) -> Self {
        Self { mirror, position: 0 }
    }

    /// Returns the next event in append order, waiting for the producer when
    /// the cursor has caught up. Returns `None` once the mirror is closed and
    /// fully drained.
    pub async fn next(&mut self) -> Option<CompilationEvent> {
        loop {
            // Arm the notification before checking state so a publish racing
            // with the check cannot be missed.
            let notified = self.mirror.notify.notified();
            {
                let state = self.mirror.state.lock().unwrap_or_else(PoisonError::into_inner);
                if self.position < state.events.len() {
                    let event = state.events[self.position].clone();
                    self.position += 1;
                    return Some(event);
                }
                if state.closed {
                    return None;
                }
            }
            notified.await;
        }
    }
}
