//! Reporter and logger collaborator contracts.
//!
//! User-visible compilation outcomes are structured events through a
//! [`Reporter`], never exceptions: every attempt produces exactly one start
//! event and at least one end event, and diagnostics flow through
//! [`Reporter::report_problem`]. Sinks are caller-supplied; the scheduler
//! only wraps them with mirroring observers so deduplicated clients can
//! replay the exact event sequence later.

use std::path::PathBuf;
use std::sync::Arc;

use derive_more::Display;
use thiserror::Error;

use crate::{
    mirror::{CompilationEvent, EventMirror},
    project::Project,
};

/// A compiler diagnostic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Problem {
    /// How severe the diagnostic is.
    pub severity: ProblemSeverity,
    /// The rendered message.
    pub message: String,
    /// The source file the diagnostic points at, when known.
    pub source_path: Option<PathBuf>,
    /// The 1-based line the diagnostic points at, when known.
    pub line: Option<u32>,
}

impl Problem {
    /// Creates an error-severity problem with just a message.
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            severity: ProblemSeverity::Error,
            message: message.into(),
            source_path: None,
            line: None,
        }
    }
}

/// Severity of a [`Problem`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum ProblemSeverity {
    /// Compilation cannot succeed.
    #[display("error")]
    Error,
    /// Suspicious but not fatal.
    #[display("warning")]
    Warning,
    /// Informational.
    #[display("info")]
    Info,
}

/// Terminal status carried by an end-of-compilation event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum CompileStatus {
    /// The compilation produced products.
    #[display("ok")]
    Ok,
    /// The compiler reported problems.
    #[display("failed")]
    Failed,
    /// The compilation was cancelled by the user or by stall detection.
    #[display("cancelled")]
    Cancelled,
    /// The compilation never ran because an upstream project failed.
    #[display("blocked")]
    Blocked,
    /// The scheduler itself failed.
    #[display("global-error")]
    GlobalError,
}

/// Log verbosity of a [`BuildLogger`] line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum LogLevel {
    /// Diagnostic chatter.
    #[display("debug")]
    Debug,
    /// Progress information.
    #[display("info")]
    Info,
    /// Something surprising but survivable.
    #[display("warn")]
    Warn,
    /// Something went wrong.
    #[display("error")]
    Error,
}

/// A reporter sink rejected an event.
#[derive(Debug, Clone, Error)]
#[error("reporter failed: {0}")]
pub struct ReporterError(pub String);

/// The client-facing diagnostics sink.
///
/// Implementations translate events into the client protocol (BSP
/// notifications, console output). Methods are synchronous; sinks that talk
/// to sockets are expected to enqueue internally.
pub trait Reporter: Send + Sync {
    /// A compilation attempt for `project` started.
    fn report_start(&self, project: &Project) -> Result<(), ReporterError>;

    /// The compiler emitted a diagnostic for `project`.
    fn report_problem(&self, project: &Project, problem: &Problem) -> Result<(), ReporterError>;

    /// Baseline diagnostics carried over from a previous analysis, delivered
    /// to a late subscriber before live events are replayed.
    fn report_previous_problems(
        &self,
        project: &Project,
        problems: &[Problem],
    ) -> Result<(), ReporterError>;

    /// A compilation attempt for `project` finished with `status`.
    fn report_end(&self, project: &Project, status: CompileStatus) -> Result<(), ReporterError>;
}

/// The client-facing log sink.
pub trait BuildLogger: Send + Sync {
    /// Emits one log line.
    fn log(&self, level: LogLevel, message: &str);
}

/// Tees every reporter action into the event mirror before forwarding it to
/// the owning client's sink.
///
/// Producer-side sink errors are logged and swallowed: a broken client
/// connection must not fail the compilation other clients are waiting on.
pub(crate) struct ObservedReporter {
    inner: Arc<dyn Reporter>,
    mirror: Arc<EventMirror>,
}

impl ObservedReporter {
    pub(crate) fn new(inner: Arc<dyn Reporter>, mirror: Arc<EventMirror>) -> Self {
        Self { inner, mirror }
    }

    fn forward(&self, project: &Project, result: Result<(), ReporterError>) {
        if let Err(err) = result {
            warn!(target: "scheduler", project = %project.name, %err, "Reporter sink rejected event");
        }
    }
}

impl std::fmt::Debug for ObservedReporter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObservedReporter").finish_non_exhaustive()
    }
}

impl Reporter for ObservedReporter {
    fn report_start(&self, project: &Project) -> Result<(), ReporterError> {
        self.mirror.publish(CompilationEvent::Started { project: project.name.clone() });
        self.forward(project, self.inner.report_start(project));
        Ok(())
    }

    fn report_problem(&self, project: &Project, problem: &Problem) -> Result<(), ReporterError> {
        self.mirror.publish(CompilationEvent::Problem {
            project: project.name.clone(),
            problem: problem.clone(),
        });
        self.forward(project, self.inner.report_problem(project, problem));
        Ok(())
    }

    fn report_previous_problems(
        &self,
        project: &Project,
        problems: &[Problem],
    ) -> Result<(), ReporterError> {
        // Baseline problems are per-subscriber state, not part of the shared
        // event sequence; they are never mirrored.
        self.forward(project, self.inner.report_previous_problems(project, problems));
        Ok(())
    }

    fn report_end(&self, project: &Project, status: CompileStatus) -> Result<(), ReporterError> {
        self.mirror.publish(CompilationEvent::Ended { project: project.name.clone(), status });
        self.forward(project, self.inner.report_end(project, status));
        Ok(())
    }
}

/// Tees every log line into the event mirror before forwarding it.
pub(crate) struct ObservedLogger {
    inner: Arc<dyn BuildLogger>,
    mirror: Arc<EventMirror>,
}

impl ObservedLogger {
    pub(crate) fn new(inner: Arc<dyn BuildLogger>, mirror: Arc<EventMirror>) -> Self {
        Self { inner, mirror }
    }
}

impl std::fmt::Debug for ObservedLogger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObservedLogger").finish_non_exhaustive()
    }
}

impl BuildLogger for ObservedLogger {
    fn log(&self, level: LogLevel, message: &str) {
        self.mirror.publish(CompilationEvent::Log { level, message: message.to_string() });
        self.inner.log(level, message);
    }
}
