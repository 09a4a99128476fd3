//! Compilation outcomes, per-node partial results, and the products
//! dependents consume.

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use futures::future::BoxFuture;
use kiln_graph::Dag;
use thiserror::Error;

use crate::{
    bundle::CompileBundle,
    oracle::Signatures,
    project::Project,
    promise::Promise,
    reporter::{CompileStatus, Problem},
    task::{SharedTask, ready_task},
};

/// A DAG of per-node outcomes, shape-identical to the input project DAG.
pub type ResultDag = Dag<PartialCompileResult>;

/// The analysis handle produced by a successful compilation.
///
/// The scheduler never inspects analysis contents beyond the diagnostics it
/// replays to late subscribers; everything else is carried opaquely for the
/// compiler's incremental state.
#[derive(Debug, Clone, Default)]
pub struct CompileAnalysis {
    /// Diagnostics that were still standing when the analysis was produced.
    pub problems: Vec<Problem>,
}

impl CompileAnalysis {
    /// Creates an analysis handle carrying the given standing diagnostics.
    pub const fn new(problems: Vec<Problem>) -> Self {
        Self { problems }
    }
}

/// Populates an externally visible classes directory from freshly produced
/// products. Supplied by the compiler with its products.
pub trait ProductsPopulator: Send + Sync {
    /// Copies or links the products into `target`. Runs on the io executor.
    fn populate(&self, target: PathBuf) -> BoxFuture<'static, ()>;
}

/// A populator for products that need no population.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopPopulator;

impl ProductsPopulator for NoopPopulator {
    fn populate(&self, _target: PathBuf) -> BoxFuture<'static, ()> {
        Box::pin(std::future::ready(()))
    }
}

/// What a successful compilation hands to its dependents.
#[derive(Clone)]
pub struct CompileProducts {
    /// The classes directory the compilation read as its stable input view.
    pub read_only_classes_dir: PathBuf,
    /// The classes directory the compilation wrote.
    pub new_classes_dir: PathBuf,
    /// The analysis produced by this compilation.
    pub analysis: Arc<CompileAnalysis>,
    /// Macro symbols defined by this project.
    pub defined_macro_symbols: Vec<String>,
    /// Populates client-facing classes directories in the background.
    pub populator: Arc<dyn ProductsPopulator>,
}

impl fmt::Debug for CompileProducts {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompileProducts")
            .field("read_only_classes_dir", &self.read_only_classes_dir)
            .field("new_classes_dir", &self.new_classes_dir)
            .field("defined_macro_symbols", &self.defined_macro_symbols)
            .finish_non_exhaustive()
    }
}

/// The terminal outcome of one compilation attempt.
#[derive(Debug, Clone)]
pub enum Compiled {
    /// The compiler produced products.
    Ok(CompileProducts),
    /// The attempt was cancelled by the user or by stall detection.
    Cancelled,
    /// The compiler reported problems.
    Failed(Vec<Problem>),
    /// The attempt never ran because upstream projects failed.
    Blocked(Vec<String>),
    /// The scheduler itself failed.
    GlobalError(String),
}

impl Compiled {
    /// Whether this outcome carries products.
    pub const fn is_ok(&self) -> bool {
        matches!(self, Self::Ok(_))
    }

    /// The products, when successful.
    pub const fn products(&self) -> Option<&CompileProducts> {
        match self {
            Self::Ok(products) => Some(products),
            _ => None,
        }
    }

    /// The reporter status equivalent of this outcome.
    pub const fn status(&self) -> CompileStatus {
        match self {
            Self::Ok(_) => CompileStatus::Ok,
            Self::Cancelled => CompileStatus::Cancelled,
            Self::Failed(_) => CompileStatus::Failed,
            Self::Blocked(_) => CompileStatus::Blocked,
            Self::GlobalError(_) => CompileStatus::GlobalError,
        }
    }
}

/// The per-project result every subscriber of a compilation observes.
#[derive(Clone)]
pub struct ResultBundle {
    /// The project this result belongs to.
    pub project: Arc<Project>,
    /// The terminal outcome.
    pub compiled: Compiled,
    /// Completes once the products (and any superseded-directory cleanup)
    /// have been fully materialized. Dependents await this before reading
    /// the classes directory.
    pub populating: SharedTask<()>,
}

impl ResultBundle {
    /// Builds a result with an already-complete populating task.
    pub fn immediate(project: Arc<Project>, compiled: Compiled) -> Self {
        Self { project, compiled, populating: ready_task(()) }
    }

    /// Builds a cancelled result.
    pub fn cancelled(project: Arc<Project>) -> Self {
        Self::immediate(project, Compiled::Cancelled)
    }

    /// Replaces a successful outcome with a global error, leaving failures
    /// untouched. Used when event replay fails for a deduplicated client:
    /// that client must not act on products whose diagnostics it never saw.
    #[must_use]
    pub fn demote_success(&self, message: &str) -> Self {
        match &self.compiled {
            Compiled::Ok(_) => Self {
                project: Arc::clone(&self.project),
                compiled: Compiled::GlobalError(message.to_string()),
                populating: self.populating.clone(),
            },
            _ => self.clone(),
        }
    }
}

impl fmt::Debug for ResultBundle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResultBundle")
            .field("project", &self.project.name)
            .field("compiled", &self.compiled)
            .finish_non_exhaustive()
    }
}

/// A finished pipelined compilation, as published through its promise.
pub type FinishedCompilation = Result<CompileProducts, String>;

/// The promise handles a pipelined compilation exposes to its downstreams.
#[derive(Debug, Clone)]
pub struct PipelineHandles {
    /// Completed when type signatures are ready.
    pub signatures: Promise<Signatures>,
    /// Completed when the compilation fully finishes.
    pub finished: Promise<FinishedCompilation>,
    /// Completed when the Java phase finishes.
    pub java_completed: Promise<()>,
}

/// What dependents are given for one upstream project.
#[derive(Debug, Clone)]
pub enum BundleProducts {
    /// The upstream is still compiling; only its directory layout and macro
    /// symbols are known.
    Partial(PartialProducts),
    /// The upstream finished; full products are available.
    Complete(CompileProducts),
}

/// Directory layout of an upstream whose compilation has not finished.
#[derive(Debug, Clone)]
pub struct PartialProducts {
    /// The upstream's stable input view.
    pub read_only_classes_dir: PathBuf,
    /// The directory the upstream is writing.
    pub new_classes_dir: PathBuf,
    /// Macro symbols the upstream declared with its signatures.
    pub defined_macro_symbols: Vec<String>,
}

/// The previous incremental state a downstream may resolve for an upstream
/// classes directory. Keyed under both the old read-only dir and the new
/// classes dir, because downstream analysis lookup may use either path.
#[derive(Debug, Clone, Default)]
pub struct PreviousResult {
    /// The upstream analysis, when one exists.
    pub analysis: Option<Arc<CompileAnalysis>>,
}

/// The map of per-path previous results handed to the compiler.
pub type DependentResults = HashMap<PathBuf, PreviousResult>;

/// Why a node failed without a compiler outcome of its own.
#[derive(Debug, Clone, Error)]
pub enum FailureCause {
    /// Upstream projects failed or were blocked.
    #[error("blocked on upstream projects: {}", .0.join(", "))]
    Blocked(Vec<String>),
    /// An upstream signature promise failed or was abandoned.
    #[error("upstream signature promise failed: {}", .0.join(", "))]
    FailedOrCancelledPromise(Vec<String>),
    /// Bundle setup failed.
    #[error("bundle setup failed: {0}")]
    SetupFailed(String),
    /// The compiler reported the failure carried by the result bundle.
    #[error("compilation failed")]
    CompileFailed,
    /// The attempt was cancelled.
    #[error("compilation cancelled")]
    Cancelled,
    /// The scheduler itself failed.
    #[error("{0}")]
    GlobalError(String),
}

impl FailureCause {
    /// The upstream project names carried by blocking causes.
    pub fn blocking_projects(&self) -> &[String] {
        match self {
            Self::Blocked(names) | Self::FailedOrCancelledPromise(names) => names,
            _ => &[],
        }
    }
}

/// Per-node outcome of a traversal.
#[derive(Debug, Clone)]
pub enum PartialCompileResult {
    /// A node carrying no compile work (an aggregate root).
    Empty,
    /// The node was dispatched (or attached to a running compilation).
    Success(PartialSuccess),
    /// The node failed before dispatch.
    Failure(PartialFailure),
    /// An aggregate position collecting several distinct failures.
    Failures(Vec<PartialFailure>),
}

impl PartialCompileResult {
    /// Builds a failure leaf with an immediately resolved result bundle.
    pub fn failure(project: Arc<Project>, cause: FailureCause) -> Self {
        let compiled = match &cause {
            FailureCause::Blocked(names) | FailureCause::FailedOrCancelledPromise(names) => {
                Compiled::Blocked(names.clone())
            }
            FailureCause::Cancelled => Compiled::Cancelled,
            FailureCause::SetupFailed(msg) | FailureCause::GlobalError(msg) => {
                Compiled::GlobalError(msg.clone())
            }
            FailureCause::CompileFailed => Compiled::Failed(Vec::new()),
        };
        let result = ready_task(Arc::new(ResultBundle::immediate(Arc::clone(&project), compiled)));
        Self::Failure(PartialFailure { project, cause, result })
    }

    /// Whether this node (not its children) is a failure.
    pub const fn is_failure(&self) -> bool {
        matches!(self, Self::Failure(_) | Self::Failures(_))
    }

    /// The partial success, when this node was dispatched.
    pub const fn as_success(&self) -> Option<&PartialSuccess> {
        match self {
            Self::Success(success) => Some(success),
            _ => None,
        }
    }

    /// The memoized result task of this node, when it has one.
    pub fn result_task(&self) -> Option<SharedTask<Arc<ResultBundle>>> {
        match self {
            Self::Empty | Self::Failures(_) => None,
            Self::Success(success) => Some(success.result.clone()),
            Self::Failure(failure) => Some(failure.result.clone()),
        }
    }
}

/// A dispatched (or deduplicated) per-node compilation.
#[derive(Clone)]
pub struct PartialSuccess {
    /// The bundle this attempt was set up with.
    pub bundle: Arc<CompileBundle>,
    /// Pipelining handles, present in pipelined traversals.
    pub pipeline: Option<PipelineHandles>,
    /// The memoized result every subscriber shares.
    pub result: SharedTask<Arc<ResultBundle>>,
}

impl fmt::Debug for PartialSuccess {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PartialSuccess")
            .field("project", &self.bundle.project.name)
            .field("pipelined", &self.pipeline.is_some())
            .finish_non_exhaustive()
    }
}

/// A per-node failure that happened before the compiler ran.
#[derive(Clone)]
pub struct PartialFailure {
    /// The failing project.
    pub project: Arc<Project>,
    /// Why the node failed.
    pub cause: FailureCause,
    /// The (already resolved) result bundle for this failure.
    pub result: SharedTask<Arc<ResultBundle>>,
}

impl fmt::Debug for PartialFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PartialFailure")
            .field("project", &self.project.name)
            .field("cause", &self.cause)
            .finish_non_exhaustive()
    }
}

/// Whether a path designates the empty-classes-directory sentinel used for
/// projects that have never compiled successfully.
pub(crate) fn is_empty_sentinel(path: &Path) -> bool {
    path.file_name()
        .and_then(|name| name.to_str())
        .is_some_and(|name| name.starts_with("classes-empty-"))
}
