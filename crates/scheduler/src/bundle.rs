//! Compile bundles: the per-attempt snapshot of everything one node needs.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use derive_more::Constructor;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::{
    inputs::UniqueCompileInputs,
    project::{Project, ProjectDag},
    registry::LastSuccessfulResult,
    reporter::{BuildLogger, Reporter},
    results::{BundleProducts, CompileAnalysis},
};

/// What bundle setup is given for one node.
#[derive(Debug)]
pub struct BundleInputs {
    /// The project to set up.
    pub project: Arc<Project>,
    /// The sub-DAG rooted at this node.
    pub dag: Arc<ProjectDag>,
    /// Products of the upstream projects this node depends on, keyed by
    /// project id.
    pub dependent_products: HashMap<String, BundleProducts>,
}

/// Bundle setup failed; the node becomes a localized partial failure and
/// sibling work continues.
#[derive(Debug, Clone, Error)]
#[error("bundle setup failed: {0}")]
pub struct SetupError(pub String);

/// Builds a [`CompileBundle`] for one attempt.
///
/// Supplied by the caller: setup is where sources are scanned, input
/// fingerprints computed, and per-attempt output directories allocated. The
/// read-only and new classes directories must be distinct paths for every
/// attempt.
#[async_trait]
pub trait BundleSetup: Send + Sync {
    /// Produces the snapshot needed to compile one node.
    async fn setup(&self, inputs: BundleInputs) -> Result<CompileBundle, SetupError>;
}

/// The classes directories of one attempt.
#[derive(Debug, Clone, Constructor)]
pub struct CompileOutPaths {
    /// The stable directory dependents may read while this attempt runs.
    pub read_only_classes_dir: std::path::PathBuf,
    /// The directory this attempt writes. Distinct from the read-only one.
    pub new_classes_dir: std::path::PathBuf,
}

/// The client's cached view of the previous compilation result.
///
/// `Empty` means the client has no validated analysis for the project, in
/// which case the scheduler must not seed the compiler with one either.
#[derive(Debug, Clone, Default)]
pub enum LatestResult {
    /// No validated previous result.
    #[default]
    Empty,
    /// A previously validated analysis.
    Previous(Arc<CompileAnalysis>),
}

impl LatestResult {
    /// Whether the client has no validated previous result.
    pub const fn is_empty(&self) -> bool {
        matches!(self, Self::Empty)
    }
}

/// Everything one compilation attempt needs, snapshotted before dispatch.
#[derive(Clone)]
pub struct CompileBundle {
    /// The project being compiled.
    pub project: Arc<Project>,
    /// The deduplication key of this attempt.
    pub unique_inputs: UniqueCompileInputs,
    /// The client's diagnostics sink.
    pub reporter: Arc<dyn Reporter>,
    /// The client's log sink.
    pub logger: Arc<dyn BuildLogger>,
    /// The client's cached previous result.
    pub latest_result: LatestResult,
    /// The client's cached last-successful handle, used as the fallback when
    /// the registry has no current entry for the project.
    pub last_successful: Arc<LastSuccessfulResult>,
    /// Cancels this attempt.
    pub cancel: CancellationToken,
    /// The attempt's classes directories.
    pub out: CompileOutPaths,
}

impl fmt::Debug for CompileBundle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompileBundle")
            .field("project", &self.project.name)
            .field("unique_inputs", &self.unique_inputs)
            .field("latest_result", &self.latest_result)
            .field("out", &self.out)
            .finish_non_exhaustive()
    }
}
