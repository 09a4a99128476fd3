//! The compiler collaborator contract.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;

use crate::{
    bundle::CompileBundle,
    oracle::{CompileOracle, JavaSignal, Signatures},
    promise::PromiseCompleter,
    results::{Compiled, DependentResults, FinishedCompilation},
    task::SharedTask,
};

/// The promise ends and signals handed to a pipelined compilation.
pub struct PipelineInputs {
    /// The compiler completes this as soon as type signatures are ready.
    pub signatures: PromiseCompleter<Signatures>,
    /// The compiler completes this when compilation fully finishes, with
    /// either its products or a failure description.
    pub finished: PromiseCompleter<FinishedCompilation>,
    /// The compiler completes this when its Java phase finishes.
    pub complete_java: PromiseCompleter<()>,
    /// Resolves once every transitive upstream has finished; the compiler
    /// must await it before the Java phase and abort that phase on
    /// [`JavaSignal::FailFastCompilation`].
    pub transitive_java_signal: SharedTask<JavaSignal>,
    /// Whether Java and Scala sources are compiled as separate phases.
    /// Always true in pipelined traversals.
    pub separate_java_and_scala: bool,
}

impl fmt::Debug for PipelineInputs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipelineInputs")
            .field("separate_java_and_scala", &self.separate_java_and_scala)
            .finish_non_exhaustive()
    }
}

/// Everything the compiler receives for one attempt.
#[derive(Debug)]
pub struct CompileInputs {
    /// The attempt's bundle, with reporter and logger already wrapped in
    /// mirroring observers.
    pub bundle: Arc<CompileBundle>,
    /// What this attempt may know about the rest of the traversal.
    pub oracle: CompileOracle,
    /// Present in pipelined traversals.
    pub pipeline: Option<PipelineInputs>,
    /// Previous incremental state per upstream classes directory.
    pub dependent_results: DependentResults,
}

/// Invokes the actual compiler for one attempt.
///
/// The scheduler emits the start and end reporter events around this call;
/// implementations report diagnostics through the bundle's reporter and
/// honour the bundle's cancellation token. Pipelined implementations must
/// complete both promises in [`PipelineInputs`] (dropping them counts as
/// failure) and must await [`PipelineInputs::transitive_java_signal`] before
/// their Java phase.
#[async_trait]
pub trait Compiler: Send + Sync {
    /// Runs one compilation attempt to its terminal outcome.
    ///
    /// Failures are data, not errors: a failed compile returns
    /// [`Compiled::Failed`], and only scheduler-internal malfunctions
    /// surface as [`Compiled::GlobalError`].
    async fn compile(&self, inputs: CompileInputs) -> Compiled;
}
