#![doc = include_str!("../README.md")]
#![cfg_attr(docsrs, feature(doc_cfg, doc_auto_cfg))]

#[macro_use]
extern crate tracing;

mod bundle;
pub use bundle::{BundleInputs, BundleSetup, CompileBundle, CompileOutPaths, LatestResult, SetupError};

mod client;
pub use client::ClientInfo;

mod compiler;
pub use compiler::{CompileInputs, Compiler, PipelineInputs};

mod config;
pub use config::{DISCONNECT_TIMEOUT_ENV, SchedulerConfig};

mod enrichment;

mod errors;
pub use errors::{ErrorSeverity, ReplayError, SchedulerTaskError};

mod executors;
pub use executors::Executors;

mod inputs;
pub use inputs::UniqueCompileInputs;

mod metrics;
pub use metrics::Metrics;

mod mirror;
pub use mirror::{CompilationEvent, EventMirror, MirrorCursor};

mod oracle;
pub use oracle::{
    CompileOracle, DefinedMacros, JavaSignal, JavaSignalTask, PipeliningOracle, Signature,
    SignatureTable, Signatures,
};

mod project;
pub use project::{Project, ProjectDag};

mod promise;
pub use promise::{Promise, PromiseCompleter, PromiseDropped, promise};

mod registry;
pub use registry::LastSuccessfulResult;

mod reporter;
pub use reporter::{
    BuildLogger, CompileStatus, LogLevel, Problem, ProblemSeverity, Reporter, ReporterError,
};

mod results;
pub use results::{
    BundleProducts, Compiled, CompileAnalysis, CompileProducts, DependentResults, FailureCause,
    FinishedCompilation, NoopPopulator, PartialCompileResult, PartialFailure, PartialProducts,
    PartialSuccess, PipelineHandles, PreviousResult, ProductsPopulator, ResultBundle, ResultDag,
};

mod task;
pub use task::{SharedTask, memoize, peek, ready_task};

mod traverse;
pub use traverse::Scheduler;

#[cfg(test)]
mod tests;
