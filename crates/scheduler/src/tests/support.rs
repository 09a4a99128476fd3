//! Stub collaborators shared by the scenario tests.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::{
    Arc, Mutex,
    atomic::{AtomicUsize, Ordering},
};
use std::time::Duration;

use async_trait::async_trait;
use kiln_graph::Dag;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use crate::{
    BuildLogger, BundleInputs, BundleSetup, ClientInfo, CompileAnalysis, CompileBundle,
    CompileInputs, CompileOracle, CompileOutPaths, CompileProducts, CompileStatus, Compiled,
    Compiler, Executors, JavaSignal, LastSuccessfulResult, LatestResult, LogLevel, NoopPopulator,
    Problem, Project, ProjectDag, Reporter, ReporterError, Scheduler, SchedulerConfig, SetupError,
    Signature, Signatures, UniqueCompileInputs,
};

pub(crate) fn project(name: &str) -> Arc<Project> {
    Arc::new(Project::new(name, name))
}

pub(crate) fn leaf(project: &Arc<Project>) -> Arc<ProjectDag> {
    Arc::new(Dag::Leaf(Arc::clone(project)))
}

pub(crate) fn parent(project: &Arc<Project>, children: Vec<Arc<ProjectDag>>) -> Arc<ProjectDag> {
    Arc::new(Dag::Parent(Arc::clone(project), children))
}

pub(crate) fn aggregate(children: Vec<Arc<ProjectDag>>) -> Arc<ProjectDag> {
    Arc::new(Dag::Aggregate(children))
}

pub(crate) fn scheduler() -> Arc<Scheduler> {
    Arc::new(Scheduler::new(SchedulerConfig::default(), Executors::current()))
}

pub(crate) fn scheduler_with_timeout(timeout: Duration) -> Arc<Scheduler> {
    let config = SchedulerConfig::default().with_disconnect_timeout(timeout);
    Arc::new(Scheduler::new(config, Executors::current()))
}

/// A client with a stable id and per-project external directories.
pub(crate) struct TestClient {
    id: String,
    root: PathBuf,
}

impl TestClient {
    pub(crate) fn new(id: &str, root: PathBuf) -> Arc<Self> {
        Arc::new(Self { id: id.to_string(), root })
    }
}

impl ClientInfo for TestClient {
    fn client_id(&self) -> &str {
        &self.id
    }

    fn unique_classes_dir_for(&self, project: &Project) -> PathBuf {
        self.root.join("external").join(&self.id).join(&project.name)
    }
}

/// Records every reporter action in order.
#[derive(Default)]
pub(crate) struct CollectingReporter {
    events: Mutex<Vec<String>>,
    fail_on_start: bool,
}

impl CollectingReporter {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub(crate) fn failing_on_start() -> Arc<Self> {
        Arc::new(Self { events: Mutex::new(Vec::new()), fail_on_start: true })
    }

    pub(crate) fn events(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }

    /// The start/problem/end events, without per-subscriber baselines.
    pub(crate) fn compile_events(&self) -> Vec<String> {
        self.events().into_iter().filter(|event| !event.starts_with("previous:")).collect()
    }

    pub(crate) fn end_events(&self) -> Vec<String> {
        self.events().into_iter().filter(|event| event.starts_with("end:")).collect()
    }
}

impl Reporter for CollectingReporter {
    fn report_start(&self, project: &Project) -> Result<(), ReporterError> {
        if self.fail_on_start {
            return Err(ReporterError("start rejected".into()));
        }
        self.events.lock().unwrap().push(format!("start:{}", project.name));
        Ok(())
    }

    fn report_problem(&self, project: &Project, problem: &Problem) -> Result<(), ReporterError> {
        self.events.lock().unwrap().push(format!("problem:{}:{}", project.name, problem.message));
        Ok(())
    }

    fn report_previous_problems(
        &self,
        project: &Project,
        problems: &[Problem],
    ) -> Result<(), ReporterError> {
        self.events.lock().unwrap().push(format!("previous:{}:{}", project.name, problems.len()));
        Ok(())
    }

    fn report_end(&self, project: &Project, status: CompileStatus) -> Result<(), ReporterError> {
        self.events.lock().unwrap().push(format!("end:{}:{status}", project.name));
        Ok(())
    }
}

pub(crate) struct NullLogger;

impl BuildLogger for NullLogger {
    fn log(&self, _level: LogLevel, _message: &str) {}
}

/// Per-client bundle setup over a shared temp directory.
pub(crate) struct TestSetup {
    root: PathBuf,
    reporter: Arc<dyn Reporter>,
    logger: Arc<dyn BuildLogger>,
    digests: Mutex<HashMap<String, u64>>,
    latest: Mutex<HashMap<String, Arc<CompileAnalysis>>>,
    failing: Mutex<HashSet<String>>,
    cancel: CancellationToken,
    attempts: AtomicUsize,
}

impl TestSetup {
    pub(crate) fn new(root: PathBuf, reporter: Arc<dyn Reporter>) -> Arc<Self> {
        Arc::new(Self {
            root,
            reporter,
            logger: Arc::new(NullLogger),
            digests: Mutex::new(HashMap::new()),
            latest: Mutex::new(HashMap::new()),
            failing: Mutex::new(HashSet::new()),
            cancel: CancellationToken::new(),
            attempts: AtomicUsize::new(0),
        })
    }

    /// Changes the unique-inputs digest of `project`, simulating an edit.
    pub(crate) fn set_digest(&self, project: &str, digest: u64) {
        self.digests.lock().unwrap().insert(project.to_string(), digest);
    }

    /// Gives the client a validated previous analysis for `project`.
    pub(crate) fn set_latest(&self, project: &str, analysis: Arc<CompileAnalysis>) {
        self.latest.lock().unwrap().insert(project.to_string(), analysis);
    }

    pub(crate) fn fail_setup_for(&self, project: &str) {
        self.failing.lock().unwrap().insert(project.to_string());
    }

    pub(crate) fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }
}

#[async_trait]
impl BundleSetup for TestSetup {
    async fn setup(&self, inputs: BundleInputs) -> Result<CompileBundle, SetupError> {
        let project = inputs.project;
        if self.failing.lock().unwrap().contains(&project.name) {
            return Err(SetupError(format!("no sources for {}", project.name)));
        }
        let digest =
            self.digests.lock().unwrap().get(&project.name).copied().unwrap_or(1);
        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst);
        let project_dir = self.root.join(&project.name);
        let out = CompileOutPaths {
            read_only_classes_dir: project_dir.join(format!("classes-ro-{attempt}")),
            new_classes_dir: project_dir.join(format!("classes-{attempt}")),
        };
        let latest_result = self
            .latest
            .lock()
            .unwrap()
            .get(&project.name)
            .map_or(LatestResult::Empty, |analysis| LatestResult::Previous(Arc::clone(analysis)));
        Ok(CompileBundle {
            unique_inputs: UniqueCompileInputs::new(project.unique_id.clone(), digest),
            reporter: Arc::clone(&self.reporter),
            logger: Arc::clone(&self.logger),
            latest_result,
            last_successful: Arc::new(LastSuccessfulResult::empty(&project)),
            cancel: self.cancel.clone(),
            out,
            project,
        })
    }
}

/// What the stub compiler does for one project.
#[derive(Clone)]
pub(crate) enum Behavior {
    /// Compile successfully.
    Ok,
    /// Report one problem and fail.
    Fail,
    /// Wait for cancellation, emitting nothing.
    Hang,
    /// Publish signatures, then hold the compilation until released.
    Gated(Arc<Notify>),
}

/// A deterministic compiler stub.
#[derive(Default)]
pub(crate) struct StubCompiler {
    behaviors: Mutex<HashMap<String, Behavior>>,
    invocations: Mutex<Vec<String>>,
    observed_signals: Mutex<HashMap<String, JavaSignal>>,
    observed_signatures: Mutex<HashMap<String, Vec<String>>>,
}

impl StubCompiler {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub(crate) fn set_behavior(&self, project: &str, behavior: Behavior) {
        self.behaviors.lock().unwrap().insert(project.to_string(), behavior);
    }

    pub(crate) fn invocations(&self) -> Vec<String> {
        self.invocations.lock().unwrap().clone()
    }

    /// The java signal a pipelined compile of `project` observed.
    pub(crate) fn observed_signal(&self, project: &str) -> Option<JavaSignal> {
        self.observed_signals.lock().unwrap().get(project).cloned()
    }

    /// The upstream signature names a pipelined compile of `project` saw.
    pub(crate) fn observed_signatures(&self, project: &str) -> Option<Vec<String>> {
        self.observed_signatures.lock().unwrap().get(project).cloned()
    }

    async fn finish_ok(&self, inputs: CompileInputs, gate: Option<Arc<Notify>>) -> Compiled {
        let name = inputs.bundle.project.name.clone();
        let out = inputs.bundle.out.clone();
        if tokio::fs::create_dir_all(&out.new_classes_dir).await.is_err() {
            return Compiled::GlobalError(format!("cannot create {}", out.new_classes_dir.display()));
        }
        let products = CompileProducts {
            read_only_classes_dir: out.read_only_classes_dir,
            new_classes_dir: out.new_classes_dir,
            analysis: Arc::new(CompileAnalysis::new(Vec::new())),
            defined_macro_symbols: Vec::new(),
            populator: Arc::new(NoopPopulator),
        };
        match inputs.pipeline {
            Some(pipeline) => {
                let signatures = Signatures {
                    signatures: vec![Signature { name: format!("{name}.Api"), digest: 1 }],
                    defined_macro_symbols: Vec::new(),
                };
                let _ = pipeline.signatures.complete(signatures);
                if let Some(gate) = &gate {
                    gate.notified().await;
                }
                let signal = pipeline.transitive_java_signal.clone().await;
                self.observed_signals.lock().unwrap().insert(name, signal.clone());
                if let JavaSignal::FailFastCompilation(failed) = signal {
                    let _ = pipeline.finished.complete(Err(failed.join(", ")));
                    return Compiled::Failed(vec![Problem::error("java phase aborted")]);
                }
                let _ = pipeline.complete_java.complete(());
                let _ = pipeline.finished.complete(Ok(products.clone()));
            }
            None => {
                if let Some(gate) = &gate {
                    gate.notified().await;
                }
            }
        }
        Compiled::Ok(products)
    }
}

#[async_trait]
impl Compiler for StubCompiler {
    async fn compile(&self, inputs: CompileInputs) -> Compiled {
        let name = inputs.bundle.project.name.clone();
        if let CompileOracle::Pipelining(oracle) = &inputs.oracle {
            self.observed_signatures.lock().unwrap().insert(
                name.clone(),
                oracle.upstream_signatures.signatures().iter().map(|s| s.name.clone()).collect(),
            );
        }
        self.invocations.lock().unwrap().push(name.clone());
        let behavior =
            self.behaviors.lock().unwrap().get(&name).cloned().unwrap_or(Behavior::Ok);
        match behavior {
            Behavior::Ok => self.finish_ok(inputs, None).await,
            Behavior::Gated(gate) => self.finish_ok(inputs, Some(gate)).await,
            Behavior::Fail => {
                let problem = Problem::error(format!("{name} does not compile"));
                let _ = inputs.bundle.reporter.report_problem(&inputs.bundle.project, &problem);
                Compiled::Failed(vec![problem])
            }
            Behavior::Hang => {
                inputs.bundle.cancel.cancelled().await;
                Compiled::Cancelled
            }
        }
    }
}
