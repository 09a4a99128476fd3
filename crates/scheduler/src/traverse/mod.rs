//! The traversal engine: walks a project DAG bottom-up, composing per-node
//! compilations with the deduplication registry.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, PoisonError};

use futures::{FutureExt, future::join_all};
use kiln_graph::{Dag, DagId};

use crate::{
    bundle::BundleSetup,
    client::ClientInfo,
    compiler::Compiler,
    config::SchedulerConfig,
    executors::Executors,
    oracle::{DefinedMacros, JavaSignalTask, SignatureTable},
    project::{Project, ProjectDag},
    registry::DeduplicationRegistry,
    results::{
        BundleProducts, DependentResults, FailureCause, PartialCompileResult, PartialFailure,
        PartialSuccess, ResultDag,
    },
    task::{SharedTask, memoize},
};

mod dedup;
mod normal;
mod pipelined;

pub(crate) use dedup::setup_and_deduplicate;

/// The compilation scheduler.
///
/// One value of this type is the whole scheduler state: the deduplication
/// registry, the executor pair, and the configuration. There is no process
/// global; tests construct a fresh scheduler per scenario.
#[derive(Debug)]
pub struct Scheduler {
    registry: Arc<DeduplicationRegistry>,
    executors: Executors,
    config: SchedulerConfig,
}

impl Scheduler {
    /// Creates a scheduler with the given configuration and executors.
    pub fn new(config: SchedulerConfig, executors: Executors) -> Self {
        #[cfg(feature = "metrics")]
        crate::metrics::Metrics::init();
        Self { registry: Arc::new(DeduplicationRegistry::new()), executors, config }
    }

    /// Walks `dag` bottom-up on behalf of `client` and returns the result
    /// DAG, shape-identical to the input.
    ///
    /// Every node's [`PartialSuccess`] carries the memoized result task all
    /// subscribers of that compilation share; awaiting it yields the final
    /// per-project outcome. With `pipeline` set, downstream nodes start as
    /// soon as their upstreams publish type signatures.
    pub async fn traverse(
        &self,
        dag: Arc<ProjectDag>,
        client: Arc<dyn ClientInfo>,
        setup: Arc<dyn BundleSetup>,
        compiler: Arc<dyn Compiler>,
        pipeline: bool,
    ) -> Arc<ResultDag> {
        let ctx = Arc::new(TraversalCtx {
            registry: Arc::clone(&self.registry),
            executors: self.executors.clone(),
            config: self.config.clone(),
            client,
            setup,
            compiler,
            pipeline,
            memo: Mutex::new(HashMap::new()),
        });
        debug!(
            target: "scheduler",
            client = %ctx.client.client_id(),
            nodes = dag.node_count(),
            pipeline,
            "Starting traversal"
        );
        traverse_node(&ctx, &dag).await
    }

    /// Drops every last-successful result. Test hook used between
    /// scenarios.
    pub fn clear_successful_results(&self) {
        self.registry.clear_successful_results();
    }

    /// Number of running compilations currently registered.
    pub fn running_compilations(&self) -> usize {
        self.registry.running_count()
    }

    #[cfg(test)]
    pub(crate) fn registry(&self) -> &Arc<DeduplicationRegistry> {
        &self.registry
    }
}

/// Per-request traversal state shared by every node task.
pub(crate) struct TraversalCtx {
    pub(crate) registry: Arc<DeduplicationRegistry>,
    pub(crate) executors: Executors,
    pub(crate) config: SchedulerConfig,
    pub(crate) client: Arc<dyn ClientInfo>,
    pub(crate) setup: Arc<dyn BundleSetup>,
    pub(crate) compiler: Arc<dyn Compiler>,
    pub(crate) pipeline: bool,
    memo: Mutex<HashMap<DagId, SharedTask<Arc<ResultDag>>>>,
}

impl std::fmt::Debug for TraversalCtx {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TraversalCtx")
            .field("client", &self.client.client_id())
            .field("pipeline", &self.pipeline)
            .finish_non_exhaustive()
    }
}

/// What a node's compilation knows about its upstreams, computed by the
/// normal or pipelined walk before setup.
#[derive(Debug, Default)]
pub(crate) struct DependentInputs {
    /// Per-upstream products, keyed by project id.
    pub(crate) products: HashMap<String, BundleProducts>,
    /// Previous incremental state per upstream classes directory.
    pub(crate) results: DependentResults,
    /// Pipelining prerequisites, present in pipelined traversals.
    pub(crate) pipeline: Option<PipelinePrereqs>,
}

/// Upstream state a pipelined compilation starts from.
pub(crate) struct PipelinePrereqs {
    /// Transitive upstream signatures, DFS first-occurrence-wins.
    pub(crate) signatures: SignatureTable,
    /// Macro symbols defined per upstream, same order.
    pub(crate) defined_macros: DefinedMacros,
    /// Resolves once every upstream finished; aborts the Java phase early
    /// on upstream failure.
    pub(crate) java_signal: JavaSignalTask,
    /// Names of the upstream partial successes this node depends on.
    pub(crate) upstream_names: Vec<String>,
}

impl std::fmt::Debug for PipelinePrereqs {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelinePrereqs")
            .field("signatures", &self.signatures.len())
            .field("upstream_names", &self.upstream_names)
            .finish_non_exhaustive()
    }
}

/// Returns the memoized traversal task for `node`, creating it on first
/// visit. Aggregates and parents referring to the same sub-DAG share one
/// task per request.
pub(crate) fn traverse_node(
    ctx: &Arc<TraversalCtx>,
    node: &Arc<ProjectDag>,
) -> SharedTask<Arc<ResultDag>> {
    let mut memo = ctx.memo.lock().unwrap_or_else(PoisonError::into_inner);
    if let Some(existing) = memo.get(&node.id()) {
        return existing.clone();
    }

    let future = node_future(Arc::clone(ctx), Arc::clone(node));
    // Node tasks run on the io executor: they spend their lives waiting on
    // children, signature promises, and other clients' compilations.
    let handle = ctx.executors.io.spawn(future);
    let fallback = node.value().cloned();
    let task = memoize(handle.map(move |joined| {
        joined.unwrap_or_else(|err| {
            error!(target: "scheduler", %err, "Traversal task died");
            Arc::new(match &fallback {
                Some(project) => Dag::Leaf(PartialCompileResult::failure(
                    Arc::clone(project),
                    FailureCause::GlobalError(format!("traversal task died: {err}")),
                )),
                None => Dag::Leaf(PartialCompileResult::Empty),
            })
        })
    }));
    memo.insert(node.id(), task.clone());
    task
}

async fn node_future(ctx: Arc<TraversalCtx>, node: Arc<ProjectDag>) -> Arc<ResultDag> {
    match &*node {
        Dag::Leaf(project) => {
            let result = compile_node(&ctx, &node, project, &[]).await;
            Arc::new(Dag::Leaf(result))
        }
        Dag::Parent(project, children) => {
            let child_results = traverse_children(&ctx, children).await;
            let result = compile_node(&ctx, &node, project, &child_results).await;
            Arc::new(Dag::Parent(result, child_results))
        }
        Dag::Aggregate(children) => {
            let child_results = traverse_children(&ctx, children).await;
            let failures = collect_failures(&child_results);
            let value = if failures.is_empty() {
                PartialCompileResult::Empty
            } else {
                PartialCompileResult::Failures(failures)
            };
            Arc::new(Dag::Parent(value, child_results))
        }
    }
}

async fn traverse_children(
    ctx: &Arc<TraversalCtx>,
    children: &[Arc<ProjectDag>],
) -> Vec<Arc<ResultDag>> {
    let tasks: Vec<_> = children.iter().map(|child| traverse_node(ctx, child)).collect();
    join_all(tasks).await
}

async fn compile_node(
    ctx: &Arc<TraversalCtx>,
    node: &Arc<ProjectDag>,
    project: &Arc<Project>,
    child_results: &[Arc<ResultDag>],
) -> PartialCompileResult {
    if ctx.pipeline {
        pipelined::compile_node(ctx, node, project, child_results).await
    } else {
        normal::compile_node(ctx, node, project, child_results).await
    }
}

/// Collects every failure in the given subtrees, depth-first with children
/// visited before their first occurrence is recorded, distinct by node
/// identity across all subtrees.
pub(crate) fn collect_failures(children: &[Arc<ResultDag>]) -> Vec<PartialFailure> {
    let mut seen = HashSet::new();
    let mut failures = Vec::new();
    for child in children {
        collect_failures_into(child, &mut seen, &mut failures);
    }
    failures
}

fn collect_failures_into(
    node: &Arc<ResultDag>,
    seen: &mut HashSet<DagId>,
    failures: &mut Vec<PartialFailure>,
) {
    if !seen.insert(node.id()) {
        return;
    }
    for child in node.children() {
        collect_failures_into(child, seen, failures);
    }
    match node.value() {
        Some(PartialCompileResult::Failure(failure)) => failures.push(failure.clone()),
        Some(PartialCompileResult::Failures(nested)) => failures.extend(nested.iter().cloned()),
        _ => {}
    }
}

/// The names of the projects blocking the given subtrees, in the order the
/// failures are encountered, deduplicated.
pub(crate) fn failed_project_names(children: &[Arc<ResultDag>]) -> Vec<String> {
    let mut seen = HashSet::new();
    collect_failures(children)
        .into_iter()
        .map(|failure| failure.project.name.clone())
        .filter(|name| seen.insert(name.clone()))
        .collect()
}

/// Gathers the transitive partial successes of the given subtrees in DFS
/// first-occurrence order, the order that simulates classpath lookup.
pub(crate) fn collect_successes(children: &[Arc<ResultDag>]) -> Vec<PartialSuccess> {
    let mut seen = HashSet::new();
    let mut successes = Vec::new();
    for child in children {
        for node in child.dfs() {
            if !seen.insert(node.id()) {
                continue;
            }
            if let Some(PartialCompileResult::Success(success)) = node.value() {
                successes.push(success.clone());
            }
        }
    }
    successes
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::results::FailureCause;

    fn failure_leaf(name: &str) -> Arc<ResultDag> {
        let project = Arc::new(Project::new(name, name));
        Arc::new(Dag::Leaf(PartialCompileResult::failure(
            project,
            FailureCause::SetupFailed("boom".into()),
        )))
    }

    fn empty_parent(children: Vec<Arc<ResultDag>>) -> Arc<ResultDag> {
        Arc::new(Dag::Parent(PartialCompileResult::Empty, children))
    }

    #[test]
    fn failed_names_are_collected_children_first_and_deduplicated() {
        let a = failure_leaf("a");
        let wrapped = empty_parent(vec![Arc::clone(&a)]);
        // The same failing leaf is reachable through two paths.
        let names = failed_project_names(&[wrapped, a]);
        assert_eq!(names, vec!["a".to_string()]);
    }

    #[test]
    fn nested_failure_blocks_the_whole_subtree() {
        let a = failure_leaf("a");
        let b = failure_leaf("b");
        let inner = empty_parent(vec![a]);
        let outer = empty_parent(vec![inner, b]);
        let names = failed_project_names(&[outer]);
        assert_eq!(names, vec!["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn empty_subtrees_have_no_failures() {
        let outer = empty_parent(vec![empty_parent(Vec::new())]);
        assert!(collect_failures(std::slice::from_ref(&outer)).is_empty());
        assert!(collect_successes(&[outer]).is_empty());
    }
}
