//! The pipelined walk: a node starts compiling as soon as every transitive
//! upstream has published type signatures, without waiting for bytecode.

use std::collections::HashMap;
use std::sync::Arc;

use crate::{
    oracle::{DefinedMacros, JavaSignal, SignatureTable},
    project::{Project, ProjectDag},
    promise::Promise,
    results::{
        BundleProducts, DependentResults, FailureCause, FinishedCompilation,
        PartialCompileResult, PartialProducts, PartialSuccess, PreviousResult, ResultBundle,
        ResultDag,
    },
    task::{SharedTask, memoize},
    traverse::{
        DependentInputs, PipelinePrereqs, TraversalCtx, collect_successes, failed_project_names,
        setup_and_deduplicate,
    },
};

pub(super) async fn compile_node(
    ctx: &Arc<TraversalCtx>,
    node: &Arc<ProjectDag>,
    project: &Arc<Project>,
    child_results: &[Arc<ResultDag>],
) -> PartialCompileResult {
    let blocked = failed_project_names(child_results);
    if !blocked.is_empty() {
        debug!(
            target: "scheduler",
            project = %project.name,
            blocked_on = ?blocked,
            "Skipping pipelined compilation, upstream projects failed"
        );
        return PartialCompileResult::failure(Arc::clone(project), FailureCause::Blocked(blocked));
    }

    // Gather upstream signatures in DFS first-occurrence order. An upstream
    // without pipeline handles (deduplicated against a non-pipelined run)
    // degrades to waiting for its full result.
    let upstream = collect_successes(child_results);
    let mut signatures = SignatureTable::new();
    let mut defined_macros: DefinedMacros = Vec::new();
    let mut promise_failures: Vec<String> = Vec::new();
    let mut upstream_macro_symbols: HashMap<String, Vec<String>> = HashMap::new();

    for success in &upstream {
        let name = success.bundle.project.name.clone();
        match &success.pipeline {
            Some(handles) => match handles.signatures.wait().await {
                Ok(published) => {
                    signatures.extend_first_occurrence(&published.signatures);
                    upstream_macro_symbols.insert(
                        success.bundle.project.unique_id.clone(),
                        published.defined_macro_symbols.clone(),
                    );
                    defined_macros.push((name, published.defined_macro_symbols));
                }
                Err(_) => promise_failures.push(name),
            },
            None => {
                let bundle = success.result.clone().await;
                match bundle.compiled.products() {
                    Some(products) => {
                        defined_macros.push((name, products.defined_macro_symbols.clone()));
                        upstream_macro_symbols.insert(
                            success.bundle.project.unique_id.clone(),
                            products.defined_macro_symbols.clone(),
                        );
                    }
                    None => promise_failures.push(name),
                }
            }
        }
    }

    if !promise_failures.is_empty() {
        debug!(
            target: "scheduler",
            project = %project.name,
            blocked_on = ?promise_failures,
            "Skipping pipelined compilation, upstream signature promises failed"
        );
        return PartialCompileResult::failure(
            Arc::clone(project),
            FailureCause::FailedOrCancelledPromise(promise_failures),
        );
    }

    let java_signal = transitive_java_signal(&upstream);
    let upstream_names: Vec<String> =
        upstream.iter().map(|success| success.bundle.project.name.clone()).collect();

    // Dependents of an unfinished upstream see its directory layout and
    // macro symbols only; a finished one contributes full products.
    let mut dependent_products = HashMap::new();
    let mut dependent_results = DependentResults::new();
    for success in &upstream {
        let project_id = success.bundle.project.unique_id.clone();
        let completed = success
            .pipeline
            .as_ref()
            .and_then(|handles| handles.finished.peek())
            .and_then(|finished| match finished {
                Ok(Ok(products)) => Some(products),
                _ => None,
            });
        let analysis = match &completed {
            Some(products) => Some(Arc::clone(&products.analysis)),
            None => success.bundle.last_successful.analysis().cloned(),
        };
        let previous = PreviousResult { analysis };
        dependent_results
            .insert(success.bundle.out.read_only_classes_dir.clone(), previous.clone());
        dependent_results.insert(success.bundle.out.new_classes_dir.clone(), previous);

        let products = match completed {
            Some(products) => BundleProducts::Complete(products),
            None => BundleProducts::Partial(PartialProducts {
                read_only_classes_dir: success.bundle.out.read_only_classes_dir.clone(),
                new_classes_dir: success.bundle.out.new_classes_dir.clone(),
                defined_macro_symbols: upstream_macro_symbols
                    .get(&project_id)
                    .cloned()
                    .unwrap_or_default(),
            }),
        };
        dependent_products.insert(project_id, products);
    }

    let inputs = DependentInputs {
        products: dependent_products,
        results: dependent_results,
        pipeline: Some(PipelinePrereqs {
            signatures,
            defined_macros,
            java_signal,
            upstream_names,
        }),
    };
    setup_and_deduplicate(ctx, node, project, inputs).await
}

/// Folds upstream finished-compilation outcomes left to right into the
/// signal the compiler awaits before its Java phase.
fn transitive_java_signal(upstream: &[PartialSuccess]) -> SharedTask<JavaSignal> {
    let waits: Vec<(String, Option<Promise<FinishedCompilation>>, SharedTask<Arc<ResultBundle>>)> =
        upstream
            .iter()
            .map(|success| {
                (
                    success.bundle.project.name.clone(),
                    success.pipeline.as_ref().map(|handles| handles.finished.clone()),
                    success.result.clone(),
                )
            })
            .collect();

    memoize(async move {
        let mut signal = JavaSignal::ContinueCompilation;
        for (name, finished, result) in waits {
            let succeeded = match finished {
                Some(promise) => matches!(promise.wait().await, Ok(Ok(_))),
                None => result.await.compiled.is_ok(),
            };
            if !succeeded {
                signal = signal.merge(JavaSignal::FailFastCompilation(vec![name]));
            }
        }
        signal
    })
}
