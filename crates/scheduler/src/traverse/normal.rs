//! The strict topological walk: a node compiles only after every transitive
//! upstream has fully finished.

use std::collections::HashMap;
use std::sync::Arc;

use crate::{
    project::{Project, ProjectDag},
    results::{
        BundleProducts, DependentResults, FailureCause, PartialCompileResult, PartialSuccess,
        PreviousResult, ResultBundle, ResultDag,
    },
    traverse::{
        DependentInputs, TraversalCtx, collect_successes, failed_project_names,
        setup_and_deduplicate,
    },
};

pub(super) async fn compile_node(
    ctx: &Arc<TraversalCtx>,
    node: &Arc<ProjectDag>,
    project: &Arc<Project>,
    child_results: &[Arc<ResultDag>],
) -> PartialCompileResult {
    // Structural failures first: a setup failure or block anywhere below
    // makes this node blocked without a compile of its own.
    let blocked = failed_project_names(child_results);
    if !blocked.is_empty() {
        debug!(
            target: "scheduler",
            project = %project.name,
            blocked_on = ?blocked,
            "Skipping compilation, upstream projects failed"
        );
        return PartialCompileResult::failure(Arc::clone(project), FailureCause::Blocked(blocked));
    }

    // Wait for every transitive upstream compilation to finish.
    let upstream = collect_successes(child_results);
    let mut finished: Vec<(PartialSuccess, Arc<ResultBundle>)> = Vec::with_capacity(upstream.len());
    for success in upstream {
        let bundle = success.result.clone().await;
        finished.push((success, bundle));
    }

    let failed: Vec<String> = finished
        .iter()
        .filter(|(_, bundle)| !bundle.compiled.is_ok())
        .map(|(success, _)| success.bundle.project.name.clone())
        .collect();
    if !failed.is_empty() {
        debug!(
            target: "scheduler",
            project = %project.name,
            blocked_on = ?failed,
            "Skipping compilation, upstream compilations failed"
        );
        return PartialCompileResult::failure(Arc::clone(project), FailureCause::Blocked(failed));
    }

    // Upstream classes directories must be fully materialized before this
    // compilation reads them.
    for (_, bundle) in &finished {
        bundle.populating.clone().await;
    }

    let mut dependent_products = HashMap::new();
    let mut dependent_results = DependentResults::new();
    for (success, bundle) in &finished {
        let Some(products) = bundle.compiled.products() else { continue };
        dependent_products.insert(
            success.bundle.project.unique_id.clone(),
            BundleProducts::Complete(products.clone()),
        );
        // Downstream analysis lookup may resolve either the stable read-only
        // path or the freshly written one, so both keys map to the same
        // previous result.
        let previous = PreviousResult { analysis: Some(Arc::clone(&products.analysis)) };
        dependent_results.insert(products.read_only_classes_dir.clone(), previous.clone());
        dependent_results.insert(products.new_classes_dir.clone(), previous);
    }

    let inputs = DependentInputs {
        products: dependent_products,
        results: dependent_results,
        pipeline: None,
    };
    setup_and_deduplicate(ctx, node, project, inputs).await
}
