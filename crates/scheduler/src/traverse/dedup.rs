//! Deduplication of concurrent compilations of the same logical work.
//!
//! Every node attempt runs bundle setup, then races for ownership of the
//! registry slot keyed by its unique compile inputs. The winner dispatches
//! the compilation; everyone else attaches to the running one, replaying its
//! mirrored reporter/logger events into their own sinks. A subscriber that
//! observes no event for the whole disconnection timeout assumes the
//! producer stalled: it removes the registry entry, cancels the producer,
//! and re-enters setup to dispatch afresh.

use std::sync::{Arc, atomic::AtomicBool};
use std::time::{Duration, Instant};

use futures::FutureExt;
use tracing::Instrument;

use crate::{
    bundle::{BundleInputs, CompileBundle},
    compiler::{CompileInputs, PipelineInputs},
    errors::ReplayError,
    metrics::Metrics,
    mirror::{CompilationEvent, EventMirror, MirrorCursor},
    oracle::{CompileOracle, PipeliningOracle},
    project::{Project, ProjectDag},
    promise::promise,
    registry::{LastSuccessfulResult, RunningCompilation},
    reporter::{BuildLogger, CompileStatus, ObservedLogger, ObservedReporter, Problem, Reporter},
    results::{
        Compiled, FailureCause, PartialCompileResult, PartialSuccess, PipelineHandles,
        ResultBundle,
    },
    task::{SharedTask, memoize},
    traverse::{DependentInputs, TraversalCtx},
};

use crate::enrichment::process_result_atomically;

/// Sets up one node attempt and either dispatches it or attaches to an
/// equivalent running compilation.
pub(crate) async fn setup_and_deduplicate(
    ctx: &Arc<TraversalCtx>,
    node: &Arc<ProjectDag>,
    project: &Arc<Project>,
    deps: DependentInputs,
) -> PartialCompileResult {
    loop {
        let inputs = BundleInputs {
            project: Arc::clone(project),
            dag: Arc::clone(node),
            dependent_products: deps.products.clone(),
        };
        let bundle = match ctx.setup.setup(inputs).await {
            Ok(bundle) => Arc::new(bundle),
            Err(err) => {
                debug!(target: "scheduler", project = %project.name, %err, "Bundle setup failed");
                return PartialCompileResult::failure(
                    Arc::clone(project),
                    FailureCause::SetupFailed(err.to_string()),
                );
            }
        };

        let (running, inserted) = ctx
            .registry
            .lookup_or_insert(&bundle.unique_inputs, || schedule_compilation(ctx, &bundle, &deps));

        if inserted {
            Metrics::record_dispatch(ctx.registry.running_count());
            return PartialCompileResult::Success(PartialSuccess {
                bundle,
                pipeline: running.pipeline.clone(),
                result: running.result.clone(),
            });
        }

        Metrics::record_deduplicated();
        debug!(
            target: "scheduler",
            project = %project.name,
            client = %ctx.client.client_id(),
            owner = %running.owner_client,
            "Attaching to an equivalent running compilation"
        );

        match deduplicate(ctx, project, &bundle, &running).await {
            DedupOutcome::Deliver(result) => {
                return PartialCompileResult::Success(PartialSuccess {
                    bundle,
                    pipeline: running.pipeline.clone(),
                    result,
                });
            }
            DedupOutcome::ClientCancelled => {
                return PartialCompileResult::failure(
                    Arc::clone(project),
                    FailureCause::Cancelled,
                );
            }
            DedupOutcome::Redispatch => continue,
        }
    }
}

enum DedupOutcome {
    /// Deliver this memoized result to the client.
    Deliver(SharedTask<Arc<ResultBundle>>),
    /// This client cancelled its own request; the producer keeps running.
    ClientCancelled,
    /// The producer stalled; re-enter setup and race for the slot.
    Redispatch,
}

/// Attaches a late subscriber to `running`: replays mirrored events into
/// the subscriber's sinks and races the replay against the shared result.
async fn deduplicate(
    ctx: &Arc<TraversalCtx>,
    project: &Arc<Project>,
    bundle: &Arc<CompileBundle>,
    running: &Arc<RunningCompilation>,
) -> DedupOutcome {
    let cursor = MirrorCursor::from_start(Arc::clone(&running.mirror));
    // Previous problems are re-derived from the analysis the running
    // compilation actually started from; this client's cached analysis may
    // differ from it.
    let baseline = running.previous_problems.clone();
    let mut replay = ctx.executors.io.spawn(replay_events(
        cursor,
        baseline,
        Arc::clone(project),
        Arc::clone(&bundle.reporter),
        Arc::clone(&bundle.logger),
        ctx.config.disconnect_timeout,
    ));

    let mut shared_result = running.result.clone();
    tokio::select! {
        // Polled in order: a client cancel takes precedence, then replay
        // outcomes, then the shared result. A replay failure observed in the
        // same instant the result resolves must still demote this client.
        biased;
        () = bundle.cancel.cancelled() => {
            // Cancelling a subscriber never cancels the producer.
            replay.abort();
            let _ = bundle.reporter.report_end(project, CompileStatus::Cancelled);
            DedupOutcome::ClientCancelled
        }
        replayed = &mut replay => match replayed {
            Ok(Ok(())) => DedupOutcome::Deliver(running.result.clone()),
            Ok(Err(ReplayError::Disconnected { elapsed })) => {
                disconnect(ctx, project, bundle, running, elapsed);
                DedupOutcome::Redispatch
            }
            Ok(Err(err @ ReplayError::Reporter(_))) => {
                DedupOutcome::Deliver(demoted(running, project, &err.to_string()))
            }
            Err(join_err) => {
                DedupOutcome::Deliver(demoted(running, project, &join_err.to_string()))
            }
        },
        _ = &mut shared_result => {
            // The compilation finished while events were still replaying:
            // drain the closed mirror, then deliver the shared result.
            let _ = (&mut replay).await;
            DedupOutcome::Deliver(running.result.clone())
        }
    }
}

/// Replay failed for this client only: wait for the producer's result and
/// substitute a success with a global error. The producer is untouched.
fn demoted(
    running: &Arc<RunningCompilation>,
    project: &Arc<Project>,
    cause: &str,
) -> SharedTask<Arc<ResultBundle>> {
    warn!(
        target: "scheduler",
        project = %project.name,
        cause,
        "Event replay failed, demoting this client's deduplicated result"
    );
    let result = running.result.clone();
    let message = format!("deduplication failed: {cause}");
    memoize(async move { Arc::new(result.await.demote_success(&message)) })
}

/// The stall path: unsubscribe, compare-and-remove the registry entry,
/// cancel the producer, and tell this client its attempt was cancelled.
/// Other subscribers observe the removal and race to re-dispatch too.
fn disconnect(
    ctx: &Arc<TraversalCtx>,
    project: &Arc<Project>,
    bundle: &Arc<CompileBundle>,
    running: &Arc<RunningCompilation>,
    elapsed: Duration,
) {
    running.unsubscribe();
    let removed = ctx.registry.remove(&bundle.unique_inputs, running.attempt);
    running.cancel_ongoing();
    let _ = bundle.reporter.report_end(project, CompileStatus::Cancelled);
    warn!(
        target: "scheduler",
        project = %project.name,
        client = %ctx.client.client_id(),
        owner = %running.owner_client,
        ?elapsed,
        removed,
        "No progress observed from the ongoing compilation, disconnecting and re-dispatching"
    );
    Metrics::record_disconnect(ctx.registry.running_count());
}

/// Replays the mirrored event log into a late subscriber's sinks, bounded
/// per event by the disconnection timeout.
async fn replay_events(
    mut cursor: MirrorCursor,
    baseline: Vec<Problem>,
    project: Arc<Project>,
    reporter: Arc<dyn Reporter>,
    logger: Arc<dyn BuildLogger>,
    timeout: Duration,
) -> Result<(), ReplayError> {
    reporter.report_previous_problems(&project, &baseline)?;
    loop {
        match tokio::time::timeout(timeout, cursor.next()).await {
            Err(_) => return Err(ReplayError::Disconnected { elapsed: timeout }),
            Ok(None) => return Ok(()),
            Ok(Some(event)) => match event {
                CompilationEvent::Started { .. } => reporter.report_start(&project)?,
                CompilationEvent::Problem { problem, .. } => {
                    reporter.report_problem(&project, &problem)?
                }
                CompilationEvent::Log { level, message } => logger.log(level, &message),
                CompilationEvent::Ended { status, .. } => reporter.report_end(&project, status)?,
            },
        }
    }
}

/// Dispatches one compilation: selects the last-successful input, wires the
/// mirroring observers and pipeline promises, spawns the compile on the
/// compute executor, and memoizes its enriched result.
fn schedule_compilation(
    ctx: &Arc<TraversalCtx>,
    bundle: &Arc<CompileBundle>,
    deps: &DependentInputs,
) -> Arc<RunningCompilation> {
    let project = Arc::clone(&bundle.project);
    let mirror = Arc::new(EventMirror::new());
    let attempt = ctx.registry.next_attempt_id();
    let unsubscribed = Arc::new(AtomicBool::new(false));

    // Select the most recent last-successful result, overridden to the
    // empty sentinel when its directory vanished from disk or when the
    // client carries no validated analysis to resume from.
    let chosen = ctx
        .registry
        .get_or_insert_last_successful(&project.unique_id, Arc::clone(&bundle.last_successful));
    let chosen = if !chosen.classes_dir_exists()
        || (bundle.latest_result.is_empty() && !chosen.is_empty_sentinel())
    {
        ctx.registry.decrement_classes_dir_refcount(chosen.classes_dir());
        Arc::new(LastSuccessfulResult::empty(&project))
    } else {
        chosen
    };
    let previous_problems = chosen.problems();

    let (oracle, pipeline_inputs, handles) = match &deps.pipeline {
        Some(prereqs) => {
            let (signatures_tx, signatures_rx) = promise();
            let (finished_tx, finished_rx) = promise();
            let (java_tx, java_rx) = promise();
            let oracle = CompileOracle::Pipelining(PipeliningOracle {
                upstream_signatures: prereqs.signatures.clone(),
                defined_macro_symbols: prereqs.defined_macros.clone(),
                own_signatures: signatures_rx.clone(),
                upstream_successes: prereqs.upstream_names.clone(),
            });
            let inputs = PipelineInputs {
                signatures: signatures_tx,
                finished: finished_tx,
                complete_java: java_tx,
                transitive_java_signal: prereqs.java_signal.clone(),
                separate_java_and_scala: true,
            };
            let handles = PipelineHandles {
                signatures: signatures_rx,
                finished: finished_rx,
                java_completed: java_rx,
            };
            (oracle, Some(inputs), Some(handles))
        }
        None => (CompileOracle::Simple, None, None),
    };

    // The compiler talks to this client through observers that tee every
    // action into the mirror for late subscribers.
    let observed_reporter: Arc<dyn Reporter> =
        Arc::new(ObservedReporter::new(Arc::clone(&bundle.reporter), Arc::clone(&mirror)));
    let observed_logger: Arc<dyn BuildLogger> =
        Arc::new(ObservedLogger::new(Arc::clone(&bundle.logger), Arc::clone(&mirror)));
    let mut observed_bundle = CompileBundle::clone(bundle);
    observed_bundle.reporter = Arc::clone(&observed_reporter);
    observed_bundle.logger = observed_logger;
    observed_bundle.last_successful = Arc::clone(&chosen);
    let observed_bundle = Arc::new(observed_bundle);

    let cancel = bundle.cancel.clone();
    let enrichment_started = Arc::new(AtomicBool::new(false));

    let compile_future = {
        let ctx = Arc::clone(ctx);
        let project = Arc::clone(&project);
        let mirror = Arc::clone(&mirror);
        let chosen = Arc::clone(&chosen);
        let unsubscribed = Arc::clone(&unsubscribed);
        let enrichment_started = Arc::clone(&enrichment_started);
        let dependent_results = deps.results.clone();
        let cancel = cancel.clone();
        async move {
            let started = Instant::now();
            let _ = observed_reporter.report_start(&project);
            let compiled = if cancel.is_cancelled() {
                Compiled::Cancelled
            } else {
                let inputs = CompileInputs {
                    bundle: Arc::clone(&observed_bundle),
                    oracle,
                    pipeline: pipeline_inputs,
                    dependent_results,
                };
                ctx.compiler.compile(inputs).await
            };
            let status = compiled.status();
            let _ = observed_reporter.report_end(&project, status);
            debug!(
                target: "scheduler",
                project = %project.name,
                %status,
                elapsed = ?started.elapsed(),
                "Compilation finished"
            );

            // Registry bookkeeping runs detached so a hard abort of this
            // task can never leave a half-applied swap behind.
            enrichment_started.store(true, std::sync::atomic::Ordering::SeqCst);
            let enrichment = ctx.executors.compute.spawn(process_result_atomically(
                Arc::clone(&ctx.registry),
                ctx.executors.clone(),
                Arc::clone(&ctx.client),
                Arc::clone(&observed_bundle),
                chosen,
                unsubscribed,
                attempt,
                compiled,
            ));
            let result = match enrichment.await {
                Ok(result) => result,
                Err(err) => Arc::new(ResultBundle::immediate(
                    Arc::clone(&project),
                    Compiled::GlobalError(format!("result enrichment died: {err}")),
                )),
            };
            mirror.close();
            result
        }
    };

    let span = info_span!(
        target: "scheduler",
        "compile",
        project = %project.name,
        client = %ctx.client.client_id(),
        attempt,
    );
    let handle = ctx.executors.compute.spawn(compile_future.instrument(span));
    let abort = handle.abort_handle();

    // A hard abort resolves every subscriber with a cancelled result and
    // closes out this client's event stream.
    let registry = Arc::clone(&ctx.registry);
    let abort_reporter = Arc::clone(&bundle.reporter);
    let abort_project = Arc::clone(&project);
    let abort_chosen = Arc::clone(&chosen);
    let abort_enrichment_started = Arc::clone(&enrichment_started);
    let result = memoize(handle.map(move |joined| match joined {
        Ok(result) => result,
        Err(err) => {
            if !abort_enrichment_started.load(std::sync::atomic::Ordering::SeqCst) {
                // The compile never reached enrichment; release its input
                // reference here instead.
                registry.decrement_classes_dir_refcount(abort_chosen.classes_dir());
            }
            let _ = abort_reporter.report_end(&abort_project, CompileStatus::Cancelled);
            debug!(target: "scheduler", project = %abort_project.name, %err, "Compilation task aborted");
            Arc::new(ResultBundle::cancelled(Arc::clone(&abort_project)))
        }
    }));

    Arc::new(RunningCompilation {
        result,
        mirror,
        previous_problems,
        pipeline: handles,
        unsubscribed,
        cancel,
        abort,
        owner_client: ctx.client.client_id().to_string(),
        attempt,
    })
}
