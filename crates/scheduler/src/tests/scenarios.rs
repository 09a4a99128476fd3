//! The end-to-end scheduler scenarios.

use std::sync::Arc;
use std::time::Duration;

use kiln_graph::Dag;
use rstest::rstest;
use tempfile::TempDir;
use tokio::sync::Notify;

use crate::{
    Compiled, FailureCause, JavaSignal, PartialCompileResult, ResultBundle, ResultDag, Scheduler,
};

use super::support::{
    Behavior, CollectingReporter, StubCompiler, TestClient, TestSetup, aggregate, leaf, parent,
    project, scheduler, scheduler_with_timeout,
};

struct Client {
    reporter: Arc<CollectingReporter>,
    setup: Arc<TestSetup>,
    compiler: Arc<StubCompiler>,
    info: Arc<TestClient>,
}

fn client(name: &str, dir: &TempDir) -> Client {
    let reporter = CollectingReporter::new();
    Client {
        setup: TestSetup::new(dir.path().to_path_buf(), reporter.clone()),
        reporter,
        compiler: StubCompiler::new(),
        info: TestClient::new(name, dir.path().to_path_buf()),
    }
}

async fn run(
    scheduler: &Scheduler,
    client: &Client,
    dag: &Arc<crate::ProjectDag>,
    pipeline: bool,
) -> Arc<ResultDag> {
    scheduler
        .traverse(
            Arc::clone(dag),
            client.info.clone(),
            client.setup.clone(),
            client.compiler.clone(),
            pipeline,
        )
        .await
}

async fn node_result(dag: &ResultDag) -> Arc<ResultBundle> {
    dag.value()
        .expect("node carries a result")
        .result_task()
        .expect("node has a result task")
        .await
}

#[rstest]
#[case::normal(false)]
#[case::pipelined(true)]
#[tokio::test]
async fn leaf_success_registers_last_successful(#[case] pipeline: bool) {
    let dir = TempDir::new().unwrap();
    let scheduler = scheduler();
    let client = client("cli-1", &dir);
    let a = project("A");

    let result = run(&scheduler, &client, &leaf(&a), pipeline).await;
    let bundle = node_result(&result).await;
    bundle.populating.clone().await;

    let Compiled::Ok(products) = &bundle.compiled else { panic!("expected success") };
    assert_eq!(client.compiler.invocations(), vec!["A".to_string()]);

    let registry = scheduler.registry();
    let current = registry.current_last_successful("A").expect("last successful registered");
    assert_eq!(current.classes_dir(), products.new_classes_dir.as_path());
    assert_eq!(registry.classes_dir_refcount(&products.new_classes_dir), 1);
    assert_eq!(
        client.reporter.compile_events(),
        vec!["start:A".to_string(), "end:A:ok".to_string()]
    );
}

#[tokio::test]
async fn parent_is_blocked_by_failing_child() {
    let dir = TempDir::new().unwrap();
    let scheduler = scheduler();
    let client = client("cli-1", &dir);
    client.compiler.set_behavior("A", Behavior::Fail);

    let a = project("A");
    let b = project("B");
    let dag = parent(&b, vec![leaf(&a)]);

    let result = run(&scheduler, &client, &dag, false).await;

    // The parent position carries a blocked failure naming the culprit.
    let Some(PartialCompileResult::Failure(failure)) = result.value() else {
        panic!("expected blocked parent")
    };
    assert_eq!(failure.project.name, "B");
    assert!(matches!(&failure.cause, FailureCause::Blocked(names) if names == &["A".to_string()]));

    // The child leaf finished as a compiler failure.
    let child = &result.children()[0];
    let child_bundle = node_result(child).await;
    assert!(matches!(child_bundle.compiled, Compiled::Failed(_)));

    // B's compile was never invoked.
    assert_eq!(client.compiler.invocations(), vec!["A".to_string()]);
}

#[tokio::test]
async fn setup_failure_is_localized_to_its_leaf() {
    let dir = TempDir::new().unwrap();
    let scheduler = scheduler();
    let client = client("cli-1", &dir);
    client.setup.fail_setup_for("A");

    let a = project("A");
    let b = project("B");
    let c = project("C");
    let dag = aggregate(vec![parent(&b, vec![leaf(&a)]), leaf(&c)]);

    let result = run(&scheduler, &client, &dag, false).await;

    // The sibling leaf compiled despite A's setup failure.
    assert_eq!(client.compiler.invocations(), vec!["C".to_string()]);
    let Some(PartialCompileResult::Failures(failures)) = result.value() else {
        panic!("expected aggregated failures")
    };
    assert_eq!(failures.len(), 2);
    assert!(matches!(&failures[0].cause, FailureCause::SetupFailed(_)));
    assert!(matches!(&failures[1].cause, FailureCause::Blocked(_)));
}

#[tokio::test(start_paused = true)]
async fn concurrent_clients_deduplicate_one_compilation() {
    let dir = TempDir::new().unwrap();
    let scheduler = scheduler();
    let one = client("cli-1", &dir);
    let two = client("cli-2", &dir);

    let gate = Arc::new(Notify::new());
    one.compiler.set_behavior("A", Behavior::Gated(gate.clone()));

    let a = project("A");
    let dag = leaf(&a);

    // Client one dispatches and holds the compilation open.
    let first = run(&scheduler, &one, &dag, false).await;
    assert_eq!(scheduler.running_compilations(), 1);

    // Client two attaches to the running compilation; its traverse blocks
    // until the shared result resolves.
    let second = {
        let scheduler = Arc::clone(&scheduler);
        let dag = Arc::clone(&dag);
        let info = two.info.clone();
        let setup = two.setup.clone();
        let compiler = two.compiler.clone();
        tokio::spawn(async move {
            scheduler.traverse(dag, info, setup, compiler, false).await
        })
    };
    tokio::task::yield_now().await;
    gate.notify_one();

    let second = second.await.unwrap();
    let first_bundle = node_result(&first).await;
    let second_bundle = node_result(&second).await;
    assert!(first_bundle.compiled.is_ok());
    assert!(second_bundle.compiled.is_ok());

    // Exactly one compile ran, on the owning client.
    assert_eq!(one.compiler.invocations(), vec!["A".to_string()]);
    assert!(two.compiler.invocations().is_empty());

    // The late subscriber replayed the producer's exact event sequence.
    assert_eq!(one.reporter.compile_events(), two.reporter.compile_events());
    assert_eq!(
        two.reporter.events(),
        vec!["previous:A:0".to_string(), "start:A".to_string(), "end:A:ok".to_string()]
    );
}

#[tokio::test(start_paused = true)]
async fn second_identical_request_reuses_completed_compilation() {
    let dir = TempDir::new().unwrap();
    let scheduler = scheduler();
    let one = client("cli-1", &dir);
    let two = client("cli-2", &dir);
    let a = project("A");
    let dag = leaf(&a);

    let first = run(&scheduler, &one, &dag, false).await;
    let first_bundle = node_result(&first).await;

    // Identical inputs, no edits: the second request deduplicates against
    // the completed compilation and no new compile is scheduled.
    let second = run(&scheduler, &two, &dag, false).await;
    let second_bundle = node_result(&second).await;

    assert_eq!(one.compiler.invocations(), vec!["A".to_string()]);
    assert!(two.compiler.invocations().is_empty());

    let (Compiled::Ok(p1), Compiled::Ok(p2)) = (&first_bundle.compiled, &second_bundle.compiled)
    else {
        panic!("expected both successes")
    };
    assert_eq!(p1.new_classes_dir, p2.new_classes_dir);
    assert_eq!(two.reporter.compile_events(), one.reporter.compile_events());
}

#[tokio::test(start_paused = true)]
async fn stalled_producer_is_disconnected_and_redispatched() {
    let dir = TempDir::new().unwrap();
    let scheduler = scheduler_with_timeout(Duration::from_secs(60));
    let one = client("cli-1", &dir);
    let two = client("cli-2", &dir);
    one.compiler.set_behavior("A", Behavior::Hang);

    let a = project("A");
    let dag = leaf(&a);

    // Client one dispatches a compilation that hangs forever.
    let first = run(&scheduler, &one, &dag, false).await;
    assert_eq!(scheduler.running_compilations(), 1);

    // Client two attaches, observes no events past the start, disconnects
    // after the timeout and re-dispatches with its own compiler.
    let second = run(&scheduler, &two, &dag, false).await;
    let second_bundle = node_result(&second).await;
    assert!(second_bundle.compiled.is_ok());

    // The re-dispatch was a fresh compilation, not a deduplication against
    // the cancelled one.
    assert_eq!(one.compiler.invocations(), vec!["A".to_string()]);
    assert_eq!(two.compiler.invocations(), vec!["A".to_string()]);

    // The cancelled producer resolves its subscribers with a cancelled
    // result and exactly one end event.
    let first_bundle = node_result(&first).await;
    assert!(matches!(first_bundle.compiled, Compiled::Cancelled));
    assert_eq!(one.reporter.end_events(), vec!["end:A:cancelled".to_string()]);

    // The disconnected client tolerates two end events: the cancelled one
    // from the stall, then the successful one from its re-dispatch.
    let ends = two.reporter.end_events();
    assert_eq!(ends.first().map(String::as_str), Some("end:A:cancelled"));
    assert_eq!(ends.last().map(String::as_str), Some("end:A:ok"));
}

#[tokio::test]
async fn superseded_classes_directory_is_deleted_after_population() {
    let dir = TempDir::new().unwrap();
    let scheduler = scheduler();
    let client = client("cli-1", &dir);
    let a = project("A");
    let dag = leaf(&a);

    // Run 1.
    let first = run(&scheduler, &client, &dag, false).await;
    let first_bundle = node_result(&first).await;
    first_bundle.populating.clone().await;
    let Compiled::Ok(p1) = &first_bundle.compiled else { panic!("expected success") };
    let dir1 = p1.new_classes_dir.clone();
    assert!(dir1.exists());

    // Simulate an edit and a validated client cache, then run 2.
    client.setup.set_digest("A", 2);
    client.setup.set_latest("A", Arc::clone(&p1.analysis));
    let second = run(&scheduler, &client, &dag, false).await;
    let second_bundle = node_result(&second).await;
    second_bundle.populating.clone().await;
    let Compiled::Ok(p2) = &second_bundle.compiled else { panic!("expected success") };
    let dir2 = p2.new_classes_dir.clone();
    assert_ne!(dir1, dir2);

    let registry = scheduler.registry();
    let current = registry.current_last_successful("A").expect("current result");
    assert_eq!(current.classes_dir(), dir2.as_path());
    assert_eq!(registry.classes_dir_refcount(&dir1), 0);
    assert_eq!(registry.classes_dir_refcount(&dir2), 1);

    // Deletion ran strictly after run 2's products settled.
    assert!(!dir1.exists());
    assert!(dir2.exists());
}

#[tokio::test]
async fn one_swap_deletes_every_superseded_directory() {
    let dir = TempDir::new().unwrap();
    let scheduler = scheduler();
    let one = client("cli-1", &dir);
    let two = client("cli-2", &dir);
    let a = project("A");
    let dag = leaf(&a);

    // Run 1 establishes the baseline result.
    let first = run(&scheduler, &one, &dag, false).await;
    let first_bundle = node_result(&first).await;
    first_bundle.populating.clone().await;
    let Compiled::Ok(p1) = &first_bundle.compiled else { panic!("expected success") };
    let dir1 = p1.new_classes_dir.clone();

    // Two concurrent edits with distinct inputs, both resuming from run 1.
    one.setup.set_digest("A", 2);
    one.setup.set_latest("A", Arc::clone(&p1.analysis));
    two.setup.set_digest("A", 3);
    two.setup.set_latest("A", Arc::clone(&p1.analysis));
    let gate_x = Arc::new(Notify::new());
    let gate_y = Arc::new(Notify::new());
    one.compiler.set_behavior("A", Behavior::Gated(gate_x.clone()));
    two.compiler.set_behavior("A", Behavior::Gated(gate_y.clone()));

    let second = run(&scheduler, &one, &dag, false).await;
    let third = run(&scheduler, &two, &dag, false).await;
    // Both attempts hold an input reference on run 1's directory.
    assert_eq!(scheduler.registry().classes_dir_refcount(&dir1), 3);

    // The first edit finishes; its predecessor is still referenced by the
    // in-flight attempt and must survive.
    gate_x.notify_one();
    let second_bundle = node_result(&second).await;
    second_bundle.populating.clone().await;
    let Compiled::Ok(p2) = &second_bundle.compiled else { panic!("expected success") };
    let dir2 = p2.new_classes_dir.clone();
    assert!(dir1.exists());
    assert!(dir2.exists());

    // The second edit finishes: its swap supersedes both its own input
    // (run 1) and the record installed meanwhile (the first edit). Both
    // directories are deleted by the same populating chain.
    gate_y.notify_one();
    let third_bundle = node_result(&third).await;
    third_bundle.populating.clone().await;
    let Compiled::Ok(p3) = &third_bundle.compiled else { panic!("expected success") };
    let dir3 = p3.new_classes_dir.clone();

    assert!(!dir1.exists());
    assert!(!dir2.exists());
    assert!(dir3.exists());

    let registry = scheduler.registry();
    assert_eq!(registry.classes_dir_refcount(&dir1), 0);
    assert_eq!(registry.classes_dir_refcount(&dir2), 0);
    assert_eq!(registry.classes_dir_refcount(&dir3), 1);
    let current = registry.current_last_successful("A").expect("current result");
    assert_eq!(current.classes_dir(), dir3.as_path());
}

#[tokio::test(start_paused = true)]
async fn pipelined_downstream_starts_on_signatures() {
    let dir = TempDir::new().unwrap();
    let scheduler = scheduler();
    let client = client("cli-1", &dir);

    let gate = Arc::new(Notify::new());
    client.compiler.set_behavior("A", Behavior::Gated(gate.clone()));

    let a = project("A");
    let b = project("B");
    let dag = parent(&b, vec![leaf(&a)]);

    // The traversal returns once every node is dispatched; A is still held
    // open by the gate. One yield lets the dispatched compile tasks record
    // their invocations before the assertions below.
    let result = run(&scheduler, &client, &dag, true).await;
    tokio::task::yield_now().await;
    let Some(PartialCompileResult::Success(b_node)) = result.value() else {
        panic!("expected dispatched parent")
    };
    let Some(PartialCompileResult::Success(a_node)) = result.children()[0].value() else {
        panic!("expected dispatched child")
    };
    assert!(b_node.pipeline.is_some());

    // B's compile started with A's signatures while A was still running.
    let a_pipeline = a_node.pipeline.as_ref().expect("pipelined child");
    assert!(a_pipeline.finished.peek().is_none());
    assert_eq!(client.compiler.invocations(), vec!["A".to_string(), "B".to_string()]);
    assert_eq!(
        client.compiler.observed_signatures("B"),
        Some(vec!["A.Api".to_string()])
    );

    // Let A finish; B's Java phase continues because A succeeded.
    gate.notify_one();
    let a_bundle = node_result(&result.children()[0]).await;
    let b_bundle = node_result(&result).await;
    assert!(a_bundle.compiled.is_ok());
    assert!(b_bundle.compiled.is_ok());
    assert_eq!(client.compiler.observed_signal("B"), Some(JavaSignal::ContinueCompilation));
}

#[tokio::test]
async fn pipelined_upstream_failure_blocks_downstream_java_phase() {
    let dir = TempDir::new().unwrap();
    let scheduler = scheduler();
    let client = client("cli-1", &dir);
    client.compiler.set_behavior("A", Behavior::Fail);

    let a = project("A");
    let b = project("B");
    let dag = parent(&b, vec![leaf(&a)]);

    let result = run(&scheduler, &client, &dag, true).await;

    // A failed without completing its signature promise, so B never ran.
    let Some(PartialCompileResult::Failure(failure)) = result.value() else {
        panic!("expected blocked parent")
    };
    assert!(matches!(&failure.cause, FailureCause::FailedOrCancelledPromise(names)
        if names == &["A".to_string()]));
    assert_eq!(client.compiler.invocations(), vec!["A".to_string()]);
}

#[tokio::test]
async fn aggregate_maps_to_empty_parent() {
    let dir = TempDir::new().unwrap();
    let scheduler = scheduler();
    let client = client("cli-1", &dir);
    let a = project("A");
    let b = project("B");
    let dag = aggregate(vec![leaf(&a), leaf(&b)]);

    let result = run(&scheduler, &client, &dag, false).await;

    assert!(matches!(result.value(), Some(PartialCompileResult::Empty)));
    assert!(matches!(&*result, Dag::Parent(_, children) if children.len() == 2));
    let mut invocations = client.compiler.invocations();
    invocations.sort();
    assert_eq!(invocations, vec!["A".to_string(), "B".to_string()]);
}

#[tokio::test]
async fn shared_subdag_compiles_once_per_request() {
    let dir = TempDir::new().unwrap();
    let scheduler = scheduler();
    let client = client("cli-1", &dir);
    let a = project("A");
    let b = project("B");
    let c = project("C");

    // Diamond: aggregate of two parents sharing the same child node.
    let shared = leaf(&a);
    let dag = aggregate(vec![
        parent(&b, vec![Arc::clone(&shared)]),
        parent(&c, vec![shared]),
    ]);

    let result = run(&scheduler, &client, &dag, false).await;
    for child in result.children() {
        node_result(child).await;
    }

    let invocations = client.compiler.invocations();
    assert_eq!(invocations.iter().filter(|name| *name == &"A".to_string()).count(), 1);
    assert_eq!(invocations.len(), 3);
}

#[tokio::test(start_paused = true)]
async fn cancelling_a_subscriber_leaves_the_producer_running() {
    let dir = TempDir::new().unwrap();
    let scheduler = scheduler();
    let one = client("cli-1", &dir);
    let two = client("cli-2", &dir);

    let gate = Arc::new(Notify::new());
    one.compiler.set_behavior("A", Behavior::Gated(gate.clone()));

    let a = project("A");
    let dag = leaf(&a);

    let first = run(&scheduler, &one, &dag, false).await;

    // Client two attaches, then cancels its own request mid-wait.
    let second = {
        let scheduler = Arc::clone(&scheduler);
        let dag = Arc::clone(&dag);
        let info = two.info.clone();
        let setup = two.setup.clone();
        let compiler = two.compiler.clone();
        tokio::spawn(async move {
            scheduler.traverse(dag, info, setup, compiler, false).await
        })
    };
    tokio::task::yield_now().await;
    two.setup.cancel_token().cancel();
    let second = second.await.unwrap();

    let Some(PartialCompileResult::Failure(failure)) = second.value() else {
        panic!("expected cancelled subscriber")
    };
    assert!(matches!(failure.cause, FailureCause::Cancelled));

    // The producer is untouched and completes once released.
    gate.notify_one();
    let first_bundle = node_result(&first).await;
    assert!(first_bundle.compiled.is_ok());
    assert_eq!(one.compiler.invocations(), vec!["A".to_string()]);
}

#[tokio::test(start_paused = true)]
async fn replay_failure_demotes_only_the_late_client() {
    let dir = TempDir::new().unwrap();
    let scheduler = scheduler();
    let one = client("cli-1", &dir);

    // A subscriber whose reporter rejects the replayed start event.
    let failing_reporter = CollectingReporter::failing_on_start();
    let two = Client {
        setup: TestSetup::new(dir.path().to_path_buf(), failing_reporter.clone()),
        reporter: failing_reporter,
        compiler: StubCompiler::new(),
        info: TestClient::new("cli-2", dir.path().to_path_buf()),
    };

    let gate = Arc::new(Notify::new());
    one.compiler.set_behavior("A", Behavior::Gated(gate.clone()));

    let a = project("A");
    let dag = leaf(&a);

    let first = run(&scheduler, &one, &dag, false).await;
    let second = {
        let scheduler = Arc::clone(&scheduler);
        let dag = Arc::clone(&dag);
        let info = two.info.clone();
        let setup = two.setup.clone();
        let compiler = two.compiler.clone();
        tokio::spawn(async move {
            scheduler.traverse(dag, info, setup, compiler, false).await
        })
    };
    tokio::task::yield_now().await;
    gate.notify_one();

    let second = second.await.unwrap();
    let second_bundle = node_result(&second).await;
    assert!(matches!(&second_bundle.compiled, Compiled::GlobalError(msg)
        if msg.starts_with("deduplication failed")));

    // The producer's own result is untouched.
    let first_bundle = node_result(&first).await;
    assert!(first_bundle.compiled.is_ok());
}

#[tokio::test]
async fn clear_successful_results_drops_the_map() {
    let dir = TempDir::new().unwrap();
    let scheduler = scheduler();
    let client = client("cli-1", &dir);
    let a = project("A");

    let result = run(&scheduler, &client, &leaf(&a), false).await;
    node_result(&result).await;
    assert!(scheduler.registry().current_last_successful("A").is_some());

    scheduler.clear_successful_results();
    assert!(scheduler.registry().current_last_successful("A").is_none());
}
