//! Post-processing of one finished compilation: last-successful swap,
//! background population of client-facing classes directories, and delayed
//! deletion of superseded directories.

use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};

use futures::FutureExt;

use crate::{
    bundle::CompileBundle,
    client::ClientInfo,
    executors::Executors,
    registry::{DeduplicationRegistry, LastSuccessfulResult},
    results::{Compiled, ResultBundle},
    task::memoize,
};

/// Applies one attempt's terminal outcome to the registry.
///
/// On failure the running-compilation entry is removed (unless a
/// disconnecting subscriber already did) and the input reference on the
/// previous classes directory is released. On success the new result is
/// installed as current and any superseded directory whose refcount reached
/// zero is deleted, strictly after both the superseded and the new products
/// finished populating.
#[allow(clippy::too_many_arguments)]
pub(crate) async fn process_result_atomically(
    registry: Arc<DeduplicationRegistry>,
    executors: Executors,
    client: Arc<dyn ClientInfo>,
    bundle: Arc<CompileBundle>,
    previous: Arc<LastSuccessfulResult>,
    unsubscribed: Arc<AtomicBool>,
    attempt: u64,
    compiled: Compiled,
) -> Arc<ResultBundle> {
    let project = Arc::clone(&bundle.project);
    let products = match compiled {
        Compiled::Ok(products) => products,
        failed => {
            if !unsubscribed.load(Ordering::SeqCst) {
                registry.remove(&bundle.unique_inputs, attempt);
            }
            registry.decrement_classes_dir_refcount(previous.classes_dir());
            return Arc::new(ResultBundle::immediate(project, failed));
        }
    };

    // Trigger background population of this client's external classes
    // directory; dependents await it before reading products.
    let external_dir = client.unique_classes_dir_for(&project);
    let populate = executors.io.spawn(products.populator.populate(external_dir));
    let populating = memoize(populate.map(|joined| {
        if let Err(err) = joined {
            warn!(target: "scheduler", %err, "Products population task died");
        }
    }));

    let new_successful = Arc::new(LastSuccessfulResult::new(
        products.new_classes_dir.clone(),
        Some(Arc::clone(&products.analysis)),
        populating.clone(),
    ));
    let superseded =
        registry.swap_last_successful(&project.unique_id, &previous, Arc::clone(&new_successful));

    // A swap may supersede several directories at once (the attempt's own
    // input record and the record it replaced as current can differ). Each
    // deletion chains onto the accumulated populating task so every
    // composite stays reachable and is driven by whoever awaits the chain.
    let mut final_populating = populating.clone();
    for old in superseded {
        if old.is_empty_sentinel() {
            continue;
        }
        info!(
            target: "scheduler",
            project = %project.name,
            dir = %old.classes_dir().display(),
            "Scheduling deletion of superseded classes directory"
        );
        // Sequence: superseded products settle, new products (and earlier
        // deletions) settle, then the superseded directory goes away.
        // Memoized so every consumer of the new record waits on the same
        // chain.
        let io = executors.io.clone();
        let old_populating = old.populating();
        let settled = final_populating.clone();
        let dir = old.classes_dir().to_path_buf();
        final_populating = memoize(async move {
            old_populating.await;
            settled.await;
            let deletion = io.spawn(async move {
                match tokio::fs::remove_dir_all(&dir).await {
                    Ok(()) => {
                        debug!(target: "scheduler", dir = %dir.display(), "Deleted superseded classes directory");
                    }
                    Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                    Err(err) => {
                        warn!(
                            target: "scheduler",
                            dir = %dir.display(),
                            %err,
                            "Failed to delete superseded classes directory"
                        );
                    }
                }
            });
            let _ = deletion.await;
        });
    }
    new_successful.set_populating(final_populating.clone());

    Arc::new(ResultBundle {
        project,
        compiled: Compiled::Ok(products),
        populating: final_populating,
    })
}
