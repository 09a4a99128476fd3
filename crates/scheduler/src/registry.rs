//! The deduplication registry: the only process-wide mutable state of the
//! scheduler.
//!
//! Three independently locked maps live here: running compilations keyed by
//! [`UniqueCompileInputs`], last-successful results keyed by project id, and
//! the refcount table keyed by classes-directory path. Whenever an operation
//! touches more than one of them it takes the locks in the order
//! `running -> last_successful -> refcounts` and never the reverse.
//!
//! Refcount accounting: a classes directory holds one reference for being
//! the current last-successful of its project, plus one reference per
//! in-flight compilation that selected it as input. Deletion of a directory
//! is considered only at the moment a successor replaces it and its count
//! has dropped to zero.

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{
    Arc, Mutex, PoisonError,
    atomic::{AtomicBool, AtomicU64, Ordering},
};

use tokio::task::AbortHandle;
use tokio_util::sync::CancellationToken;

use crate::{
    inputs::UniqueCompileInputs,
    mirror::EventMirror,
    project::Project,
    reporter::Problem,
    results::{CompileAnalysis, PipelineHandles, ResultBundle, is_empty_sentinel},
    task::{SharedTask, ready_task},
};

/// The artifacts of the most recent successful compilation of a project.
pub struct LastSuccessfulResult {
    classes_dir: PathBuf,
    analysis: Option<Arc<CompileAnalysis>>,
    populating: Mutex<SharedTask<()>>,
}

impl LastSuccessfulResult {
    /// Creates a record for a freshly successful compilation.
    pub fn new(
        classes_dir: PathBuf,
        analysis: Option<Arc<CompileAnalysis>>,
        populating: SharedTask<()>,
    ) -> Self {
        Self { classes_dir, analysis, populating: Mutex::new(populating) }
    }

    /// The sentinel record for a project that has never compiled
    /// successfully. Its classes directory is never deleted and its
    /// populating task is already complete.
    pub fn empty(project: &Project) -> Self {
        let dir = std::env::temp_dir()
            .join("kiln")
            .join(format!("classes-empty-{}", project.unique_id));
        Self::new(dir, None, ready_task(()))
    }

    /// The on-disk classes directory of this result.
    pub fn classes_dir(&self) -> &Path {
        &self.classes_dir
    }

    /// The analysis handle, absent for the empty sentinel.
    pub fn analysis(&self) -> Option<&Arc<CompileAnalysis>> {
        self.analysis.as_ref()
    }

    /// Diagnostics standing in this result's analysis.
    pub fn problems(&self) -> Vec<Problem> {
        self.analysis.as_ref().map(|analysis| analysis.problems.clone()).unwrap_or_default()
    }

    /// The task that materializes this result's products (and, once a
    /// successor exists, the cleanup of the directory it superseded).
    pub fn populating(&self) -> SharedTask<()> {
        self.populating.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Replaces the populating task; used to chain superseded-directory
    /// cleanup behind products materialization.
    pub(crate) fn set_populating(&self, task: SharedTask<()>) {
        *self.populating.lock().unwrap_or_else(PoisonError::into_inner) = task;
    }

    /// Whether this is the empty sentinel.
    pub fn is_empty_sentinel(&self) -> bool {
        is_empty_sentinel(&self.classes_dir)
    }

    /// Whether the classes directory is usable as compiler input. The
    /// sentinel always is; real directories must exist on disk.
    pub fn classes_dir_exists(&self) -> bool {
        self.is_empty_sentinel() || self.classes_dir.exists()
    }
}

impl fmt::Debug for LastSuccessfulResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LastSuccessfulResult")
            .field("classes_dir", &self.classes_dir)
            .field("has_analysis", &self.analysis.is_some())
            .finish_non_exhaustive()
    }
}

/// A live compilation shared by every client that deduplicates against it.
pub(crate) struct RunningCompilation {
    /// The memoized result every subscriber shares.
    pub(crate) result: SharedTask<Arc<ResultBundle>>,
    /// The event log subscribers replay.
    pub(crate) mirror: Arc<EventMirror>,
    /// Diagnostics re-derived from the analysis this compilation started
    /// from; late subscribers receive them before live replay.
    pub(crate) previous_problems: Vec<Problem>,
    /// Pipelining handles of the producing attempt, shared with every
    /// deduplicated subscriber.
    pub(crate) pipeline: Option<PipelineHandles>,
    /// Set by the subscriber that disconnected this compilation.
    pub(crate) unsubscribed: Arc<AtomicBool>,
    /// Cancels the producing attempt.
    pub(crate) cancel: CancellationToken,
    /// Hard-kills the producing task when the compiler ignores its token.
    pub(crate) abort: AbortHandle,
    /// The client that dispatched this compilation.
    pub(crate) owner_client: String,
    /// Registry-unique attempt id, used for compare-and-remove.
    pub(crate) attempt: u64,
}

impl RunningCompilation {
    pub(crate) fn is_unsubscribed(&self) -> bool {
        self.unsubscribed.load(Ordering::SeqCst)
    }

    /// Marks this compilation as disconnected from deduplication.
    pub(crate) fn unsubscribe(&self) {
        self.unsubscribed.store(true, Ordering::SeqCst);
    }

    /// Cancels the producing attempt: cooperative token first, hard abort
    /// for compilers that no longer observe it.
    pub(crate) fn cancel_ongoing(&self) {
        self.cancel.cancel();
        self.abort.abort();
    }
}

impl fmt::Debug for RunningCompilation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RunningCompilation")
            .field("owner_client", &self.owner_client)
            .field("attempt", &self.attempt)
            .field("unsubscribed", &self.is_unsubscribed())
            .finish_non_exhaustive()
    }
}

/// Process-wide bookkeeping of running compilations, last-successful
/// results, and classes-directory refcounts.
#[derive(Debug, Default)]
pub(crate) struct DeduplicationRegistry {
    running: Mutex<HashMap<UniqueCompileInputs, Arc<RunningCompilation>>>,
    last_successful: Mutex<HashMap<String, Arc<LastSuccessfulResult>>>,
    refcounts: Mutex<HashMap<PathBuf, i64>>,
    attempts: AtomicU64,
}

impl DeduplicationRegistry {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Allocates a registry-unique attempt id.
    pub(crate) fn next_attempt_id(&self) -> u64 {
        self.attempts.fetch_add(1, Ordering::SeqCst)
    }

    /// Returns the running compilation for `key`, inserting the one built by
    /// `dispatch` when none exists. The boolean is true when this call
    /// inserted, i.e. when the caller owns the compilation.
    pub(crate) fn lookup_or_insert(
        &self,
        key: &UniqueCompileInputs,
        dispatch: impl FnOnce() -> Arc<RunningCompilation>,
    ) -> (Arc<RunningCompilation>, bool) {
        let mut running = self.running.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(existing) = running.get(key) {
            return (Arc::clone(existing), false);
        }
        let inserted = dispatch();
        running.insert(key.clone(), Arc::clone(&inserted));
        (inserted, true)
    }

    /// Removes the entry for `key` only when it still holds the attempt the
    /// caller observed, so a racing re-dispatch is never evicted.
    pub(crate) fn remove(&self, key: &UniqueCompileInputs, expected_attempt: u64) -> bool {
        let mut running = self.running.lock().unwrap_or_else(PoisonError::into_inner);
        match running.get(key) {
            Some(current) if current.attempt == expected_attempt => {
                running.remove(key);
                true
            }
            _ => false,
        }
    }

    /// The current last-successful result for `project_id`, inserting
    /// `fallback` as current when none exists. Atomically increments the
    /// refcount of the returned result's classes directory: the caller now
    /// holds an input reference it must release through
    /// [`DeduplicationRegistry::swap_last_successful`] or
    /// [`DeduplicationRegistry::decrement_classes_dir_refcount`].
    pub(crate) fn get_or_insert_last_successful(
        &self,
        project_id: &str,
        fallback: Arc<LastSuccessfulResult>,
    ) -> Arc<LastSuccessfulResult> {
        let mut last = self.last_successful.lock().unwrap_or_else(PoisonError::into_inner);
        let chosen = match last.get(project_id) {
            Some(current) => Arc::clone(current),
            None => {
                last.insert(project_id.to_string(), Arc::clone(&fallback));
                let mut counts = self.refcounts.lock().unwrap_or_else(PoisonError::into_inner);
                // The current-pointer reference of the newly installed record.
                Self::increment(&mut counts, fallback.classes_dir());
                drop(counts);
                fallback
            }
        };
        let mut counts = self.refcounts.lock().unwrap_or_else(PoisonError::into_inner);
        // The caller's input reference.
        Self::increment(&mut counts, chosen.classes_dir());
        chosen
    }

    /// The current last-successful result for `project_id`, if any.
    pub(crate) fn current_last_successful(
        &self,
        project_id: &str,
    ) -> Option<Arc<LastSuccessfulResult>> {
        self.last_successful
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(project_id)
            .cloned()
    }

    /// Installs `new` as the current last-successful result of
    /// `project_id`, releasing the caller's input reference on `previous`
    /// and the current-pointer reference of whichever record it replaces.
    ///
    /// Returns the superseded records whose directories reached refcount
    /// zero and differ from the new directory: the caller owns scheduling
    /// their deletion (skipping empty sentinels).
    pub(crate) fn swap_last_successful(
        &self,
        project_id: &str,
        previous: &Arc<LastSuccessfulResult>,
        new: Arc<LastSuccessfulResult>,
    ) -> Vec<Arc<LastSuccessfulResult>> {
        let mut last = self.last_successful.lock().unwrap_or_else(PoisonError::into_inner);
        let replaced = last.insert(project_id.to_string(), Arc::clone(&new));
        let mut counts = self.refcounts.lock().unwrap_or_else(PoisonError::into_inner);

        // Install the new current-pointer reference before any decrement so
        // a same-directory swap can never dip the count to zero.
        Self::increment(&mut counts, new.classes_dir());

        let mut superseded: Vec<Arc<LastSuccessfulResult>> = Vec::new();
        Self::decrement(&mut counts, previous.classes_dir());
        superseded.push(Arc::clone(previous));
        if let Some(replaced) = replaced {
            Self::decrement(&mut counts, replaced.classes_dir());
            if !superseded.iter().any(|c| c.classes_dir() == replaced.classes_dir()) {
                superseded.push(replaced);
            }
        }

        superseded.retain(|candidate| {
            candidate.classes_dir() != new.classes_dir()
                && counts.get(candidate.classes_dir()).copied().unwrap_or(0) == 0
        });
        superseded
    }

    /// Releases an input reference without installing a successor; the error
    /// path counterpart of [`DeduplicationRegistry::swap_last_successful`].
    pub(crate) fn decrement_classes_dir_refcount(&self, dir: &Path) {
        let mut counts = self.refcounts.lock().unwrap_or_else(PoisonError::into_inner);
        Self::decrement(&mut counts, dir);
    }

    /// The refcount currently recorded for `dir`.
    pub(crate) fn classes_dir_refcount(&self, dir: &Path) -> i64 {
        self.refcounts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(dir)
            .copied()
            .unwrap_or(0)
    }

    /// Number of running compilations currently registered.
    pub(crate) fn running_count(&self) -> usize {
        self.running.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Drops every last-successful result, releasing their current-pointer
    /// references. Test hook used between scenarios.
    pub(crate) fn clear_successful_results(&self) {
        let mut last = self.last_successful.lock().unwrap_or_else(PoisonError::into_inner);
        let drained: Vec<_> = last.drain().collect();
        let mut counts = self.refcounts.lock().unwrap_or_else(PoisonError::into_inner);
        for (_, record) in drained {
            Self::decrement(&mut counts, record.classes_dir());
        }
    }

    fn increment(counts: &mut HashMap<PathBuf, i64>, dir: &Path) {
        // Empty sentinels are never deleted, so they are not counted either.
        if is_empty_sentinel(dir) {
            return;
        }
        *counts.entry(dir.to_path_buf()).or_insert(0) += 1;
    }

    fn decrement(counts: &mut HashMap<PathBuf, i64>, dir: &Path) {
        if is_empty_sentinel(dir) {
            return;
        }
        let count = counts.entry(dir.to_path_buf()).or_insert(0);
        *count -= 1;
        if *count < 0 {
            warn!(target: "registry", dir = %dir.display(), "Classes directory refcount underflow");
            *count = 0;
        }
    }
}
