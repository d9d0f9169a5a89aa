//! In-memory mirror task store.
//!
//! Task volume is bounded by the number of distinct destinations, not by
//! request volume, so a single mutex over a map is enough.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, PoisonError};

use chrono::Utc;
use tagsync_core::error::{Error, Result};
use ulid::Ulid;

use super::MirrorTask;
use crate::metrics::SyncMetrics;

/// Key of the overall count in [`MirrorStore::summarize`].
pub const TOTAL_KEY: &str = "total";

/// Converts a lock poison error to an internal error.
fn poison_err<T>(_: PoisonError<T>) -> Error {
    Error::Internal {
        message: "mirror store lock poisoned".into(),
    }
}

#[derive(Debug, Default)]
struct Inner {
    tasks: HashMap<String, Entry>,
    next_seq: u64,
}

/// A stored task plus its insertion order, which breaks creation-time ties.
#[derive(Debug)]
struct Entry {
    seq: u64,
    task: MirrorTask,
}

/// Pending mirror tasks keyed by destination. Cheap to clone; clones share
/// state.
#[derive(Debug, Clone, Default)]
pub struct MirrorStore {
    inner: Arc<Mutex<Inner>>,
    metrics: SyncMetrics,
}

impl MirrorStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Upserts tasks by destination.
    ///
    /// A task replacing a pending one for the same destination keeps the
    /// original id and creation time, so re-detected drift does not push it
    /// to the back of the line. Tasks that already carry an id, such as a
    /// batch put back after a failed copy, keep it along with their
    /// creation time.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Internal`] if the lock is poisoned.
    pub fn put(&self, tasks: impl IntoIterator<Item = MirrorTask>) -> Result<()> {
        let mut guard = self.inner.lock().map_err(poison_err)?;
        let inner = &mut *guard;
        for mut task in tasks {
            let seq = match inner.tasks.get(&task.destination) {
                Some(previous) => {
                    task.id.clone_from(&previous.task.id);
                    task.created_at = previous.task.created_at;
                    previous.seq
                }
                None => {
                    if task.id.is_empty() {
                        task.id = Ulid::new().to_string();
                        task.created_at = Utc::now();
                    }
                    inner.next_seq += 1;
                    inner.next_seq
                }
            };
            inner.tasks.insert(task.destination.clone(), Entry { seq, task });
        }
        self.record_gauges(&inner.tasks, std::iter::empty());
        Ok(())
    }

    /// Returns up to `n` of the oldest tasks and empties the store.
    ///
    /// Tasks beyond the batch are discarded rather than kept for the next
    /// call; drift detection re-queues any destination that is still behind.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Internal`] if the lock is poisoned.
    pub fn take(&self, n: usize) -> Result<Vec<MirrorTask>> {
        let mut guard = self.inner.lock().map_err(poison_err)?;
        let inner = &mut *guard;
        let batch = oldest(&inner.tasks, n);
        let mut stored = std::mem::take(&mut inner.tasks);
        let drained: Vec<String> = stored.values().map(|e| e.task.owner.clone()).collect();
        let taken: Vec<MirrorTask> = batch
            .iter()
            .filter_map(|destination| stored.remove(destination))
            .map(|entry| entry.task)
            .collect();
        if !stored.is_empty() {
            tracing::debug!(
                taken = taken.len(),
                discarded = stored.len(),
                "discarding mirror tasks beyond batch"
            );
        }
        self.record_gauges(&inner.tasks, drained.iter().map(String::as_str));
        Ok(taken)
    }

    /// Puts back tasks whose copy failed. A destination that was queued
    /// again in the meantime keeps the newer task.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Internal`] if the lock is poisoned.
    pub fn requeue(&self, tasks: impl IntoIterator<Item = MirrorTask>) -> Result<()> {
        let mut guard = self.inner.lock().map_err(poison_err)?;
        let inner = &mut *guard;
        for mut task in tasks {
            if inner.tasks.contains_key(&task.destination) {
                continue;
            }
            if task.id.is_empty() {
                task.id = Ulid::new().to_string();
                task.created_at = Utc::now();
            }
            inner.next_seq += 1;
            let seq = inner.next_seq;
            inner.tasks.insert(task.destination.clone(), Entry { seq, task });
        }
        self.record_gauges(&inner.tasks, std::iter::empty());
        Ok(())
    }

    /// Returns up to `n` of the oldest tasks without removing them, plus the
    /// total number stored.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Internal`] if the lock is poisoned.
    pub fn show(&self, n: usize) -> Result<(Vec<MirrorTask>, usize)> {
        let inner = self.inner.lock().map_err(poison_err)?;
        let preview = oldest(&inner.tasks, n)
            .iter()
            .filter_map(|destination| inner.tasks.get(destination))
            .map(|entry| entry.task.clone())
            .collect();
        Ok((preview, inner.tasks.len()))
    }

    /// Counts tasks overall (under [`TOTAL_KEY`]) and per owner.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Internal`] if the lock is poisoned.
    pub fn summarize(&self) -> Result<BTreeMap<String, usize>> {
        let inner = self.inner.lock().map_err(poison_err)?;
        let mut summary = owner_counts(&inner.tasks);
        summary.insert(TOTAL_KEY.to_string(), inner.tasks.len());
        Ok(summary)
    }

    /// Number of stored tasks.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Internal`] if the lock is poisoned.
    pub fn len(&self) -> Result<usize> {
        Ok(self.inner.lock().map_err(poison_err)?.tasks.len())
    }

    /// Returns true if no task is stored.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Internal`] if the lock is poisoned.
    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Publishes per-owner counts; `drained` owners without tasks left are
    /// reset to zero.
    fn record_gauges<'a>(
        &self,
        stored: &HashMap<String, Entry>,
        drained: impl IntoIterator<Item = &'a str>,
    ) {
        let counts = owner_counts(stored);
        for owner in drained {
            if !counts.contains_key(owner) {
                self.metrics.set_mirror_tasks(owner, 0);
            }
        }
        for (owner, count) in counts {
            self.metrics.set_mirror_tasks(&owner, count);
        }
    }
}

/// Destinations of the `n` oldest tasks, oldest first.
fn oldest(stored: &HashMap<String, Entry>, n: usize) -> Vec<String> {
    let mut entries: Vec<&Entry> = stored.values().collect();
    entries.sort_by(|a, b| {
        a.task
            .created_at
            .cmp(&b.task.created_at)
            .then_with(|| a.seq.cmp(&b.seq))
    });
    entries
        .into_iter()
        .take(n)
        .map(|e| e.task.destination.clone())
        .collect()
}

fn owner_counts(stored: &HashMap<String, Entry>) -> BTreeMap<String, usize> {
    let mut counts = BTreeMap::new();
    for entry in stored.values() {
        *counts.entry(entry.task.owner.clone()).or_insert(0) += 1;
    }
    counts
}

#[cfg(test)]
mod tests {
    use super::*;
    use tagsync_core::id::TagIdentity;

    fn task(destination: &str, owner: &str) -> MirrorTask {
        MirrorTask::new(
            TagIdentity::new("ci", "app", "latest"),
            "registry.ci.openshift.org/ci/app@sha256:a",
            destination,
            owner,
        )
    }

    #[test]
    fn put_upserts_by_destination() {
        let store = MirrorStore::new();
        store.put([task("quay.io/a:1", "drift")]).expect("put");
        let (first, _) = store.show(1).expect("show");

        let mut replacement = task("quay.io/a:1", "drift");
        replacement.stale = true;
        store.put([replacement]).expect("put");

        let (shown, total) = store.show(10).expect("show");
        assert_eq!(total, 1);
        assert!(shown[0].stale);
        assert_eq!(shown[0].id, first[0].id);
        assert_eq!(shown[0].created_at, first[0].created_at);
    }

    #[test]
    fn take_returns_the_oldest_and_discards_the_rest() {
        let store = MirrorStore::new();
        for i in 0..5 {
            store.put([task(&format!("quay.io/a:{i}"), "drift")]).expect("put");
        }

        let taken = store.take(2).expect("take");
        assert_eq!(
            taken.iter().map(|t| t.destination.as_str()).collect::<Vec<_>>(),
            vec!["quay.io/a:0", "quay.io/a:1"]
        );
        assert!(store.is_empty().expect("empty"));
        assert!(store.take(1).expect("take").is_empty());
    }

    #[test]
    fn requeue_keeps_a_newer_task_for_the_same_destination() {
        let store = MirrorStore::new();
        store.put([task("quay.io/a:1", "drift")]).expect("put");
        let failed = store.take(1).expect("take");

        let mut newer = task("quay.io/a:1", "drift");
        newer.source = "registry.ci.openshift.org/ci/app@sha256:b".into();
        store.put([newer]).expect("put");
        store
            .requeue(failed.into_iter().chain([task("quay.io/a:2", "drift")]))
            .expect("requeue");

        let (shown, total) = store.show(10).expect("show");
        assert_eq!(total, 2);
        let kept = shown
            .iter()
            .find(|t| t.destination == "quay.io/a:1")
            .expect("task");
        assert_eq!(kept.source, "registry.ci.openshift.org/ci/app@sha256:b");
    }

    #[test]
    fn show_does_not_remove() {
        let store = MirrorStore::new();
        store
            .put([task("quay.io/a:1", "drift"), task("quay.io/a:2", "drift")])
            .expect("put");
        let (shown, total) = store.show(1).expect("show");
        assert_eq!(shown.len(), 1);
        assert_eq!(total, 2);
        assert_eq!(store.len().expect("len"), 2);
    }

    #[test]
    fn summarize_counts_total_and_owners() {
        let store = MirrorStore::new();
        store
            .put([
                task("quay.io/a:1", "drift"),
                task("quay.io/a:2", "drift"),
                task("quay.io/a:3", "supplemental"),
            ])
            .expect("put");
        let summary = store.summarize().expect("summarize");
        assert_eq!(summary.get(TOTAL_KEY), Some(&3));
        assert_eq!(summary.get("drift"), Some(&2));
        assert_eq!(summary.get("supplemental"), Some(&1));
    }

    #[test]
    fn clones_share_state() {
        let store = MirrorStore::new();
        let clone = store.clone();
        clone.put([task("quay.io/a:1", "drift")]).expect("put");
        assert_eq!(store.len().expect("len"), 1);
    }
}
