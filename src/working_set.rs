// src/working_set.rs - Admission gate for processing batches
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashSet};
use tokio::sync::Notify;
use tracing::trace;

/// Set of entity ids currently being written by in-flight batches.
///
/// [`WorkingSet::add`] waits until the requested ids are disjoint from the
/// held set and then inserts them atomically; [`WorkingSet::remove`] releases
/// them and wakes every waiter. Two batches sharing an id therefore never
/// run at the same time, while batches with disjoint ids are admitted
/// together.
///
/// Only the dispatcher calls `add`, so admission stays FIFO: a batch that
/// overlaps the held set blocks every batch queued behind it.
#[derive(Debug, Default)]
pub struct WorkingSet {
    held: Mutex<HashSet<i32>>,
    released: Notify,
}

impl WorkingSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait until `ids` can be held, then hold them
    pub async fn add(&self, ids: &BTreeSet<i32>) {
        loop {
            let notified = self.released.notified();
            tokio::pin!(notified);
            // Register interest before checking, so a release between the
            // check and the await is not lost.
            notified.as_mut().enable();
            if self.try_add(ids) {
                return;
            }
            trace!("Working set busy, waiting for release of {:?}", ids);
            notified.await;
        }
    }

    /// Hold `ids` if none of them is currently held
    pub fn try_add(&self, ids: &BTreeSet<i32>) -> bool {
        let mut held = self.held.lock();
        if ids.iter().any(|id| held.contains(id)) {
            return false;
        }
        held.extend(ids.iter().copied());
        true
    }

    /// Release `ids` and wake any waiting admission
    pub fn remove(&self, ids: &BTreeSet<i32>) {
        {
            let mut held = self.held.lock();
            for id in ids {
                held.remove(id);
            }
        }
        self.released.notify_waiters();
    }

    pub fn contains(&self, id: i32) -> bool {
        self.held.lock().contains(&id)
    }

    pub fn len(&self) -> usize {
        self.held.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.held.lock().is_empty()
    }
}
