// src/sequencer.rs - Per-kind monotonic identifiers for produced snapshots
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::debug;

/// Kind of data item stamped by the [`Sequencer`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataKind {
    SystemEntity,
    Parameter,
    Alarm,
    Event,
    ActivityOccurrence,
    ActivityReport,
    ScheduledActivity,
}

impl DataKind {
    pub const ALL: [DataKind; 7] = [
        DataKind::SystemEntity,
        DataKind::Parameter,
        DataKind::Alarm,
        DataKind::Event,
        DataKind::ActivityOccurrence,
        DataKind::ActivityReport,
        DataKind::ScheduledActivity,
    ];
}

/// Thread-safe map of counters, one per [`DataKind`].
///
/// Every snapshot produced by the processing model carries an id obtained
/// from here, so consumers can order snapshots of one kind without relying
/// on wall-clock time. The counters are owned by the model (not global) and
/// can be saved and restored across restarts.
///
/// ```rust
/// use tmtc::sequencer::{DataKind, Sequencer};
///
/// let seq = Sequencer::new();
/// let first = seq.next(DataKind::Parameter);
/// let second = seq.next(DataKind::Parameter);
/// assert!(second > first);
///
/// let saved = seq.snapshot();
/// let restored = Sequencer::with_initial(&saved);
/// assert!(restored.next(DataKind::Parameter) > second);
/// ```
#[derive(Debug)]
pub struct Sequencer {
    counters: DashMap<DataKind, AtomicU64>,
}

impl Sequencer {
    pub fn new() -> Self {
        let counters = DashMap::new();
        for kind in DataKind::ALL {
            counters.insert(kind, AtomicU64::new(0));
        }
        Self { counters }
    }

    /// Create a sequencer resuming from previously saved values
    pub fn with_initial(initial: &BTreeMap<DataKind, u64>) -> Self {
        let seq = Self::new();
        seq.restore(initial);
        seq
    }

    /// Next id for the given kind. Ids start at 1.
    pub fn next(&self, kind: DataKind) -> u64 {
        match self.counters.get(&kind) {
            Some(counter) => counter.fetch_add(1, Ordering::SeqCst) + 1,
            None => {
                let entry = self.counters.entry(kind).or_insert_with(|| AtomicU64::new(0));
                entry.fetch_add(1, Ordering::SeqCst) + 1
            }
        }
    }

    /// Last id handed out for the given kind (0 if none)
    pub fn current(&self, kind: DataKind) -> u64 {
        self.counters
            .get(&kind)
            .map(|c| c.load(Ordering::SeqCst))
            .unwrap_or(0)
    }

    pub fn snapshot(&self) -> BTreeMap<DataKind, u64> {
        self.counters
            .iter()
            .map(|entry| (*entry.key(), entry.value().load(Ordering::SeqCst)))
            .collect()
    }

    /// Restore saved counters. Counters never move backwards.
    pub fn restore(&self, saved: &BTreeMap<DataKind, u64>) {
        for (kind, value) in saved {
            debug!("Restoring sequencer {:?} to {}", kind, value);
            self.counters
                .entry(*kind)
                .or_insert_with(|| AtomicU64::new(0))
                .fetch_max(*value, Ordering::SeqCst);
        }
    }
}

impl Default for Sequencer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_kinds_are_independent() {
        let seq = Sequencer::new();
        assert_eq!(seq.next(DataKind::Parameter), 1);
        assert_eq!(seq.next(DataKind::Parameter), 2);
        assert_eq!(seq.next(DataKind::Event), 1);
        assert_eq!(seq.current(DataKind::Parameter), 2);
    }

    #[test]
    fn test_restore_never_goes_backwards() {
        let seq = Sequencer::new();
        for _ in 0..10 {
            seq.next(DataKind::Event);
        }
        let mut saved = BTreeMap::new();
        saved.insert(DataKind::Event, 3);
        seq.restore(&saved);
        assert_eq!(seq.next(DataKind::Event), 11);
    }

    #[test]
    fn test_concurrent_ids_are_unique() {
        let seq = Arc::new(Sequencer::new());
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let seq = seq.clone();
                std::thread::spawn(move || {
                    (0..250).map(|_| seq.next(DataKind::Parameter)).collect::<Vec<_>>()
                })
            })
            .collect();
        let mut all: Vec<u64> = handles.into_iter().flat_map(|h| h.join().unwrap()).collect();
        all.sort_unstable();
        all.dedup();
        assert_eq!(all.len(), 1000);
        assert_eq!(all.last().copied(), Some(1000));
    }
}
