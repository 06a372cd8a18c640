use proptest::prelude::*;
use std::collections::BTreeMap;
use std::sync::Arc;
use tmtc::{DataKind, Sequencer};

fn any_kind() -> impl Strategy<Value = DataKind> {
    prop_oneof![
        Just(DataKind::SystemEntity),
        Just(DataKind::Parameter),
        Just(DataKind::Alarm),
        Just(DataKind::Event),
        Just(DataKind::ActivityOccurrence),
        Just(DataKind::ActivityReport),
        Just(DataKind::ScheduledActivity),
    ]
}

proptest! {
    #[test]
    fn test_ids_strictly_increase_per_kind(kinds in prop::collection::vec(any_kind(), 1..200)) {
        let sequencer = Sequencer::new();
        let mut last: BTreeMap<DataKind, u64> = BTreeMap::new();
        for kind in kinds {
            let id = sequencer.next(kind);
            if let Some(previous) = last.insert(kind, id) {
                prop_assert!(id > previous);
            }
            prop_assert_eq!(sequencer.current(kind), id);
        }
    }

    #[test]
    fn test_restored_sequencer_never_reissues(kinds in prop::collection::vec(any_kind(), 1..100)) {
        let first = Sequencer::new();
        let issued: Vec<(DataKind, u64)> = kinds.iter().map(|k| (*k, first.next(*k))).collect();

        let resumed = Sequencer::with_initial(&first.snapshot());
        for (kind, id) in issued {
            prop_assert!(resumed.next(kind) > id);
        }
    }

    #[test]
    fn test_concurrent_ids_are_unique(threads in 2usize..6, per_thread in 1usize..200) {
        let sequencer = Arc::new(Sequencer::new());
        let handles: Vec<_> = (0..threads)
            .map(|_| {
                let sequencer = sequencer.clone();
                std::thread::spawn(move || {
                    (0..per_thread).map(|_| sequencer.next(DataKind::Parameter)).collect::<Vec<_>>()
                })
            })
            .collect();

        let mut all: Vec<u64> = handles.into_iter().flat_map(|h| h.join().unwrap()).collect();
        all.sort_unstable();
        all.dedup();
        prop_assert_eq!(all.len(), threads * per_thread);
    }
}
