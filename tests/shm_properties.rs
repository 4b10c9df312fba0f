//! Concurrency properties of the shared regions.
//!
//! Every thread maps the region file separately, the same way worker
//! processes do.

use std::collections::HashSet;
use std::sync::Barrier;
use std::thread;

use proptest::prelude::*;
use tempfile::tempdir;

use tidepool::{LatencyRingBuffer, SharedCounterStore};

proptest! {
    #![proptest_config(ProptestConfig::with_cases(16))]

    #[test]
    fn no_lost_updates(threads in 2usize..6, increments in 1usize..400, keys in 1usize..4) {
        let dir = tempdir().unwrap();
        let path = dir.path().join("counters.shm");
        let store = SharedCounterStore::create(&path, 64).unwrap();
        let barrier = Barrier::new(threads);

        thread::scope(|scope| {
            for t in 0..threads {
                let path = &path;
                let barrier = &barrier;
                scope.spawn(move || {
                    let store = SharedCounterStore::open(path).unwrap();
                    barrier.wait();
                    for i in 0..increments {
                        store.increment(&format!("hits.k{}", (t + i) % keys), 1).unwrap();
                    }
                });
            }
        });

        let total: i64 = (0..keys)
            .map(|k| store.get(&format!("hits.k{}", k)).unwrap_or(0))
            .sum();
        prop_assert_eq!(total, (threads * increments) as i64);
    }

    #[test]
    fn ring_never_double_writes_a_slot(threads in 2usize..6, per_thread in 1usize..200) {
        let dir = tempdir().unwrap();
        let path = dir.path().join("latency.shm");
        let capacity = threads * per_thread;
        let ring = LatencyRingBuffer::create(&path, capacity).unwrap();
        let barrier = Barrier::new(threads);

        thread::scope(|scope| {
            for t in 0..threads {
                let path = &path;
                let barrier = &barrier;
                scope.spawn(move || {
                    let ring = LatencyRingBuffer::open(path).unwrap();
                    barrier.wait();
                    for i in 0..per_thread {
                        // Distinct, non-zero sample per push.
                        ring.push((t * per_thread + i + 1) as u64);
                    }
                });
            }
        });

        // With exactly one lap of pushes every slot holds a different sample.
        let samples = ring.recent(capacity);
        prop_assert_eq!(samples.len(), capacity);
        let distinct: HashSet<u64> = samples.iter().copied().collect();
        prop_assert_eq!(distinct.len(), capacity);
        prop_assert!(samples.iter().all(|&s| s >= 1 && s <= capacity as u64));
    }

    #[test]
    fn snapshot_matches_flat_entries(
        counts in prop::collection::btree_map("[a-z]{1,6}", 1i64..1000, 1..12)
    ) {
        let dir = tempdir().unwrap();
        let store = SharedCounterStore::create(&dir.path().join("c.shm"), 64).unwrap();
        for (name, count) in &counts {
            store.increment(&format!("requests.codes.{}", name), *count).unwrap();
        }

        let snapshot = store.snapshot("requests");
        for (name, count) in &counts {
            prop_assert_eq!(snapshot["requests"]["codes"][name].as_i64(), Some(*count));
        }
    }
}
