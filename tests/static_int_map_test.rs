// Cross-module stress tests for `StaticIntMap`, exercising the map read
// safety and map size invariant properties under concurrent readers racing
// a single writer.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;

use tagstore::{MapShape, StaticIntMap};

mod common;

/// For a key set committed before readers start, every concurrent `get(k)`
/// for k in that set must observe the committed value, regardless of what
/// unrelated keys the writer is inserting concurrently.
#[test]
fn concurrent_readers_see_committed_keys_under_a_racing_writer() {
    let map = Arc::new(StaticIntMap::<i32>::new(MapShape::Hash));
    for k in 0..64 {
        map.put(k, k * 10);
    }

    let barrier = Arc::new(Barrier::new(9));
    let mut handles = Vec::new();

    for t in 0..8 {
        let map = map.clone();
        let barrier = barrier.clone();
        handles.push(thread::spawn(move || {
            barrier.wait();
            for _ in 0..2000 {
                for k in 0..64 {
                    assert_eq!(map.get(k), Some(k * 10), "reader {t} saw a torn value for key {k}");
                }
            }
        }));
    }

    let writer_map = map.clone();
    let writer_barrier = barrier.clone();
    handles.push(thread::spawn(move || {
        writer_barrier.wait();
        for k in 64..512 {
            writer_map.put(k, k * 10);
        }
    }));

    for h in handles {
        h.join().unwrap();
    }

    for k in 0..512 {
        assert_eq!(map.get(k), Some(k * 10));
    }
}

/// After any sequence of puts/removes by the single writer, the number of
/// live (non-empty, non-tombstone) slots observed via `for_values` matches
/// the number of keys the writer believes are still present.
#[test]
fn size_matches_live_entries_after_interleaved_put_remove() {
    let map = StaticIntMap::<i32>::new(MapShape::Hash);
    let mut expected = std::collections::HashSet::new();

    for k in 0..200 {
        map.put(k, k);
        expected.insert(k);
    }
    for k in (0..200).step_by(3) {
        map.remove(k);
        expected.remove(&k);
    }
    for k in 200..260 {
        map.put(k, k);
        expected.insert(k);
    }

    let count = Arc::new(AtomicUsize::new(0));
    map.for_values(|_| {
        count.fetch_add(1, Ordering::Relaxed);
    });
    assert_eq!(count.load(Ordering::Relaxed), expected.len());

    for k in expected {
        assert_eq!(map.get(k), Some(k));
    }
}

/// Readers must never observe a half-migrated entry mid-rehash: growing the
/// map by two orders of magnitude while readers poll a fixed key set should
/// never return a stale or torn value for keys that were never touched.
#[test]
fn readers_survive_growth_through_several_rehashes() {
    common::init_tracing();
    let map = Arc::new(StaticIntMap::<i32>::new(MapShape::Hash));
    map.put(1, 111);
    map.put(2, 222);

    let barrier = Arc::new(Barrier::new(5));
    let mut handles = Vec::new();
    for _ in 0..4 {
        let map = map.clone();
        let barrier = barrier.clone();
        handles.push(thread::spawn(move || {
            barrier.wait();
            for _ in 0..5000 {
                assert_eq!(map.get(1), Some(111));
                assert_eq!(map.get(2), Some(222));
            }
        }));
    }

    let writer_map = map.clone();
    let writer_barrier = barrier.clone();
    handles.push(thread::spawn(move || {
        writer_barrier.wait();
        for k in 3..2000 {
            writer_map.put(k, k);
        }
    }));

    for h in handles {
        h.join().unwrap();
    }
}
