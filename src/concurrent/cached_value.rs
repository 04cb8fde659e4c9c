// Copyright (c) 2025 RustyDB Contributors
//
// Single-slot memoizing cell with concurrent recomputation, invalidation,
// and overwrite.
//
// The three-state slot (`Invalid` / `Computing` / `Value(T)`) lives behind
// the same `concurrent::epoch::Atomic` used by `static_int_map` so that a
// reader observing a concrete value keeps it alive across a concurrent
// `set`/`invalidate` without an extra refcount scheme. Waiter coordination
// uses a packed `AtomicU32` signal word rather than three separate atomics,
// the same tradeoff `concurrent::rwlock_wp::RwLockWP` makes for its
// reader/writer/waiter state.
//
// Parks are not interruptible: `std::thread::park` has no cancellation
// concept, so the "deferred interrupt" error kind this primitive's source
// material describes has no analogue here. That is a strict subset of the
// original contract (there is nothing to defer), not a violation of it.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::thread::{self, Thread};

use crate::concurrent::epoch::{Atomic, Epoch, Owned};
use crate::error::{Result, TagStoreError};

const COMPUTE_COUNTER_MASK: u32 = 0x1FFF_FFFF; // bits 0..28
const UNBLOCK_COMPUTE: u32 = 1 << 29;
const UNBLOCK_INVALIDATE: u32 = 1 << 30;
const INVALIDATE_MASK: u32 = 1 << 31;
const STATUS_MASK: u32 = UNBLOCK_COMPUTE | UNBLOCK_INVALIDATE;

enum Slot<T> {
    Invalid,
    Computing,
    Value(T),
}

struct Waiter {
    thread: Thread,
    is_invalidate: bool,
}

/// Outcome of waiting as a queued getter: either a value was produced, or the
/// computation was invalidated before this thread was ever unblocked with a
/// result, in which case the caller must restart `get`'s outer loop.
enum WaitOutcome<T> {
    Value(T),
    Restart,
}

pub struct CachedValue<T> {
    supplier: Box<dyn Fn() -> T + Send + Sync>,
    value: Atomic<Slot<T>>,
    signal: AtomicU32,
    waiters: Mutex<VecDeque<Waiter>>,
}

impl<T> CachedValue<T> {
    pub fn new(supplier: impl Fn() -> T + Send + Sync + 'static) -> Self {
        Self {
            supplier: Box::new(supplier),
            value: Atomic::new(Slot::Invalid),
            signal: AtomicU32::new(0),
            waiters: Mutex::new(VecDeque::new()),
        }
    }

    /// True once a value is cached and no compute/invalidate is in flight.
    pub fn is_cached(&self) -> bool {
        let guard = Epoch::pin();
        matches!(self.value.load(Ordering::Acquire, &guard).as_ref(), Some(Slot::Value(_)))
    }
}

impl<T: Clone> CachedValue<T> {
    /// Returns the cached value, computing it at most once per generation.
    /// Concurrent getters during a compute block until it finishes and
    /// observe the same result.
    pub fn get(&self) -> Result<T> {
        loop {
            let guard = Epoch::pin();
            let current = self.value.load(Ordering::Acquire, &guard);
            match current.as_ref() {
                Some(Slot::Invalid) => {
                    let computing = Owned::new(Slot::Computing).into_shared();
                    match self.value.compare_exchange(
                        current,
                        computing,
                        Ordering::AcqRel,
                        Ordering::Acquire,
                        &guard,
                    ) {
                        Ok(old) => {
                            if !old.is_null() {
                                Epoch::defer(old.as_ptr());
                            }
                            return self.compute_and_publish();
                        }
                        Err(_) => continue, // lost the race to become the computer
                    }
                }
                Some(Slot::Computing) => match self.wait_as_getter()? {
                    WaitOutcome::Value(v) => return Ok(v),
                    WaitOutcome::Restart => continue,
                },
                Some(Slot::Value(v)) => return Ok(v.clone()),
                None => unreachable!("cached value slot is never null"),
            }
        }
    }

    fn compute_and_publish(&self) -> Result<T> {
        struct RevertOnPanic<'a, T: Clone> {
            owner: &'a CachedValue<T>,
            completed: bool,
        }
        impl<'a, T: Clone> Drop for RevertOnPanic<'a, T> {
            fn drop(&mut self) {
                if !self.completed {
                    self.owner.revert_to_invalid();
                }
            }
        }

        let mut guard = RevertOnPanic { owner: self, completed: false };
        let new_value = (self.supplier)();
        guard.completed = true;

        let waiters_guard = self.waiters.lock().unwrap();
        let epoch_guard = Epoch::pin();
        let current = self.value.load(Ordering::Acquire, &epoch_guard);
        if matches!(current.as_ref(), Some(Slot::Computing)) {
            let published = Owned::new(Slot::Value(new_value.clone())).into_shared();
            match self.value.compare_exchange(
                current,
                published,
                Ordering::AcqRel,
                Ordering::Acquire,
                &epoch_guard,
            ) {
                Ok(old) => {
                    if !old.is_null() {
                        Epoch::defer(old.as_ptr());
                    }
                    self.unblock_waiters(waiters_guard);
                    Ok(new_value)
                }
                Err(observed) => Ok(Self::expect_value(observed.as_ref())),
            }
        } else {
            // A concurrent `set` already overrode us; it already unblocked waiters.
            Ok(Self::expect_value(current.as_ref()))
        }
    }

    fn expect_value(slot: Option<&Slot<T>>) -> T {
        match slot {
            Some(Slot::Value(v)) => v.clone(),
            _ => panic!(
                "{}",
                TagStoreError::InvariantViolation(
                    "cached value: expected a published value after compute or override".into()
                )
            ),
        }
    }

    fn revert_to_invalid(&self) {
        let waiters_guard = self.waiters.lock().unwrap();
        let epoch_guard = Epoch::pin();
        let current = self.value.load(Ordering::Acquire, &epoch_guard);
        if matches!(current.as_ref(), Some(Slot::Computing)) {
            let invalid = Owned::new(Slot::Invalid).into_shared();
            if let Ok(old) = self.value.compare_exchange(
                current,
                invalid,
                Ordering::AcqRel,
                Ordering::Acquire,
                &epoch_guard,
            ) {
                if !old.is_null() {
                    Epoch::defer(old.as_ptr());
                }
            }
        }
        self.unblock_waiters(waiters_guard);
    }

    /// Called when `value == Computing` is observed. Queues this thread as a
    /// getter and parks until the compute (or a panic-triggered revert)
    /// resolves.
    fn wait_as_getter(&self) -> Result<WaitOutcome<T>> {
        {
            let waiters_guard = self.waiters.lock().unwrap();
            let epoch_guard = Epoch::pin();
            let current = self.value.load(Ordering::Acquire, &epoch_guard);
            match current.as_ref() {
                Some(Slot::Value(v)) => return Ok(WaitOutcome::Value(v.clone())),
                Some(Slot::Invalid) => return Ok(WaitOutcome::Restart),
                Some(Slot::Computing) => {}
                None => unreachable!("cached value slot is never null"),
            }
            self.increment_compute_counter()?;
            let mut waiters_guard = waiters_guard;
            waiters_guard.push_front(Waiter { thread: thread::current(), is_invalidate: false });
        } // mutex released before parking

        loop {
            thread::park();
            let sig = self.signal.load(Ordering::Acquire);
            if sig & STATUS_MASK != UNBLOCK_COMPUTE {
                continue; // spurious wakeup or status not yet ours
            }
            let epoch_guard = Epoch::pin();
            let current = self.value.load(Ordering::Acquire, &epoch_guard);
            match current.as_ref() {
                Some(Slot::Value(v)) => {
                    let v = v.clone();
                    self.signal.fetch_sub(1, Ordering::AcqRel);
                    return Ok(WaitOutcome::Value(v));
                }
                Some(Slot::Invalid) => {
                    self.signal.fetch_sub(1, Ordering::AcqRel);
                    return Ok(WaitOutcome::Restart);
                }
                _ => continue, // not yet resolved; keep waiting
            }
        }
    }

    fn increment_compute_counter(&self) -> Result<()> {
        loop {
            let current = self.signal.load(Ordering::Relaxed);
            if current & COMPUTE_COUNTER_MASK == COMPUTE_COUNTER_MASK {
                return Err(TagStoreError::ComputeCounterOverflow);
            }
            let next = current + 1;
            if self
                .signal
                .compare_exchange_weak(current, next, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                return Ok(());
            }
        }
    }

    /// Called while holding `waiters`, after `value` has just transitioned
    /// away from `Computing`. Wakes queued getters first, then the single
    /// pending invalidator (if any), per the ordering spelled out in
    /// `invalidate`'s contract: an invalidator arriving mid-compute never
    /// robs a concurrent getter of the computed result.
    fn unblock_waiters(&self, mut waiters_guard: MutexGuard<VecDeque<Waiter>>) {
        self.signal.fetch_or(UNBLOCK_COMPUTE, Ordering::AcqRel);
        let mut saw_invalidate = false;

        while let Some(waiter) = waiters_guard.pop_front() {
            if waiter.is_invalidate {
                while self.signal.load(Ordering::Acquire) & COMPUTE_COUNTER_MASK != 0 {
                    std::hint::spin_loop();
                }
                loop {
                    let sig = self.signal.load(Ordering::Acquire);
                    let next = (sig & !UNBLOCK_COMPUTE) | UNBLOCK_INVALIDATE;
                    if self
                        .signal
                        .compare_exchange_weak(sig, next, Ordering::AcqRel, Ordering::Relaxed)
                        .is_ok()
                    {
                        break;
                    }
                }
                waiter.thread.unpark();
                saw_invalidate = true;
                break;
            }
            waiter.thread.unpark();
        }

        if saw_invalidate {
            while self.signal.load(Ordering::Acquire) & INVALIDATE_MASK != 0 {
                std::hint::spin_loop();
            }
        } else {
            while self.signal.load(Ordering::Acquire) & COMPUTE_COUNTER_MASK != 0 {
                std::hint::spin_loop();
            }
        }
        self.signal.fetch_and(!STATUS_MASK, Ordering::AcqRel);
        waiters_guard.clear();
    }

    /// Invalidates the cached value. Returns `false` if the slot was already
    /// `Invalid`, or if another invalidate is already pending against an
    /// in-flight compute.
    pub fn invalidate(&self) -> bool {
        let waiters_guard = self.waiters.lock().unwrap();
        let epoch_guard = Epoch::pin();
        let current = self.value.load(Ordering::Acquire, &epoch_guard);
        match current.as_ref() {
            Some(Slot::Invalid) => false,
            Some(Slot::Value(_)) => {
                let invalid = Owned::new(Slot::Invalid).into_shared();
                match self.value.compare_exchange(
                    current,
                    invalid,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                    &epoch_guard,
                ) {
                    Ok(old) => {
                        if !old.is_null() {
                            Epoch::defer(old.as_ptr());
                        }
                        true
                    }
                    Err(_) => panic!(
                        "{}",
                        TagStoreError::InvariantViolation(
                            "cached value: concrete value mutated outside the invalidate/compute mutex".into()
                        )
                    ),
                }
            }
            Some(Slot::Computing) => {
                let prev = self.signal.fetch_or(INVALIDATE_MASK, Ordering::AcqRel);
                if prev & INVALIDATE_MASK != 0 {
                    return false; // another invalidate already pending
                }
                tracing::debug!("cached value: invalidate waiting for in-flight compute to drain");
                let mut waiters_guard = waiters_guard;
                waiters_guard.push_back(Waiter { thread: thread::current(), is_invalidate: true });
                drop(waiters_guard);

                loop {
                    thread::park();
                    let sig = self.signal.load(Ordering::Acquire);
                    if sig & STATUS_MASK == UNBLOCK_INVALIDATE {
                        break;
                    }
                }

                let epoch_guard = Epoch::pin();
                let current = self.value.load(Ordering::Acquire, &epoch_guard);
                let invalid = Owned::new(Slot::Invalid).into_shared();
                self.value.store(invalid, Ordering::Release);
                if !current.is_null() {
                    Epoch::defer(current.as_ptr());
                }
                self.signal.fetch_and(!INVALIDATE_MASK, Ordering::AcqRel);
                true
            }
            None => unreachable!("cached value slot is never null"),
        }
    }

    /// Unconditionally overwrites the cached value. If a compute was in
    /// flight, its result (when it finishes) is discarded in favor of this
    /// override, and any parked getters are unblocked with `v`.
    pub fn set(&self, v: T) {
        let waiters_guard = self.waiters.lock().unwrap();
        let epoch_guard = Epoch::pin();
        let current = self.value.load(Ordering::Acquire, &epoch_guard);
        let was_computing = matches!(current.as_ref(), Some(Slot::Computing));
        let published = Owned::new(Slot::Value(v)).into_shared();
        let old = self.value.swap(published, Ordering::AcqRel, &epoch_guard);
        if !old.is_null() {
            Epoch::defer(old.as_ptr());
        }
        if was_computing {
            self.unblock_waiters(waiters_guard);
        }
    }

    /// Sets the value only if the slot is currently `Invalid`. Lock-free.
    pub fn set_if_invalid(&self, v: T) -> bool {
        let epoch_guard = Epoch::pin();
        let current = self.value.load(Ordering::Acquire, &epoch_guard);
        if !matches!(current.as_ref(), Some(Slot::Invalid)) {
            return false;
        }
        let published = Owned::new(Slot::Value(v)).into_shared();
        match self.value.compare_exchange(
            current,
            published,
            Ordering::AcqRel,
            Ordering::Acquire,
            &epoch_guard,
        ) {
            Ok(old) => {
                if !old.is_null() {
                    Epoch::defer(old.as_ptr());
                }
                true
            }
            Err(_) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::{Arc, Barrier};
    use std::thread;
    use std::time::Duration;

    #[test]
    fn get_computes_once_and_caches() {
        let calls = Arc::new(AtomicUsize::new(0));
        let calls2 = calls.clone();
        let cv = CachedValue::new(move || {
            calls2.fetch_add(1, Ordering::SeqCst);
            42
        });
        assert_eq!(cv.get().unwrap(), 42);
        assert_eq!(cv.get().unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn invalidate_forces_recompute() {
        let counter = Arc::new(AtomicUsize::new(0));
        let counter2 = counter.clone();
        let cv = CachedValue::new(move || counter2.fetch_add(1, Ordering::SeqCst));
        assert_eq!(cv.get().unwrap(), 0);
        assert_eq!(cv.get().unwrap(), 0);
        assert!(cv.invalidate());
        assert_eq!(cv.get().unwrap(), 1);
        assert!(cv.invalidate());
        assert_eq!(cv.get().unwrap(), 2);
    }

    #[test]
    fn idempotent_invalidate_on_invalid_slot() {
        let cv = CachedValue::new(|| 1);
        assert!(!cv.invalidate());
        assert!(!cv.invalidate());
    }

    #[test]
    fn concurrent_getters_see_single_computation() {
        let calls = Arc::new(AtomicUsize::new(0));
        let calls2 = calls.clone();
        let cv = Arc::new(CachedValue::new(move || {
            calls2.fetch_add(1, Ordering::SeqCst);
            thread::sleep(Duration::from_millis(50));
            1
        }));
        let barrier = Arc::new(Barrier::new(3));
        let handles: Vec<_> = (0..3)
            .map(|_| {
                let cv = cv.clone();
                let barrier = barrier.clone();
                thread::spawn(move || {
                    barrier.wait();
                    cv.get().unwrap()
                })
            })
            .collect();
        for h in handles {
            assert_eq!(h.join().unwrap(), 1);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn set_overrides_in_flight_compute() {
        let cv = Arc::new(CachedValue::new(|| {
            thread::sleep(Duration::from_millis(100));
            999
        }));
        let cv2 = cv.clone();
        let getter = thread::spawn(move || cv2.get().unwrap());
        thread::sleep(Duration::from_millis(20));
        cv.set(0);
        assert_eq!(getter.join().unwrap(), 0);
        assert_eq!(cv.get().unwrap(), 0);
    }

    #[test]
    fn set_if_invalid_only_applies_when_invalid() {
        let cv = CachedValue::new(|| 7);
        assert!(cv.set_if_invalid(1));
        assert!(!cv.set_if_invalid(2));
        assert_eq!(cv.get().unwrap(), 1);
    }

    #[test]
    fn supplier_panic_leaves_slot_invalid_and_unblocks_waiters() {
        let attempt = Arc::new(AtomicUsize::new(0));
        let attempt2 = attempt.clone();
        let cv = Arc::new(CachedValue::new(move || {
            if attempt2.fetch_add(1, Ordering::SeqCst) == 0 {
                panic!("supplier failed on first attempt");
            }
            5
        }));
        let cv2 = cv.clone();
        let result = thread::spawn(move || {
            let _ = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| cv2.get()));
        })
        .join();
        assert!(result.is_ok());
        assert_eq!(cv.get().unwrap(), 5);
    }

    #[test]
    fn quiescent_cached_value_has_no_signal_bits_or_waiters() {
        let cv = CachedValue::new(|| 1);
        cv.get().unwrap();
        cv.invalidate();
        cv.get().unwrap();
        assert_eq!(cv.signal.load(Ordering::SeqCst), 0);
        assert!(cv.waiters.lock().unwrap().is_empty());
    }
}
