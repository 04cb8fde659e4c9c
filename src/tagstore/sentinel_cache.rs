// Copyright (c) 2025 RustyDB Contributors
//
// The UPDATING_SENTINEL pattern behind Node::compound() and Entry::updated_nbt().
//
// Deliberately not `concurrent::CachedValue`: invalidation here is a plain
// opaque store with no waiting, whereas `CachedValue::invalidate` blocks
// until an in-flight compute drains. A writer marking a node's cache stale
// must never block on a reader's in-flight serialization. If the publish
// CAS loses the race to a concurrent invalidation, the computing thread
// simply returns its answer without caching it, and the next reader
// recomputes. This is a short-duration deferred-publication protocol, not a
// lock.

use std::sync::atomic::Ordering;

use crate::concurrent::epoch::{Atomic, Epoch, Owned};

enum Slot<T> {
    Stale,
    Computing,
    Value(T),
}

pub(crate) struct SentinelCache<T> {
    slot: Atomic<Slot<T>>,
}

impl<T: Clone> SentinelCache<T> {
    pub(crate) fn new() -> Self {
        Self { slot: Atomic::new(Slot::Stale) }
    }

    /// Force the slot back to stale. Non-blocking.
    pub(crate) fn invalidate(&self) {
        let guard = Epoch::pin();
        let stale = Owned::new(Slot::Stale).into_shared();
        let old = self.slot.swap(stale, Ordering::Release, &guard);
        if !old.is_null() {
            Epoch::defer(old.as_ptr());
        }
    }

    /// Unconditionally publish a value, bypassing the stale/computing
    /// handshake. Used by `TagStore::update_content`, which already holds
    /// the store's write lock and is seeding a freshly built tree.
    pub(crate) fn publish(&self, value: T) {
        let guard = Epoch::pin();
        let published = Owned::new(Slot::Value(value)).into_shared();
        let old = self.slot.swap(published, Ordering::Release, &guard);
        if !old.is_null() {
            Epoch::defer(old.as_ptr());
        }
    }

    /// Returns the cached value without computing it.
    pub(crate) fn peek(&self) -> Option<T> {
        let guard = Epoch::pin();
        match self.slot.load(Ordering::Acquire, &guard).as_ref() {
            Some(Slot::Value(v)) => Some(v.clone()),
            _ => None,
        }
    }

    /// Materializes the cached value, computing it via `compute` if stale.
    /// `compute` may run more than once under contention with a concurrent
    /// invalidate; only one computed result per "stale -> computing" handoff
    /// is ever published.
    pub(crate) fn materialize(&self, compute: impl Fn() -> Option<T>) -> Option<T> {
        loop {
            let guard = Epoch::pin();
            let current = self.slot.load(Ordering::Acquire, &guard);
            match current.as_ref() {
                Some(Slot::Value(v)) => return Some(v.clone()),
                Some(Slot::Stale) => {
                    let computing = Owned::new(Slot::Computing).into_shared();
                    match self.slot.compare_exchange(
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
                            let computed = compute();
                            self.try_publish(computed.clone());
                            return computed;
                        }
                        Err(_) => continue, // lost the race to become the computer
                    }
                }
                Some(Slot::Computing) => {
                    // spin-wait on opaque loads until it resolves
                    loop {
                        std::hint::spin_loop();
                        let guard = Epoch::pin();
                        let observed = self.slot.load(Ordering::Relaxed, &guard);
                        match observed.as_ref() {
                            Some(Slot::Value(v)) => return Some(v.clone()),
                            Some(Slot::Stale) => return compute(), // compute ad hoc, don't publish
                            _ => continue,
                        }
                    }
                }
                None => unreachable!("sentinel cache slot is never null"),
            }
        }
    }

    fn try_publish(&self, computed: Option<T>) {
        let guard = Epoch::pin();
        let current = self.slot.load(Ordering::Acquire, &guard);
        if !matches!(current.as_ref(), Some(Slot::Computing)) {
            return; // a concurrent invalidate already moved the slot on
        }
        let next = match computed {
            Some(v) => Owned::new(Slot::Value(v)).into_shared(),
            None => Owned::new(Slot::Stale).into_shared(),
        };
        if let Ok(old) = self.slot.compare_exchange(current, next, Ordering::AcqRel, Ordering::Acquire, &guard) {
            if !old.is_null() {
                Epoch::defer(old.as_ptr());
            }
        }
        // CAS failure: a concurrent invalidate raced us; don't publish.
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;

    #[test]
    fn materialize_computes_once_then_caches() {
        let calls = Arc::new(AtomicUsize::new(0));
        let cache = SentinelCache::<i32>::new();
        let calls2 = calls.clone();
        let compute = move || {
            calls2.fetch_add(1, Ordering::SeqCst);
            Some(7)
        };
        assert_eq!(cache.materialize(compute.clone()), Some(7));
        assert_eq!(cache.materialize(compute), Some(7));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn invalidate_forces_recompute() {
        let cache = SentinelCache::<i32>::new();
        assert_eq!(cache.materialize(|| Some(1)), Some(1));
        cache.invalidate();
        assert_eq!(cache.peek(), None);
        assert_eq!(cache.materialize(|| Some(2)), Some(2));
    }
}
