// Copyright (c) 2025 RustyDB Contributors
//
// Single-writer, multi-reader open-addressed int map.
//
// `entries` is a single atomic reference to an immutable `{keys[], values[]}`
// pair, reclaimed through the epoch scheme in `concurrent::epoch` rather than
// dropped in place. Readers never take a lock; writers (`put`,
// `remove`, `rehash`) must be externally serialized by the caller (for
// `tagstore::TagStore` that serialization is the store's writer mutex).

use std::sync::atomic::{fence, AtomicI64, AtomicUsize, Ordering};

use crate::concurrent::epoch::{Atomic, Epoch, Shared};
use crate::error::{Result, TagStoreError};

const EMPTY: i64 = 0;
const TOMBSTONE: i64 = -1;
const INITIAL_CAPACITY: usize = 8;
const LOAD_FACTOR: f64 = 0.7;

fn probe_index(k: i32, i: u64, mask: u64) -> usize {
    let k = k as u64;
    let h = (k << 1).wrapping_add(i).wrapping_add(i.wrapping_mul(i));
    ((h >> 1) & mask) as usize
}

/// Array-indexed variant for small, dense key spaces.
struct ArrayInner<T> {
    values: Box<[Atomic<T>]>,
}

impl<T> ArrayInner<T> {
    fn with_len(len: usize) -> Self {
        let values = (0..len).map(|_| Atomic::null()).collect::<Vec<_>>().into_boxed_slice();
        Self { values }
    }
}

struct ArrayMap<T> {
    slots: Atomic<ArrayInner<T>>,
}

impl<T> ArrayMap<T> {
    fn new() -> Self {
        Self { slots: Atomic::new(ArrayInner::with_len(0)) }
    }

    /// Grow the backing array via `copyOf(key*2+1)`, moving each existing
    /// slot's pointer rather than cloning it, then swap in the new array.
    fn ensure_capacity(&self, key: usize) {
        let guard = Epoch::pin();
        let shared = self.slots.load(Ordering::Acquire, &guard);
        let current_len = shared.as_ref().map(|inner| inner.values.len()).unwrap_or(0);
        if key < current_len {
            return;
        }
        let new_len = key * 2 + 1;
        let new_inner = ArrayInner::with_len(new_len);
        if let Some(old) = shared.as_ref() {
            for (i, slot) in old.values.iter().enumerate() {
                let moved = slot.swap(Shared::null(), Ordering::Relaxed, &guard);
                new_inner.values[i].store(moved, Ordering::Relaxed);
            }
        }
        let owned = crate::concurrent::epoch::Owned::new(new_inner).into_shared();
        let old = self.slots.swap(owned, Ordering::Release, &guard);
        if !old.is_null() {
            Epoch::defer(old.as_ptr());
        }
    }

    fn put(&self, k: i32, v: T) {
        debug_assert!(k >= 0);
        self.ensure_capacity(k as usize);
        let guard = Epoch::pin();
        let shared = self.slots.load(Ordering::Acquire, &guard);
        let inner = shared
            .as_ref()
            .unwrap_or_else(|| panic!("static int map: array slot missing after grow"));
        let owned = crate::concurrent::epoch::Owned::new(v).into_shared();
        let old = inner.values[k as usize].swap(owned, Ordering::Relaxed, &guard);
        if !old.is_null() {
            Epoch::defer(old.as_ptr());
        }
    }

    fn remove(&self, k: i32) {
        if k < 0 {
            return;
        }
        let guard = Epoch::pin();
        let shared = self.slots.load(Ordering::Acquire, &guard);
        let Some(inner) = shared.as_ref() else { return };
        if k as usize >= inner.values.len() {
            return;
        }
        let old = inner.values[k as usize].swap(Shared::null(), Ordering::Relaxed, &guard);
        if !old.is_null() {
            Epoch::defer(old.as_ptr());
        }
    }

    fn len_capacity(&self) -> usize {
        let guard = Epoch::pin();
        let shared = self.slots.load(Ordering::Acquire, &guard);
        shared.as_ref().map(|i| i.values.len()).unwrap_or(0)
    }

    /// Wholesale-replaces this map's backing array with `other`'s, moving
    /// the atomic reference rather than cloning every slot.
    fn replace_from(&self, other: &ArrayMap<T>) {
        let guard = Epoch::pin();
        let moved = other.slots.swap(Shared::null(), Ordering::Relaxed, &guard);
        let old = self.slots.swap(moved, Ordering::Release, &guard);
        if !old.is_null() {
            Epoch::defer(old.as_ptr());
        }
    }
}

impl<T: Clone> ArrayMap<T> {
    fn get(&self, k: i32) -> Option<T> {
        if k < 0 {
            return None;
        }
        let guard = Epoch::pin();
        let shared = self.slots.load(Ordering::Acquire, &guard);
        let inner = shared.as_ref()?;
        let idx = k as usize;
        if idx >= inner.values.len() {
            return None;
        }
        inner.values[idx].load(Ordering::Relaxed, &guard).as_ref().cloned()
    }

    fn for_values(&self, mut f: impl FnMut(&T)) {
        let guard = Epoch::pin();
        let shared = self.slots.load(Ordering::Acquire, &guard);
        let Some(inner) = shared.as_ref() else { return };
        for slot in inner.values.iter() {
            if let Some(v) = slot.load(Ordering::Relaxed, &guard).as_ref() {
                f(v);
            }
        }
    }
}

/// Hash-indexed variant: open-addressed, quadratic-probed.
struct Inner<T> {
    keys: Box<[AtomicI64]>,
    values: Box<[Atomic<T>]>,
    capacity: usize,
}

impl<T> Inner<T> {
    fn empty(capacity: usize) -> Self {
        let keys = (0..capacity).map(|_| AtomicI64::new(EMPTY)).collect::<Vec<_>>().into_boxed_slice();
        let values = (0..capacity).map(|_| Atomic::null()).collect::<Vec<_>>().into_boxed_slice();
        Self { keys, values, capacity }
    }
}

struct HashMapInt<T> {
    entries: Atomic<Inner<T>>,
    size: AtomicUsize,
}

impl<T> HashMapInt<T> {
    fn new() -> Self {
        Self { entries: Atomic::new(Inner::empty(0)), size: AtomicUsize::new(0) }
    }

    fn len(&self) -> usize {
        self.size.load(Ordering::Relaxed)
    }

    fn capacity(&self) -> usize {
        let guard = Epoch::pin();
        let shared = self.entries.load(Ordering::Acquire, &guard);
        shared.as_ref().map(|i| i.capacity).unwrap_or(0)
    }

    fn allocate_initial(&self, guard: &crate::concurrent::epoch::EpochGuard) {
        let owned = crate::concurrent::epoch::Owned::new(Inner::empty(INITIAL_CAPACITY)).into_shared();
        let old = self.entries.swap(owned, Ordering::Release, guard);
        if !old.is_null() {
            Epoch::defer(old.as_ptr());
        }
    }

    fn put(&self, k: i32, v: T) {
        debug_assert!(k >= 0, "static int map keys must be non-negative");
        let stored_key = k as i64 + 1;
        let guard = Epoch::pin();

        loop {
            let shared = self.entries.load(Ordering::Acquire, &guard);
            let needs_init = shared.as_ref().map(|i| i.capacity == 0).unwrap_or(true);
            if needs_init {
                self.allocate_initial(&guard);
                continue;
            }
            let inner = shared.as_ref().expect("checked above");
            let mask = (inner.capacity - 1) as u64;

            let mut first_tombstone = None;
            let mut target = None;
            for i in 0..inner.capacity as u64 {
                let idx = probe_index(k, i, mask);
                let stored = inner.keys[idx].load(Ordering::Relaxed);
                if stored == stored_key {
                    target = Some(idx);
                    break;
                } else if stored == TOMBSTONE {
                    if first_tombstone.is_none() {
                        first_tombstone = Some(idx);
                    }
                } else if stored == EMPTY {
                    target = Some(first_tombstone.unwrap_or(idx));
                    break;
                }
            }
            let idx = target.unwrap_or_else(|| {
                panic!(
                    "{}",
                    TagStoreError::InvariantViolation(
                        "static int map: no free slot found within capacity despite load-factor invariant".into()
                    )
                )
            });

            let prev_stored = inner.keys[idx].load(Ordering::Relaxed);
            let is_new = prev_stored != stored_key;

            let owned = crate::concurrent::epoch::Owned::new(v).into_shared();
            let old_value = inner.values[idx].swap(owned, Ordering::Relaxed, &guard);
            fence(Ordering::Release); // storeStore: value visible before key publishes it
            inner.keys[idx].store(stored_key, Ordering::Relaxed);
            if !old_value.is_null() {
                Epoch::defer(old_value.as_ptr());
            }

            if is_new {
                let new_size = self.size.fetch_add(1, Ordering::Relaxed) + 1;
                if new_size as f64 >= inner.capacity as f64 * LOAD_FACTOR {
                    self.rehash(inner.capacity * 2, &guard);
                }
            }
            return;
        }
    }

    fn remove(&self, k: i32) {
        let stored_key = k as i64 + 1;
        let guard = Epoch::pin();
        let shared = self.entries.load(Ordering::Acquire, &guard);
        let Some(inner) = shared.as_ref() else { return };
        if inner.capacity == 0 {
            return;
        }
        let mask = (inner.capacity - 1) as u64;
        for i in 0..inner.capacity as u64 {
            let idx = probe_index(k, i, mask);
            let stored = inner.keys[idx].load(Ordering::Relaxed);
            if stored == EMPTY {
                return;
            }
            if stored == stored_key {
                inner.keys[idx].store(TOMBSTONE, Ordering::Relaxed);
                fence(Ordering::Release); // storeStore: tombstone key before nulling value
                let old_value = inner.values[idx].swap(Shared::null(), Ordering::Relaxed, &guard);
                if !old_value.is_null() {
                    Epoch::defer(old_value.as_ptr());
                }
                let old_size = self.size.fetch_sub(1, Ordering::Relaxed);
                let new_size = old_size - 1;
                if new_size == 0 {
                    self.clear_to_empty_sentinel(&guard);
                } else if (new_size + 1) as f64 <= (1.0 - LOAD_FACTOR) * inner.capacity as f64 {
                    self.rehash(inner.capacity / 2, &guard);
                }
                return;
            }
            // tombstone or mismatched live key: keep probing
        }
    }

    fn clear_to_empty_sentinel(&self, guard: &crate::concurrent::epoch::EpochGuard) {
        let owned = crate::concurrent::epoch::Owned::new(Inner::empty(0)).into_shared();
        let old = self.entries.swap(owned, Ordering::Release, guard);
        if !old.is_null() {
            Epoch::defer(old.as_ptr());
        }
    }

    fn rehash(&self, new_len: usize, guard: &crate::concurrent::epoch::EpochGuard) {
        let new_len = new_len.max(INITIAL_CAPACITY).next_power_of_two();
        let shared = self.entries.load(Ordering::Acquire, guard);
        let Some(old_inner) = shared.as_ref() else { return };
        if new_len == old_inner.capacity {
            return;
        }
        tracing::trace!(old_capacity = old_inner.capacity, new_capacity = new_len, "static int map: rehashing");
        if new_len > old_inner.capacity && old_inner.capacity >= 1 << 20 {
            tracing::warn!(
                capacity = old_inner.capacity,
                "static int map: growing past a million slots, check the allocator isn't leaking indices"
            );
        }
        let new_inner = Inner::empty(new_len);
        let new_mask = (new_len - 1) as u64;

        for idx in 0..old_inner.capacity {
            let stored = old_inner.keys[idx].load(Ordering::Relaxed);
            if stored == EMPTY || stored == TOMBSTONE {
                continue;
            }
            fence(Ordering::Acquire); // loadLoad before reading the value
            let moved = old_inner.values[idx].swap(Shared::null(), Ordering::Relaxed, guard);
            let k = (stored - 1) as i32;
            for i in 0..new_len as u64 {
                let new_idx = probe_index(k, i, new_mask);
                if new_inner.keys[new_idx].load(Ordering::Relaxed) == EMPTY {
                    new_inner.values[new_idx].store(moved, Ordering::Relaxed);
                    fence(Ordering::Release);
                    new_inner.keys[new_idx].store(stored, Ordering::Relaxed);
                    break;
                }
            }
        }

        let owned = crate::concurrent::epoch::Owned::new(new_inner).into_shared();
        let old = self.entries.swap(owned, Ordering::Release, guard);
        Epoch::defer(old.as_ptr());
    }

    fn replace_from(&self, other: &HashMapInt<T>) {
        let guard = Epoch::pin();
        let moved = other.entries.swap(Shared::null(), Ordering::Relaxed, &guard);
        let old = self.entries.swap(moved, Ordering::Release, &guard);
        if !old.is_null() {
            Epoch::defer(old.as_ptr());
        }
        self.size.store(other.size.swap(0, Ordering::Relaxed), Ordering::Relaxed);
    }
}

impl<T: Clone> HashMapInt<T> {
    fn get(&self, k: i32) -> Option<T> {
        let stored_key = k as i64 + 1;
        let guard = Epoch::pin();
        let shared = self.entries.load(Ordering::Acquire, &guard);
        let inner = shared.as_ref()?;
        if inner.capacity == 0 {
            return None;
        }
        let mask = (inner.capacity - 1) as u64;
        for i in 0..inner.capacity as u64 {
            let idx = probe_index(k, i, mask);
            let stored = inner.keys[idx].load(Ordering::Relaxed);
            if stored == EMPTY {
                return None;
            }
            if stored == stored_key {
                fence(Ordering::Acquire); // loadLoad: value write happens-before this key write
                return inner.values[idx].load(Ordering::Relaxed, &guard).as_ref().cloned();
            }
            // tombstone or mismatched key: keep probing
        }
        None
    }

    fn for_values(&self, mut f: impl FnMut(&T)) {
        let guard = Epoch::pin();
        let shared = self.entries.load(Ordering::Acquire, &guard);
        let Some(inner) = shared.as_ref() else { return };
        for idx in 0..inner.capacity {
            let stored = inner.keys[idx].load(Ordering::Relaxed);
            if stored == EMPTY || stored == TOMBSTONE {
                continue;
            }
            fence(Ordering::Acquire);
            if let Some(v) = inner.values[idx].load(Ordering::Relaxed, &guard).as_ref() {
                f(v);
            }
        }
    }
}

/// Shape selector for `StaticIntMap::new`. `Array` suits small, dense key
/// spaces; `Hash` suits sparse or large key spaces.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MapShape {
    Array,
    Hash,
}

/// Single-writer, multi-reader int-keyed map underlying every `tagstore`
/// node. See module docs for the concurrency contract.
pub enum StaticIntMap<T> {
    Array(ArrayMap<T>),
    Hash(HashMapInt<T>),
}

impl<T> StaticIntMap<T> {
    pub fn new(shape: MapShape) -> Self {
        match shape {
            MapShape::Array => StaticIntMap::Array(ArrayMap::new()),
            MapShape::Hash => StaticIntMap::Hash(HashMapInt::new()),
        }
    }

    fn variant_name(&self) -> &'static str {
        match self {
            StaticIntMap::Array(_) => "Array",
            StaticIntMap::Hash(_) => "Hash",
        }
    }

    /// External synchronization required: callers must guarantee at most one
    /// thread calls `put`/`remove`/`rehash`/`update_content` at a time.
    pub fn put(&self, k: i32, v: T) {
        match self {
            StaticIntMap::Array(m) => m.put(k, v),
            StaticIntMap::Hash(m) => m.put(k, v),
        }
    }

    /// External synchronization required (see `put`).
    pub fn remove(&self, k: i32) {
        match self {
            StaticIntMap::Array(m) => m.remove(k),
            StaticIntMap::Hash(m) => m.remove(k),
        }
    }

    pub fn len(&self) -> usize {
        match self {
            StaticIntMap::Array(m) => {
                let mut count = 0usize;
                m.for_values(|_| count += 1);
                count
            }
            StaticIntMap::Hash(m) => m.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        match self {
            StaticIntMap::Array(m) => m.len_capacity(),
            StaticIntMap::Hash(m) => m.capacity(),
        }
    }

    /// Wholesale replace this map's contents with `other`'s, per
    /// `StaticIntMap.updateContent`. Fails with `VariantMismatch` if `other`
    /// is not the same array-vs-hash shape as `self`.
    pub fn update_content(&self, other: StaticIntMap<T>) -> Result<()> {
        match (self, &other) {
            (StaticIntMap::Array(a), StaticIntMap::Array(b)) => {
                a.replace_from(b);
                Ok(())
            }
            (StaticIntMap::Hash(a), StaticIntMap::Hash(b)) => {
                a.replace_from(b);
                Ok(())
            }
            _ => Err(TagStoreError::VariantMismatch {
                expected: self.variant_name(),
                found: other.variant_name(),
            }),
        }
    }
}

impl<T: Clone> StaticIntMap<T> {
    pub fn get(&self, k: i32) -> Option<T> {
        match self {
            StaticIntMap::Array(m) => m.get(k),
            StaticIntMap::Hash(m) => m.get(k),
        }
    }

    pub fn for_values(&self, f: impl FnMut(&T)) {
        match self {
            StaticIntMap::Array(m) => m.for_values(f),
            StaticIntMap::Hash(m) => m.for_values(f),
        }
    }

    /// Snapshot every live value into a `Vec`, in slot order.
    pub fn copy_values(&self) -> Vec<T> {
        let mut out = Vec::new();
        self.for_values(|v| out.push(v.clone()));
        out
    }
}
