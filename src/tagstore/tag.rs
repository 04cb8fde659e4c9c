// Copyright (c) 2025 RustyDB Contributors
//
// Caller-facing typed tag handles, path addressing, and the pluggable index
// allocator that assigns each (key, shape) pair its StaticIntMap slot.

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::{Arc, Mutex};

/// NBT-style shape discriminator. Carried alongside a tag so the index
/// allocator can distinguish two tags that share a key but not a shape (the
/// underlying int map is keyed purely on index, so a collision here is a
/// caller bug caught at allocation time, not at the map layer).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NbtType {
    End,
    Byte,
    Short,
    Int,
    Long,
    Float,
    Double,
    String,
    ByteArray,
    IntArray,
    LongArray,
    List,
    Compound,
}

/// One step of a path into the tag tree: the intermediate node's
/// serialization key and the `StaticIntMap` slot index that addresses its
/// path entry within the containing node. `index` is drawn from the same
/// allocator space as leaf tag indices; path entries and leaves are never
/// distinguished at the map layer, only by what `EntryBody` variant occupies
/// the slot.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PathSegment {
    pub name: Arc<str>,
    pub index: i32,
}

impl PathSegment {
    pub fn new(name: impl Into<Arc<str>>, index: i32) -> Self {
        Self { name: name.into(), index }
    }

    /// Allocates this segment's index from `allocator`, keyed on `name`
    /// under the `Compound` shape every path entry has.
    pub fn allocated(name: impl Into<Arc<str>>, allocator: &dyn TagIndexAllocator) -> Self {
        let name = name.into();
        let index = allocator.index_for(&name, NbtType::Compound);
        Self { name, index }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct TagPath(pub Vec<PathSegment>);

impl TagPath {
    pub fn root() -> Self {
        Self(Vec::new())
    }

    pub fn is_root(&self) -> bool {
        self.0.is_empty()
    }

    pub fn child(&self, segment: PathSegment) -> Self {
        let mut segments = self.0.clone();
        segments.push(segment);
        Self(segments)
    }
}

/// Converts between a caller's typed value and the binary-tag wire model.
/// Implementors are expected to be stateless and cheap to invoke; they run
/// under the store's write lock or inside a cache materialization.
pub trait Serializer<T>: Send + Sync {
    fn write(&self, value: &T) -> crate::tagstore::compound::BinaryTag;
    fn read(&self, tag: &crate::tagstore::compound::BinaryTag) -> Option<T>;
    fn nbt_type(&self) -> NbtType;
}

/// Lets an already-erased `Arc<dyn Serializer<T>>` (what `Tag<T>` stores)
/// stand in for a concrete `S: Serializer<T>` when building an
/// `ErasedSerializerAdapter`, so a `Tag` never needs to keep its original
/// concrete serializer type around just to re-erase it later.
impl<T: 'static> Serializer<T> for Arc<dyn Serializer<T>> {
    fn write(&self, value: &T) -> crate::tagstore::compound::BinaryTag {
        (**self).write(value)
    }

    fn read(&self, tag: &crate::tagstore::compound::BinaryTag) -> Option<T> {
        (**self).read(tag)
    }

    fn nbt_type(&self) -> NbtType {
        (**self).nbt_type()
    }
}

/// Object-safe counterpart of `Serializer<T>`, used once a tag's identity
/// has been erased into an `ErasedTagInfo` and stored in the map alongside
/// tags of unrelated types.
pub(crate) trait ErasedSerializer: Send + Sync {
    fn write_erased(&self, value: &dyn Any) -> crate::tagstore::compound::BinaryTag;
    fn read_erased(&self, tag: &crate::tagstore::compound::BinaryTag) -> Option<Box<dyn Any + Send + Sync>>;
    fn nbt_type(&self) -> NbtType;
}

pub(crate) struct ErasedSerializerAdapter<T, S> {
    inner: S,
    _marker: std::marker::PhantomData<fn() -> T>,
}

impl<T, S> ErasedSerializerAdapter<T, S> {
    pub(crate) fn new(inner: S) -> Self {
        Self { inner, _marker: std::marker::PhantomData }
    }
}

impl<T, S> ErasedSerializer for ErasedSerializerAdapter<T, S>
where
    T: Send + Sync + 'static,
    S: Serializer<T> + 'static,
{
    fn write_erased(&self, value: &dyn Any) -> crate::tagstore::compound::BinaryTag {
        let value = value
            .downcast_ref::<T>()
            .expect("erased serializer invoked with mismatched value type");
        self.inner.write(value)
    }

    fn read_erased(&self, tag: &crate::tagstore::compound::BinaryTag) -> Option<Box<dyn Any + Send + Sync>> {
        self.inner.read(tag).map(|v| Box::new(v) as Box<dyn Any + Send + Sync>)
    }

    fn nbt_type(&self) -> NbtType {
        self.inner.nbt_type()
    }
}

/// Assigns a stable integer index to each (key, shape) pair the store sees.
/// `TagStore` never invents indices itself; every tag must come from an
/// allocator so a given key always maps to the same map slot.
pub trait TagIndexAllocator: Send + Sync {
    fn index_for(&self, key: &str, shape: NbtType) -> i32;
}

/// Default allocator: hands out sequentially increasing indices, keyed by
/// (key, shape) so the same tag always maps to the same index within one
/// allocator instance's lifetime.
pub struct SequentialAllocator {
    next: AtomicI32,
    assigned: Mutex<HashMap<(String, NbtType), i32>>,
}

impl SequentialAllocator {
    pub fn new() -> Self {
        Self { next: AtomicI32::new(1), assigned: Mutex::new(HashMap::new()) }
    }
}

impl Default for SequentialAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl TagIndexAllocator for SequentialAllocator {
    fn index_for(&self, key: &str, shape: NbtType) -> i32 {
        let mut assigned = self.assigned.lock().expect("allocator mutex poisoned");
        let map_key = (key.to_owned(), shape);
        if let Some(&index) = assigned.get(&map_key) {
            return index;
        }
        let index = self.next.fetch_add(1, Ordering::Relaxed);
        assigned.insert(map_key, index);
        index
    }
}

/// A caller-facing handle for one value slot in the tree: a key, a path to
/// reach its containing node, the index that addresses it within that
/// node's map, and the serializer that converts it to and from the wire
/// representation used by `compound()`/`update_content()`.
pub struct Tag<T> {
    key: Arc<str>,
    index: i32,
    path: TagPath,
    is_view: bool,
    serializer: Arc<dyn Serializer<T>>,
    default_value: Arc<dyn Fn() -> T + Send + Sync>,
}

impl<T: 'static> Tag<T> {
    pub fn new(
        key: impl Into<Arc<str>>,
        path: TagPath,
        allocator: &dyn TagIndexAllocator,
        serializer: impl Serializer<T> + 'static,
        default_value: impl Fn() -> T + Send + Sync + 'static,
    ) -> Self {
        let key = key.into();
        let shape = serializer.nbt_type();
        let index = allocator.index_for(&key, shape);
        Self {
            key,
            index,
            path,
            is_view: false,
            serializer: Arc::new(serializer),
            default_value: Arc::new(default_value),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn index(&self) -> i32 {
        self.index
    }

    pub fn path(&self) -> &TagPath {
        &self.path
    }

    pub fn is_view(&self) -> bool {
        self.is_view
    }

    /// A view tag addresses the same slot as `self` but is marked read-only
    /// at the call site; the store itself does not enforce this, since
    /// enforcement belongs to the caller's own API surface over the tag.
    pub fn as_view(&self) -> Self {
        Self {
            key: self.key.clone(),
            index: self.index,
            path: self.path.clone(),
            is_view: true,
            serializer: self.serializer.clone(),
            default_value: self.default_value.clone(),
        }
    }

    pub fn at_path(&self, path: TagPath) -> Self {
        Self {
            key: self.key.clone(),
            index: self.index,
            path,
            is_view: self.is_view,
            serializer: self.serializer.clone(),
            default_value: self.default_value.clone(),
        }
    }

    pub fn default_value(&self) -> T {
        (self.default_value)()
    }

    pub fn shares_value_with<U: 'static>(&self, other: &Tag<U>) -> bool {
        self.index == other.index && self.path == other.path
    }

    pub(crate) fn serializer(&self) -> &Arc<dyn Serializer<T>> {
        &self.serializer
    }
}

impl<T: Send + Sync + 'static> Tag<T> {
    /// Wraps this tag's serializer in a type-erased adapter, for use once
    /// the tag's value has crossed into a node's heterogeneous
    /// `StaticIntMap<Arc<Entry>>`.
    pub(crate) fn erased_serializer(&self) -> Arc<dyn ErasedSerializer> {
        Arc::new(ErasedSerializerAdapter::<T, Arc<dyn Serializer<T>>>::new(self.serializer.clone()))
    }
}

impl<T> Clone for Tag<T> {
    fn clone(&self) -> Self {
        Self {
            key: self.key.clone(),
            index: self.index,
            path: self.path.clone(),
            is_view: self.is_view,
            serializer: self.serializer.clone(),
            default_value: self.default_value.clone(),
        }
    }
}

impl<T> fmt::Debug for Tag<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tag")
            .field("key", &self.key)
            .field("index", &self.index)
            .field("path", &self.path)
            .field("is_view", &self.is_view)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sequential_allocator_is_stable_per_key_and_shape() {
        let allocator = SequentialAllocator::new();
        let a = allocator.index_for("health", NbtType::Float);
        let b = allocator.index_for("health", NbtType::Float);
        let c = allocator.index_for("health", NbtType::Int);
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn path_root_is_empty() {
        let allocator = SequentialAllocator::new();
        let root = TagPath::root();
        assert!(root.is_root());
        let child = root.child(PathSegment::allocated("inventory", &allocator));
        assert!(!child.is_root());
    }
}
