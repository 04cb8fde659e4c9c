// Copyright (c) 2025 RustyDB Contributors
//
// Hierarchical, index-addressed attribute store. `TagStore` is a tree of
// `Node`s, each owning one `StaticIntMap<Arc<Entry>>` and a lazily cached,
// incrementally invalidated serialized `Compound` for its subtree. Reads
// walk the tree without taking any lock, relying on the map's memory
// ordering guarantees; every write is serialized through `write_mutex`, the
// single store-wide writer lock spec.md §5 requires.

pub mod compound;
mod entry;
mod node;
mod sentinel_cache;
pub mod tag;

pub use node::TagStoreConfig;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::tagstore::compound::{BinaryTag, Compound};
use crate::tagstore::entry::{clone_fn_for, Entry, ErasedTagInfo};
use crate::tagstore::node::{Node, TagStoreConfig};
use crate::tagstore::sentinel_cache::SentinelCache;
use crate::tagstore::tag::{NbtType, PathSegment, SequentialAllocator, Tag, TagIndexAllocator, TagPath};

/// A cheap, read-only snapshot of a store's contents, handed to callers
/// (event handlers, diagnostics) who must not be able to mutate the tree
/// through it. Backed by the same `Compound` `asCompound()` produces;
/// distinguished at the type level purely so a reader can't accidentally
/// call store-mutating methods on it.
#[derive(Debug, Clone)]
pub struct ReadOnlyView(Arc<Compound>);

impl ReadOnlyView {
    pub fn compound(&self) -> &Compound {
        &self.0
    }
}

/// Tree of `StaticIntMap`s addressed by `Tag<T>` handles, with lock-free
/// reads and mutex-protected writes. See the module docs for the
/// concurrency contract.
pub struct TagStore {
    allocator: Arc<dyn TagIndexAllocator>,
    config: Arc<TagStoreConfig>,
    root: Arc<Node>,
    write_mutex: Mutex<()>,
    readable_cache: SentinelCache<Arc<Compound>>,
}

impl TagStore {
    pub fn new(allocator: Arc<dyn TagIndexAllocator>, config: TagStoreConfig) -> Self {
        let config = Arc::new(config);
        Self {
            root: Node::new_root(config.clone()),
            allocator,
            config,
            write_mutex: Mutex::new(()),
            readable_cache: SentinelCache::new(),
        }
    }

    /// Convenience constructor for callers with no allocator of their own;
    /// tests and examples use this rather than wiring up `SequentialAllocator`
    /// by hand each time.
    pub fn with_sequential_allocator() -> Self {
        Self::new(Arc::new(SequentialAllocator::new()), TagStoreConfig::default())
    }

    pub fn config(&self) -> &Arc<TagStoreConfig> {
        &self.config
    }

    pub fn allocator(&self) -> &Arc<dyn TagIndexAllocator> {
        &self.allocator
    }

    // ---- read traversal (lock-free) --------------------------------------

    fn resolve_read(&self, path: &TagPath) -> Option<Arc<Node>> {
        let mut current = self.root.clone();
        for segment in &path.0 {
            let entry = current.get(segment.index)?;
            let child = entry.child()?;
            current = child.clone();
        }
        Some(current)
    }

    /// Pure read; returns the tag's value, or `tag.default_value()` on a
    /// miss. Never takes the store's write lock.
    pub fn get_tag<T: Clone + 'static>(&self, tag: &Tag<T>) -> T {
        let found = self.resolve_read(tag.path()).and_then(|node| {
            let entry = node.get(tag.index())?;
            entry.with_leaf_value::<T, _>(|v| v.cloned())
        });
        found.unwrap_or_else(|| tag.default_value())
    }

    // ---- write traversal (present=true allocates; false aborts on a gap) --

    /// Walks `path` under the write lock, allocating intermediate nodes as
    /// needed when `create` is true. If a segment is occupied by a non-path
    /// entry that itself carries a compound, the displaced entry's compound
    /// seeds the freshly allocated child (`populate_from_compound`) rather
    /// than the child starting empty. Returns `None` without allocating
    /// anything if `create` is false and any segment is missing.
    fn resolve_write(&self, path: &TagPath, create: bool) -> Option<Arc<Node>> {
        let mut current = self.root.clone();
        for segment in &path.0 {
            current = match current.get(segment.index) {
                Some(entry) if entry.is_path() => entry.child().expect("checked is_path above").clone(),
                Some(entry) => {
                    if !create {
                        return None;
                    }
                    let seeded = entry.updated_nbt().and_then(|nbt| match nbt.as_ref() {
                        BinaryTag::Compound(c) => Some(c.clone()),
                        _ => None,
                    });
                    let child = Node::new_child(&current);
                    if let Some(compound) = seeded {
                        child.populate_from_compound(&compound, self.allocator.as_ref());
                    }
                    let info = ErasedTagInfo::for_path(segment.name.clone(), segment.index, NbtType::Compound);
                    current.put(segment.index, Arc::new(Entry::new_path(info, child.clone())));
                    child
                }
                None => {
                    if !create {
                        return None;
                    }
                    let child = Node::new_child(&current);
                    let info = ErasedTagInfo::for_path(segment.name.clone(), segment.index, NbtType::Compound);
                    current.put(segment.index, Arc::new(Entry::new_path(info, child.clone())));
                    child
                }
            };
        }
        Some(current)
    }

    fn after_write(&self, node: &Arc<Node>) {
        node.invalidate();
        self.readable_cache.invalidate();
    }

    /// `set(tag, Some(value))` writes; `set(tag, None)` removes.
    pub fn set_tag<T>(&self, tag: &Tag<T>, value: Option<T>)
    where
        T: Clone + Send + Sync + 'static,
    {
        match value {
            Some(v) => self.set_leaf(tag, v),
            None => self.remove_leaf(tag),
        }
    }

    /// Hot path: if the slot already holds a leaf at this index reachable
    /// via a lock-free read, overwrite it in place via `Entry::update_value`
    /// with no mutex. A `Path` or `Raw` entry at that slot cannot be updated
    /// in place (`Raw` entries come from `update_content` and have no
    /// `Entry::update_value`-compatible body), so those fall through to the
    /// write-lock path below, which re-traverses (another writer may have
    /// changed the path underneath) and installs a fresh `Entry`.
    fn set_leaf<T>(&self, tag: &Tag<T>, value: T)
    where
        T: Clone + Send + Sync + 'static,
    {
        if let Some(node) = self.resolve_read(tag.path()) {
            if let Some(entry) = node.get(tag.index()) {
                if entry.is_leaf() {
                    entry.update_value(Box::new(value));
                    self.after_write(&node);
                    return;
                }
            }
        }

        let _guard = self.write_mutex.lock();
        let node = self
            .resolve_write(tag.path(), true)
            .expect("write traversal with create=true always resolves a node");
        let info = tag.erase(tag.erased_serializer());
        let entry = Arc::new(Entry::new_leaf(info, Box::new(value), clone_fn_for::<T>()));
        node.put(tag.index(), entry);
        self.after_write(&node);
    }

    fn remove_leaf<T>(&self, tag: &Tag<T>) {
        let _guard = self.write_mutex.lock();
        let Some(node) = self.resolve_write(tag.path(), false) else { return };
        node.remove(tag.index());
        self.after_write(&node);
    }

    /// Atomic read-modify-write under the store mutex. Callers must not
    /// re-enter the same store from `f`: the mutex is held across the
    /// call, so a re-entrant `set_tag`/`update_tag` on the same store would
    /// deadlock. Returns `(previous, updated)`.
    fn update_tag_impl<T, F>(&self, tag: &Tag<T>, f: F) -> (T, T)
    where
        T: Clone + Send + Sync + 'static,
        F: FnOnce(T) -> T,
    {
        let _guard = self.write_mutex.lock();
        let node = self
            .resolve_write(tag.path(), true)
            .expect("write traversal with create=true always resolves a node");
        let previous = node
            .get(tag.index())
            .and_then(|entry| entry.with_leaf_value::<T, _>(|v| v.cloned()))
            .unwrap_or_else(|| tag.default_value());
        let updated = f(previous.clone());
        let info = tag.erase(tag.erased_serializer());
        let entry = Arc::new(Entry::new_leaf(info, Box::new(updated.clone()), clone_fn_for::<T>()));
        node.put(tag.index(), entry);
        self.after_write(&node);
        (previous, updated)
    }

    /// Returns the value after applying `f`.
    pub fn update_tag<T, F>(&self, tag: &Tag<T>, f: F) -> T
    where
        T: Clone + Send + Sync + 'static,
        F: FnOnce(T) -> T,
    {
        self.update_tag_impl(tag, f).1
    }

    /// Returns the value before applying `f`.
    pub fn update_tag_previous<T, F>(&self, tag: &Tag<T>, f: F) -> T
    where
        T: Clone + Send + Sync + 'static,
        F: FnOnce(T) -> T,
    {
        self.update_tag_impl(tag, f).0
    }

    /// Returns `(previous, updated)`.
    pub fn update_tag_before_after<T, F>(&self, tag: &Tag<T>, f: F) -> (T, T)
    where
        T: Clone + Send + Sync + 'static,
        F: FnOnce(T) -> T,
    {
        self.update_tag_impl(tag, f)
    }

    /// Materializes the root's cached serialized compound, computing it if
    /// stale (or always, if `TagStoreConfig::cache_enabled` is off).
    pub fn as_compound(&self) -> Arc<Compound> {
        self.root.compound()
    }

    /// A snapshot cheap enough to hand to event handlers, cached until the
    /// next write invalidates it (distinct from the root's own compound
    /// cache so a reader can hold this past an intervening write without
    /// the store itself needing to keep two copies around on the hot path).
    pub fn readable_copy(&self) -> ReadOnlyView {
        let compound = self
            .readable_cache
            .materialize(|| Some(self.root.compound()))
            .unwrap_or_default();
        ReadOnlyView(compound)
    }

    /// Deep-clones every node of the tree; each subtree's cached compound is
    /// recomputed (or copied, where valid) along the way. Pruning of empty
    /// child compounds during the copy follows the same
    /// `serialize_empty_compound` flag as `as_compound`.
    pub fn copy(&self) -> TagStore {
        let _guard = self.write_mutex.lock();
        let root = self.root.deep_copy(None);
        TagStore {
            allocator: self.allocator.clone(),
            config: self.config.clone(),
            root,
            write_mutex: Mutex::new(()),
            readable_cache: SentinelCache::new(),
        }
    }

    /// Wholesale-replaces the store's contents from a serialized compound,
    /// reconstructing the tree via the store's own allocator. The root
    /// node's identity is preserved; only its map and cached compound are
    /// replaced.
    pub fn update_content(&self, compound: &Compound) {
        let _guard = self.write_mutex.lock();
        self.root.populate_from_compound(compound, self.allocator.as_ref());
        self.readable_cache.invalidate();
    }

    /// Drops every entry from the root, leaving an empty store.
    pub fn clear_tags(&self) {
        let _guard = self.write_mutex.lock();
        self.root
            .replace_entries(crate::concurrent::static_int_map::StaticIntMap::new(self.config.map_shape))
            .expect("tagstore: clear_tags always replaces with a matching map shape");
        self.root.invalidate();
        self.readable_cache.invalidate();
    }

    /// Enables or disables `TAG_HANDLER_CACHE_ENABLED` at runtime.
    pub fn set_cache_enabled(&self, enabled: bool) {
        self.config.cache_enabled.store(enabled, Ordering::Relaxed);
    }

    /// Enables or disables `SERIALIZE_EMPTY_COMPOUND` at runtime.
    pub fn set_serialize_empty_compound(&self, enabled: bool) {
        self.config.serialize_empty_compound.store(enabled, Ordering::Relaxed);
    }
}

/// Builds a `TagPath` one named segment at a time, allocating each
/// segment's index from the given allocator. A thin convenience over
/// repeated `TagPath::child(PathSegment::allocated(..))` calls.
pub struct PathBuilder<'a> {
    allocator: &'a dyn TagIndexAllocator,
    path: TagPath,
}

impl<'a> PathBuilder<'a> {
    pub fn new(allocator: &'a dyn TagIndexAllocator) -> Self {
        Self { allocator, path: TagPath::root() }
    }

    pub fn push(mut self, name: impl Into<Arc<str>>) -> Self {
        self.path = self.path.child(PathSegment::allocated(name, self.allocator));
        self
    }

    pub fn build(self) -> TagPath {
        self.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tagstore::tag::Serializer;
    use std::sync::atomic::AtomicBool;

    struct IntSerializer;
    impl Serializer<i32> for IntSerializer {
        fn write(&self, value: &i32) -> BinaryTag {
            BinaryTag::Int(*value)
        }
        fn read(&self, tag: &BinaryTag) -> Option<i32> {
            match tag {
                BinaryTag::Int(v) => Some(*v),
                _ => None,
            }
        }
        fn nbt_type(&self) -> NbtType {
            NbtType::Int
        }
    }

    fn int_tag(store: &TagStore, key: &str, path: TagPath) -> Tag<i32> {
        Tag::new(key, path, store.allocator().as_ref(), IntSerializer, || 0)
    }

    #[test]
    fn set_then_get_round_trips() {
        let store = TagStore::with_sequential_allocator();
        let tag = int_tag(&store, "k", TagPath::root());
        store.set_tag(&tag, Some(7));
        assert_eq!(store.get_tag(&tag), 7);
        assert_eq!(store.as_compound().get("k"), Some(&BinaryTag::Int(7)));
    }

    #[test]
    fn get_on_missing_tag_returns_default() {
        let store = TagStore::with_sequential_allocator();
        let tag = int_tag(&store, "k", TagPath::root());
        assert_eq!(store.get_tag(&tag), 0);
    }

    #[test]
    fn set_under_a_path_nests_the_compound() {
        let store = TagStore::with_sequential_allocator();
        let path = PathBuilder::new(store.allocator().as_ref()).push("p").build();
        let tag = int_tag(&store, "k", path);
        store.set_tag(&tag, Some(5));
        let compound = store.as_compound();
        match compound.get("p") {
            Some(BinaryTag::Compound(inner)) => assert_eq!(inner.get("k"), Some(&BinaryTag::Int(5))),
            other => panic!("expected nested compound, got {other:?}"),
        }
    }

    #[test]
    fn remove_drops_the_entry() {
        let store = TagStore::with_sequential_allocator();
        let tag = int_tag(&store, "k", TagPath::root());
        store.set_tag(&tag, Some(1));
        store.set_tag(&tag, None);
        assert_eq!(store.get_tag(&tag), 0);
        assert_eq!(store.as_compound().size(), 0);
    }

    #[test]
    fn update_tag_reports_before_and_after() {
        let store = TagStore::with_sequential_allocator();
        let tag = int_tag(&store, "k", TagPath::root());
        store.set_tag(&tag, Some(10));
        let (before, after) = store.update_tag_before_after(&tag, |v| v + 1);
        assert_eq!(before, 10);
        assert_eq!(after, 11);
        assert_eq!(store.get_tag(&tag), 11);
    }

    #[test]
    fn clear_tags_empties_the_store() {
        let store = TagStore::with_sequential_allocator();
        let tag = int_tag(&store, "k", TagPath::root());
        store.set_tag(&tag, Some(3));
        store.clear_tags();
        assert_eq!(store.get_tag(&tag), 0);
        assert_eq!(store.as_compound().size(), 0);
    }

    #[test]
    fn update_content_reconstructs_nested_tree() {
        let store = TagStore::with_sequential_allocator();
        let compound = Compound::builder()
            .put("k", BinaryTag::Int(9))
            .put("p", BinaryTag::Compound(Compound::builder().put("k", BinaryTag::Int(2)).build()))
            .build();
        store.update_content(&compound);
        assert_eq!(*store.as_compound(), compound);
    }

    #[test]
    fn set_tag_over_a_raw_entry_from_update_content_does_not_panic() {
        let store = TagStore::with_sequential_allocator();
        let compound = Compound::builder().put("k", BinaryTag::Int(9)).build();
        store.update_content(&compound);
        let tag = int_tag(&store, "k", TagPath::root());
        store.set_tag(&tag, Some(11));
        assert_eq!(store.get_tag(&tag), 11);
        assert_eq!(store.as_compound().get("k"), Some(&BinaryTag::Int(11)));
    }

    #[test]
    fn copy_is_independent_of_the_original() {
        let store = TagStore::with_sequential_allocator();
        let tag = int_tag(&store, "k", TagPath::root());
        store.set_tag(&tag, Some(1));
        let copy = store.copy();
        store.set_tag(&tag, Some(2));
        assert_eq!(store.get_tag(&tag), 2);
        assert_eq!(copy.get_tag(&tag), 1);
    }

    #[test]
    fn readable_copy_is_cached_until_next_write() {
        let store = TagStore::with_sequential_allocator();
        let tag = int_tag(&store, "k", TagPath::root());
        store.set_tag(&tag, Some(1));
        let first = store.readable_copy();
        let second = store.readable_copy();
        assert_eq!(first.compound(), second.compound());
        store.set_tag(&tag, Some(2));
        let third = store.readable_copy();
        assert_eq!(third.compound().get("k"), Some(&BinaryTag::Int(2)));
    }

    #[test]
    fn concurrent_writers_on_the_same_path_converge_to_one_final_value() {
        use std::sync::Arc as StdArc;
        use std::thread;

        let store = StdArc::new(TagStore::with_sequential_allocator());
        let path = PathBuilder::new(store.allocator().as_ref()).push("p").build();
        let tag1 = int_tag(&store, "k", path.clone());
        let tag2 = int_tag(&store, "k", path);

        let s1 = store.clone();
        let t1 = tag1.clone();
        let h1 = thread::spawn(move || s1.set_tag(&t1, Some(1)));
        let s2 = store.clone();
        let t2 = tag2.clone();
        let h2 = thread::spawn(move || s2.set_tag(&t2, Some(2)));
        h1.join().unwrap();
        h2.join().unwrap();

        let value = store.get_tag(&tag1);
        assert!(value == 1 || value == 2);
        let compound = store.as_compound();
        match compound.get("p") {
            Some(BinaryTag::Compound(inner)) => {
                assert!(matches!(inner.get("k"), Some(BinaryTag::Int(1)) | Some(BinaryTag::Int(2))));
            }
            other => panic!("expected nested compound, got {other:?}"),
        }
    }

    #[test]
    fn cache_disabled_recomputes_every_call() {
        let store = TagStore::new(
            Arc::new(SequentialAllocator::new()),
            TagStoreConfig { cache_enabled: AtomicBool::new(false), ..TagStoreConfig::default() },
        );
        let tag = int_tag(&store, "k", TagPath::root());
        store.set_tag(&tag, Some(1));
        assert_eq!(store.as_compound().get("k"), Some(&BinaryTag::Int(1)));
        store.set_tag(&tag, Some(2));
        assert_eq!(store.as_compound().get("k"), Some(&BinaryTag::Int(2)));
    }
}
