// Copyright (c) 2025 RustyDB Contributors
//
// One node of the tag tree: a `StaticIntMap<Arc<Entry>>` plus a lazily
// computed, incrementally invalidated `Compound` for the subtree rooted
// here. The parent link is a `Weak` back-edge used only by `invalidate`:
// child ownership flows down through `Entry::Path`, never up, so a node
// never keeps its parent alive.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use crate::concurrent::static_int_map::{MapShape, StaticIntMap};
use crate::tagstore::compound::{BinaryTag, Compound};
use crate::tagstore::entry::{Entry, ErasedTagInfo};
use crate::tagstore::sentinel_cache::SentinelCache;
use crate::tagstore::tag::TagIndexAllocator;

/// Runtime flags shared by every node of one `TagStore`, per spec.md §6.
pub struct TagStoreConfig {
    /// `TAG_HANDLER_CACHE_ENABLED`. When false, `Node::compound` recomputes
    /// on every call instead of consulting its `SentinelCache`.
    pub cache_enabled: AtomicBool,
    /// `SERIALIZE_EMPTY_COMPOUND`. When false, a path entry whose subtree
    /// serializes to an empty compound is pruned from its parent's output.
    pub serialize_empty_compound: AtomicBool,
    /// Map shape new nodes are constructed with. `Array` only pays off when
    /// the allocator hands out small, dense indices; `Hash` is the safe
    /// default for an externally supplied allocator.
    pub map_shape: MapShape,
}

impl Default for TagStoreConfig {
    fn default() -> Self {
        Self {
            cache_enabled: AtomicBool::new(true),
            serialize_empty_compound: AtomicBool::new(false),
            map_shape: MapShape::Hash,
        }
    }
}

impl TagStoreConfig {
    /// No field combination is currently invalid; this exists for symmetry
    /// with the rest of the crate's `Config`-style types and to leave room
    /// for validated fields later.
    pub fn validate(&self) -> crate::error::Result<()> {
        Ok(())
    }
}

pub(crate) struct Node {
    entries: StaticIntMap<Arc<Entry>>,
    compound_cache: SentinelCache<Arc<Compound>>,
    parent: Option<Weak<Node>>,
    config: Arc<TagStoreConfig>,
}

impl Node {
    pub(crate) fn new_root(config: Arc<TagStoreConfig>) -> Arc<Node> {
        Arc::new(Node {
            entries: StaticIntMap::new(config.map_shape),
            compound_cache: SentinelCache::new(),
            parent: None,
            config,
        })
    }

    pub(crate) fn new_child(parent: &Arc<Node>) -> Arc<Node> {
        Arc::new(Node {
            entries: StaticIntMap::new(parent.config.map_shape),
            compound_cache: SentinelCache::new(),
            parent: Some(Arc::downgrade(parent)),
            config: parent.config.clone(),
        })
    }

    /// Rebuilds this node's contents in place from a serialized compound:
    /// every nested compound becomes a child path node (recursively
    /// populated the same way), every scalar becomes a `Raw` leaf keyed by
    /// `allocator.index_for(name, shape)`. Used by `TagStore::update_content`
    /// and by write-traversal when a displaced leaf carried a compound that
    /// must seed the newly allocated child in its place. The node's own
    /// identity (and its parent back-edge) is preserved; only its map and
    /// cached compound are replaced.
    pub(crate) fn populate_from_compound(
        self: &Arc<Node>,
        compound: &Compound,
        allocator: &dyn TagIndexAllocator,
    ) {
        use crate::tagstore::tag::NbtType;

        let fresh = StaticIntMap::new(self.config.map_shape);
        for (key, tag) in compound.iter() {
            match tag {
                BinaryTag::Compound(child_compound) => {
                    let index = allocator.index_for(key, NbtType::Compound);
                    let child = Node::new_child(self);
                    child.populate_from_compound(child_compound, allocator);
                    let info = ErasedTagInfo::for_path(key.clone(), index, NbtType::Compound);
                    fresh.put(index, Arc::new(Entry::new_path(info, child)));
                }
                other => {
                    let shape = other.nbt_type_hint();
                    let index = allocator.index_for(key, shape);
                    let info = ErasedTagInfo::for_path(key.clone(), index, shape);
                    fresh.put(index, Arc::new(Entry::new_raw(info, Arc::new(other.clone()))));
                }
            }
        }
        self.entries
            .update_content(fresh)
            .expect("tagstore node: map shape mismatch during update_content");
        self.compound_cache.publish(Arc::new(compound.clone()));
    }

    pub(crate) fn get(&self, index: i32) -> Option<Arc<Entry>> {
        self.entries.get(index)
    }

    pub(crate) fn put(&self, index: i32, entry: Arc<Entry>) {
        self.entries.put(index, entry);
    }

    pub(crate) fn remove(&self, index: i32) {
        self.entries.remove(index);
    }

    /// Wholesale-replaces this node's map, per `StaticIntMap::update_content`.
    pub(crate) fn replace_entries(&self, other: StaticIntMap<Arc<Entry>>) -> crate::error::Result<()> {
        self.entries.update_content(other)
    }

    pub(crate) fn config(&self) -> &Arc<TagStoreConfig> {
        &self.config
    }

    /// Non-blocking: marks this node's cached compound stale, then walks up
    /// the parent chain doing the same, per spec.md §4.3's "invalidate walks
    /// from the node up to the root".
    pub(crate) fn invalidate(&self) {
        self.compound_cache.invalidate();
        if let Some(parent) = self.parent.as_ref().and_then(Weak::upgrade) {
            parent.invalidate();
        }
    }

    /// The subtree's materialized compound, computed (and cached unless
    /// `cache_enabled` is false) by asking every live entry for its
    /// `updated_nbt()`.
    pub(crate) fn compound(&self) -> Arc<Compound> {
        if !self.config.cache_enabled.load(Ordering::Relaxed) {
            return Arc::new(self.compute_compound());
        }
        self.compound_cache
            .materialize(|| Some(Arc::new(self.compute_compound())))
            .unwrap_or_default()
    }

    fn compute_compound(&self) -> Compound {
        let prune_empty = !self.config.serialize_empty_compound.load(Ordering::Relaxed);
        let mut pairs = Vec::new();
        self.entries.for_values(|entry| {
            let Some(nbt) = entry.updated_nbt() else { return };
            if prune_empty && entry.is_path() {
                if let BinaryTag::Compound(c) = nbt.as_ref() {
                    if c.is_empty() {
                        return;
                    }
                }
            }
            pairs.push((entry.tag_info.key.clone(), (*nbt).clone()));
        });
        pairs.into_iter().fold(Compound::builder(), |b, (k, v)| b.put(k, v)).build()
    }

    /// Deep-clones this node: every child path node is recursively copied,
    /// each producing its own cached compound along the way. An empty child
    /// compound is pruned from the copy's map when `serialize_empty_compound`
    /// is off, matching `compute_compound`'s pruning of the same case.
    pub(crate) fn deep_copy(self: &Arc<Self>, parent: Option<&Arc<Node>>) -> Arc<Node> {
        let copy = match parent {
            Some(parent) => Node::new_child(parent),
            None => Node::new_root(self.config.clone()),
        };
        let prune_empty = !self.config.serialize_empty_compound.load(Ordering::Relaxed);
        self.entries.for_values(|entry| {
            if let Some(child) = entry.child() {
                let child_copy = child.deep_copy(Some(&copy));
                if prune_empty && child_copy.compound().is_empty() {
                    return;
                }
                copy.entries.put(entry.tag_info.index, Arc::new(Entry::new_path(entry.tag_info.clone(), child_copy)));
            } else {
                copy.entries.put(entry.tag_info.index, Arc::new(entry.clone_detached()));
            }
        });
        copy.compound_cache.publish(self.compound());
        copy
    }
}
