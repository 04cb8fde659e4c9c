// Copyright (c) 2025 RustyDB Contributors
//
// Type-erased map values. A node's `StaticIntMap<Arc<Entry>>` holds tags of
// unrelated `T`s side by side, so every value crossing that boundary is
// erased to `Box<dyn Any + Send + Sync>` and downcast back out at the point
// a caller's typed `Tag<T>` is available again. Grounded in the `dyn Any`
// service registry pattern used elsewhere in this codebase for heterogeneous
// component storage.

use std::any::Any;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use crate::concurrent::epoch::{Atomic, Epoch, Owned};
use crate::tagstore::compound::BinaryTag;
use crate::tagstore::node::Node;
use crate::tagstore::sentinel_cache::SentinelCache;
use crate::tagstore::tag::{ErasedSerializer, NbtType, Tag, TagPath};

/// The type-erased identity of a `Tag<T>`, carried on every map entry so a
/// node can describe its contents (for `compound()`) without knowing any
/// caller type.
#[derive(Clone)]
pub(crate) struct ErasedTagInfo {
    pub(crate) key: Arc<str>,
    pub(crate) index: i32,
    pub(crate) path: TagPath,
    pub(crate) is_view: bool,
    pub(crate) nbt_type: NbtType,
    pub(crate) serializer: Option<Arc<dyn ErasedSerializer>>,
}

impl ErasedTagInfo {
    /// Used for path (intermediate) entries and `Raw` entries reconstructed
    /// from `update_content`, neither of which has a caller-supplied
    /// serializer.
    pub(crate) fn for_path(name: impl Into<Arc<str>>, index: i32, nbt_type: NbtType) -> Self {
        Self {
            key: name.into(),
            index,
            path: TagPath::root(),
            is_view: false,
            nbt_type,
            serializer: None,
        }
    }
}

impl<T: Send + Sync + 'static> Tag<T> {
    pub(crate) fn erase(&self, serializer: Arc<dyn ErasedSerializer>) -> ErasedTagInfo {
        ErasedTagInfo {
            key: self.key().into(),
            index: self.index(),
            path: self.path().clone(),
            is_view: self.is_view(),
            nbt_type: serializer.nbt_type(),
            serializer: Some(serializer),
        }
    }
}

/// Type-erased deep-copy function for a leaf's value, the runtime stand-in
/// for spec.md's per-tag `copyValue`. Rust's `Clone` already gives owned
/// values deep-copy semantics, so rather than threading a separate
/// caller-supplied `copyValue` closure through every call site, each leaf
/// captures `T::clone` once at construction (see `Entry::new_leaf`) and
/// erases it alongside the value.
pub(crate) type CloneFn = Arc<dyn Fn(&dyn Any) -> Box<dyn Any + Send + Sync> + Send + Sync>;

pub(crate) fn clone_fn_for<T: Clone + Send + Sync + 'static>() -> CloneFn {
    Arc::new(|value: &dyn Any| {
        let typed = value
            .downcast_ref::<T>()
            .expect("clone_fn invoked against a leaf holding a different concrete type");
        Box::new(typed.clone()) as Box<dyn Any + Send + Sync>
    })
}

/// What a map slot actually holds.
pub(crate) enum EntryBody {
    /// A typed value plus its memoized binary-tag rendering.
    Leaf {
        value: Atomic<Box<dyn Any + Send + Sync>>,
        nbt: SentinelCache<Arc<BinaryTag>>,
        clone_fn: CloneFn,
    },
    /// A child node (the tree continues below this slot).
    Path(Arc<Node>),
    /// A value reconstructed from `update_content` with no caller `Tag<T>`
    /// on hand to decode it into, kept as the wire tag itself. Discovering a
    /// concrete type for these is an external collaborator's job.
    Raw(Arc<BinaryTag>),
}

pub(crate) struct Entry {
    pub(crate) tag_info: ErasedTagInfo,
    pub(crate) body: EntryBody,
}

impl Entry {
    pub(crate) fn new_leaf(tag_info: ErasedTagInfo, value: Box<dyn Any + Send + Sync>, clone_fn: CloneFn) -> Self {
        Self {
            tag_info,
            body: EntryBody::Leaf {
                value: Atomic::new(value),
                nbt: SentinelCache::new(),
                clone_fn,
            },
        }
    }

    pub(crate) fn new_path(tag_info: ErasedTagInfo, child: Arc<Node>) -> Self {
        Self { tag_info, body: EntryBody::Path(child) }
    }

    pub(crate) fn new_raw(tag_info: ErasedTagInfo, tag: Arc<BinaryTag>) -> Self {
        Self { tag_info, body: EntryBody::Raw(tag) }
    }

    /// Deep-clones this entry's current value into a fresh, detached `Entry`
    /// with its own memoized-nbt cache. Panics on a path entry: child
    /// subtrees are copied by `Node::deep_copy`, which needs to re-parent
    /// the clone, not merely duplicate an `Arc<Node>` handle.
    pub(crate) fn clone_detached(&self) -> Entry {
        match &self.body {
            EntryBody::Leaf { value, clone_fn, .. } => {
                let guard = Epoch::pin();
                let shared = value.load(Ordering::Acquire, &guard);
                let cloned = shared
                    .as_ref()
                    .map(|v| clone_fn(v.as_ref()))
                    .expect("tagstore entry: leaf value slot is never null");
                Entry::new_leaf(self.tag_info.clone(), cloned, clone_fn.clone())
            }
            EntryBody::Path(_) => panic!("tagstore entry: clone_detached called on a path entry"),
            EntryBody::Raw(tag) => Entry::new_raw(self.tag_info.clone(), tag.clone()),
        }
    }

    pub(crate) fn is_path(&self) -> bool {
        matches!(self.body, EntryBody::Path(_))
    }

    pub(crate) fn is_leaf(&self) -> bool {
        matches!(self.body, EntryBody::Leaf { .. })
    }

    pub(crate) fn child(&self) -> Option<&Arc<Node>> {
        match &self.body {
            EntryBody::Path(node) => Some(node),
            _ => None,
        }
    }

    /// Overwrite a leaf's value and invalidate its memoized tag. Panics if
    /// called on a non-leaf entry: callers are expected to check `is_path`
    /// first, since path entries are replaced wholesale, not updated.
    pub(crate) fn update_value(&self, value: Box<dyn Any + Send + Sync>) {
        match &self.body {
            EntryBody::Leaf { value: slot, nbt, .. } => {
                let guard = Epoch::pin();
                let owned = Owned::new(value).into_shared();
                let old = slot.swap(owned, Ordering::Release, &guard);
                if !old.is_null() {
                    Epoch::defer(old.as_ptr());
                }
                nbt.invalidate();
            }
            _ => panic!("tagstore entry: update_value called on a non-leaf entry"),
        }
    }

    /// Read the current typed value under an epoch guard. Returns `None` if
    /// `T` doesn't match the stored type (a caller bug: the same index was
    /// reused by two different `Tag<T>` shapes) or if this is not a leaf.
    pub(crate) fn with_leaf_value<T: 'static, R>(&self, f: impl FnOnce(Option<&T>) -> R) -> R {
        match &self.body {
            EntryBody::Leaf { value, .. } => {
                let guard = Epoch::pin();
                let shared = value.load(Ordering::Acquire, &guard);
                let typed = shared.as_ref().and_then(|boxed| boxed.downcast_ref::<T>());
                f(typed)
            }
            _ => f(None),
        }
    }

    /// The binary-tag rendering of this entry, computing and caching it for
    /// leaves, recursing into `Node::compound` for path entries.
    pub(crate) fn updated_nbt(&self) -> Option<Arc<BinaryTag>> {
        match &self.body {
            EntryBody::Leaf { value, nbt, .. } => {
                let serializer = self.tag_info.serializer.clone()?;
                nbt.materialize(|| {
                    let guard = Epoch::pin();
                    let shared = value.load(Ordering::Acquire, &guard);
                    shared.as_ref().map(|boxed| Arc::new(serializer.write_erased(boxed.as_ref())))
                })
            }
            EntryBody::Path(node) => Some(Arc::new(BinaryTag::Compound((*node.compound()).clone()))),
            EntryBody::Raw(tag) => Some(tag.clone()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tagstore::tag::NbtType;

    #[test]
    fn leaf_update_then_read_round_trips() {
        let info = ErasedTagInfo::for_path("hp", 1, NbtType::Int);
        let entry = Entry::new_leaf(info, Box::new(10i32), clone_fn_for::<i32>());
        entry.with_leaf_value::<i32, _>(|v| assert_eq!(v, Some(&10)));
        entry.update_value(Box::new(20i32));
        entry.with_leaf_value::<i32, _>(|v| assert_eq!(v, Some(&20)));
    }

    #[test]
    fn mismatched_downcast_returns_none() {
        let info = ErasedTagInfo::for_path("hp", 1, NbtType::Int);
        let entry = Entry::new_leaf(info, Box::new(10i32), clone_fn_for::<i32>());
        entry.with_leaf_value::<&'static str, _>(|v| assert_eq!(v, None));
    }

    #[test]
    fn clone_detached_leaf_is_independent_of_the_original() {
        let info = ErasedTagInfo::for_path("hp", 1, NbtType::Int);
        let entry = Entry::new_leaf(info, Box::new(10i32), clone_fn_for::<i32>());
        let copy = entry.clone_detached();
        entry.update_value(Box::new(99i32));
        copy.with_leaf_value::<i32, _>(|v| assert_eq!(v, Some(&10)));
        entry.with_leaf_value::<i32, _>(|v| assert_eq!(v, Some(&99)));
    }
}
