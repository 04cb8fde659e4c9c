// Copyright (c) 2025 RustyDB Contributors
//
// `tagstore`: a hierarchical, index-addressed attribute store with
// lock-free reads, the single-writer/multi-reader concurrent int map that
// underlies every node, and a memoizing cached-value cell built around a
// bit-packed signal word.
//
// See `concurrent` for the two map/cache primitives and `tagstore` for the
// tree that's built on top of them.

pub mod concurrent;
pub mod error;
pub mod tagstore;

pub use concurrent::{CachedValue, MapShape, StaticIntMap};
pub use error::{Result, TagStoreError};
pub use tagstore::compound::{BinaryTag, Compound, CompoundBuilder};
pub use tagstore::tag::{NbtType, PathSegment, SequentialAllocator, Serializer, Tag, TagIndexAllocator, TagPath};
pub use tagstore::{PathBuilder, ReadOnlyView, TagStore, TagStoreConfig};
