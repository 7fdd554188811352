//! Approximate nearest-neighbour index over embedding vectors.
//!
//! Indexes are built once offline by [`IndexBuilder`] and then opened as
//! immutable, memory-mapped [`AnnIndex`] values.
//!
//! # Performance Targets
//! - Open: O(1) I/O, a single `mmap`
//! - Query: sub-linear in the item count, one dot product per visited split
//!   node and candidate
//!
//! # Architecture
//! A random-projection forest for the angular metric. Each tree partitions
//! the items with hyperplanes through the origin; queries run one best-first
//! search across all trees and re-rank the collected candidates exactly.

mod builder;
mod distance;
mod engine;
mod storage;
mod types;

// Re-export core types for public API
pub use builder::{
    BuiltForest, DEFAULT_LEAF_SIZE, DEFAULT_SEED, DEFAULT_TREE_COUNT, ForestParams, IndexBuilder,
    Node,
};
pub use distance::{angular_distance, cosine_similarity, normalize_vector, normalize_vector_copy};
pub use engine::AnnIndex;
pub use storage::{IndexFile, IndexHeader, STORAGE_VERSION, write_index};
pub use types::{
    DEFAULT_EMBEDDING_DIMENSION, ItemId, Metric, Neighbor, VectorDimension, VectorError,
};
