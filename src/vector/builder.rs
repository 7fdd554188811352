//! Offline construction of the random-projection forest.
//!
//! Each tree recursively splits the item set with a hyperplane through the
//! origin. The plane normal is the difference of two randomly chosen unit
//! vectors, which separates the pair and tends to follow the local structure
//! of the data. Items with a positive margin go right, the rest go left.
//! Recursion stops at `leaf_size` items.
//!
//! # Determinism
//! All randomness comes from a `StdRng` seeded with [`ForestParams::seed`], so
//! the same vectors and parameters always produce the same file.

use std::path::Path;

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use tracing::{debug, info};

use crate::vector::distance::{dot, normalize_vector, normalize_vector_copy};
use crate::vector::storage::write_index;
use crate::vector::types::{ItemId, Metric, VectorDimension, VectorError};

/// Attempts at drawing a separating plane before falling back to a random
/// balanced partition.
const MAX_SPLIT_ATTEMPTS: usize = 8;

/// Default number of trees in the forest.
pub const DEFAULT_TREE_COUNT: usize = 10;

/// Default maximum number of items per leaf.
pub const DEFAULT_LEAF_SIZE: usize = 32;

/// Default build seed.
pub const DEFAULT_SEED: u64 = 42;

/// Tunables for forest construction.
///
/// More trees improve recall at the cost of file size and query time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ForestParams {
    pub n_trees: usize,
    pub leaf_size: usize,
    pub seed: u64,
}

impl Default for ForestParams {
    fn default() -> Self {
        Self {
            n_trees: DEFAULT_TREE_COUNT,
            leaf_size: DEFAULT_LEAF_SIZE,
            seed: DEFAULT_SEED,
        }
    }
}

impl ForestParams {
    fn validate(&self) -> Result<(), VectorError> {
        if self.n_trees == 0 {
            return Err(VectorError::InvalidParameter {
                name: "n_trees",
                reason: "a forest needs at least one tree",
            });
        }
        if self.leaf_size == 0 {
            return Err(VectorError::InvalidParameter {
                name: "leaf_size",
                reason: "leaves must hold at least one item",
            });
        }
        Ok(())
    }
}

/// A node of a projection tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Node {
    /// Range `start..start + len` of the shared leaf item list.
    Leaf { start: u32, len: u32 },
    /// Inner node; `plane` indexes the plane normals.
    Split { left: u32, right: u32, plane: u32 },
}

/// A forest held in memory, ready to be written to disk.
#[derive(Debug, Clone)]
pub struct BuiltForest {
    pub(crate) dimension: VectorDimension,
    pub(crate) metric: Metric,
    pub(crate) params: ForestParams,
    /// Unit vectors, item `i` at `i * dimension`.
    pub(crate) vectors: Vec<f32>,
    pub(crate) roots: Vec<u32>,
    pub(crate) nodes: Vec<Node>,
    pub(crate) planes: Vec<f32>,
    pub(crate) leaf_items: Vec<u32>,
}

impl BuiltForest {
    #[must_use]
    pub fn item_count(&self) -> usize {
        self.vectors.len() / self.dimension.get()
    }

    #[must_use]
    pub fn tree_count(&self) -> usize {
        self.roots.len()
    }

    #[must_use]
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Writes the forest to `path` in the memory-mappable index format.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), VectorError> {
        write_index(path.as_ref(), self)?;
        Ok(())
    }
}

/// Builds an angular ANN index from a complete set of embeddings.
#[derive(Debug, Clone)]
pub struct IndexBuilder {
    dimension: VectorDimension,
    metric: Metric,
    params: ForestParams,
}

impl IndexBuilder {
    #[must_use]
    pub fn new(dimension: VectorDimension) -> Self {
        Self {
            dimension,
            metric: Metric::Angular,
            params: ForestParams::default(),
        }
    }

    #[must_use]
    pub fn with_params(mut self, params: ForestParams) -> Self {
        self.params = params;
        self
    }

    /// Builds the forest in memory.
    ///
    /// Item ids must cover `0..n` exactly once, in any order. Every vector must
    /// have the builder's dimension, finite components and a non-zero norm.
    pub fn build(&self, items: &[(ItemId, Vec<f32>)]) -> Result<BuiltForest, VectorError> {
        self.params.validate()?;
        if items.is_empty() {
            return Err(VectorError::EmptyVectorSet);
        }
        if u32::try_from(items.len()).is_err() {
            return Err(VectorError::TooManyItems(items.len()));
        }

        let vectors = self.normalized_slots(items)?;
        let dim = self.dimension.get();
        let count = items.len();

        let mut rng = StdRng::seed_from_u64(self.params.seed);
        let mut trees = TreeBuilder {
            vectors: &vectors,
            dim,
            leaf_size: self.params.leaf_size,
            nodes: Vec::new(),
            planes: Vec::new(),
            leaf_items: Vec::with_capacity(count * self.params.n_trees),
        };

        let mut roots = Vec::with_capacity(self.params.n_trees);
        for tree in 0..self.params.n_trees {
            let all: Vec<u32> = (0..count as u32).collect();
            let root = trees.build_tree(all, &mut rng);
            debug!("Built tree {tree} rooted at node {root}");
            roots.push(root);
        }

        let TreeBuilder {
            nodes,
            planes,
            leaf_items,
            ..
        } = trees;

        info!(
            "Built forest: {count} items, {} trees, {} nodes",
            roots.len(),
            nodes.len()
        );

        Ok(BuiltForest {
            dimension: self.dimension,
            metric: self.metric,
            params: self.params,
            vectors,
            roots,
            nodes,
            planes,
            leaf_items,
        })
    }

    /// Builds the forest and writes it to `path`.
    pub fn build_to_file(
        &self,
        items: &[(ItemId, Vec<f32>)],
        path: impl AsRef<Path>,
    ) -> Result<BuiltForest, VectorError> {
        let forest = self.build(items)?;
        forest.save(path)?;
        Ok(forest)
    }

    /// Validates the input and lays the unit vectors out by item id.
    fn normalized_slots(&self, items: &[(ItemId, Vec<f32>)]) -> Result<Vec<f32>, VectorError> {
        let dim = self.dimension.get();
        let count = items.len();
        let mut filled = vec![false; count];
        let mut vectors = vec![0.0f32; count * dim];

        for (id, vector) in items {
            self.dimension.validate_vector(vector)?;

            let slot = id.as_index();
            if slot >= count || filled[slot] {
                return Err(VectorError::InvalidItemIds {
                    count,
                    found: id.get(),
                });
            }
            if vector.iter().any(|v| !v.is_finite()) {
                return Err(VectorError::InvalidVector {
                    id: id.get(),
                    reason: "contains NaN or infinite values",
                });
            }
            let unit = normalize_vector_copy(vector).ok_or(VectorError::InvalidVector {
                id: id.get(),
                reason: "zero-length vectors have no direction",
            })?;

            vectors[slot * dim..(slot + 1) * dim].copy_from_slice(&unit);
            filled[slot] = true;
        }

        Ok(vectors)
    }
}

/// Where a freshly built node gets attached.
enum Parent {
    Root,
    Left(usize),
    Right(usize),
}

struct TreeBuilder<'a> {
    vectors: &'a [f32],
    dim: usize,
    leaf_size: usize,
    nodes: Vec<Node>,
    planes: Vec<f32>,
    leaf_items: Vec<u32>,
}

impl TreeBuilder<'_> {
    fn vector(&self, id: u32) -> &[f32] {
        let start = id as usize * self.dim;
        &self.vectors[start..start + self.dim]
    }

    /// Builds one tree without recursion; unbalanced splits can get deep.
    fn build_tree(&mut self, items: Vec<u32>, rng: &mut StdRng) -> u32 {
        let mut root = 0u32;
        let mut pending = vec![(items, Parent::Root)];

        while let Some((items, parent)) = pending.pop() {
            let index = self.nodes.len();

            if items.len() <= self.leaf_size {
                let start = self.leaf_items.len() as u32;
                self.leaf_items.extend_from_slice(&items);
                self.nodes.push(Node::Leaf {
                    start,
                    len: items.len() as u32,
                });
            } else {
                let (normal, left, right) = self.choose_split(items, rng);
                let plane = (self.planes.len() / self.dim) as u32;
                self.planes.extend_from_slice(&normal);
                self.nodes.push(Node::Split {
                    left: 0,
                    right: 0,
                    plane,
                });
                pending.push((right, Parent::Right(index)));
                pending.push((left, Parent::Left(index)));
            }

            let index = index as u32;
            match parent {
                Parent::Root => root = index,
                Parent::Left(p) => {
                    if let Node::Split { left, .. } = &mut self.nodes[p] {
                        *left = index;
                    }
                }
                Parent::Right(p) => {
                    if let Node::Split { right, .. } = &mut self.nodes[p] {
                        *right = index;
                    }
                }
            }
        }

        root
    }

    /// Picks a plane normal and partitions `items` by the sign of the margin.
    ///
    /// Falls back to a zero normal (both children equally likely at query time)
    /// with a random balanced partition when no separating plane is found,
    /// e.g. for duplicated vectors.
    fn choose_split(&self, items: Vec<u32>, rng: &mut StdRng) -> (Vec<f32>, Vec<u32>, Vec<u32>) {
        for _ in 0..MAX_SPLIT_ATTEMPTS {
            let a = items[rng.random_range(0..items.len())];
            let b = items[rng.random_range(0..items.len())];
            if a == b {
                continue;
            }

            let mut normal: Vec<f32> = self
                .vector(a)
                .iter()
                .zip(self.vector(b))
                .map(|(x, y)| x - y)
                .collect();
            if !normalize_vector(&mut normal) {
                continue;
            }

            let (right, left): (Vec<u32>, Vec<u32>) = items
                .iter()
                .copied()
                .partition(|&id| dot(&normal, self.vector(id)) > 0.0);
            if !left.is_empty() && !right.is_empty() {
                return (normal, left, right);
            }
        }

        let mut left = items;
        left.shuffle(rng);
        let right = left.split_off(left.len() / 2);
        (vec![0.0; self.dim], left, right)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(n_trees: usize, leaf_size: usize) -> ForestParams {
        ForestParams {
            n_trees,
            leaf_size,
            seed: 7,
        }
    }

    fn ring(n: usize, dim: usize) -> Vec<(ItemId, Vec<f32>)> {
        (0..n)
            .map(|i| {
                let angle = i as f32 * std::f32::consts::TAU / n as f32;
                let mut v = vec![0.0; dim];
                v[0] = angle.cos();
                v[1] = angle.sin();
                v[2] = 0.1 * (i % 3) as f32;
                (ItemId::new(i as u32), v)
            })
            .collect()
    }

    #[test]
    fn test_every_tree_covers_every_item() {
        let items = ring(100, 4);
        let forest = IndexBuilder::new(VectorDimension::new(4).unwrap())
            .with_params(params(3, 5))
            .build(&items)
            .unwrap();

        assert_eq!(forest.item_count(), 100);
        assert_eq!(forest.tree_count(), 3);
        assert_eq!(forest.leaf_items.len(), 300);

        for tree in 0..3 {
            let mut seen: Vec<u32> = forest.leaf_items[tree * 100..(tree + 1) * 100].to_vec();
            seen.sort_unstable();
            assert_eq!(seen, (0..100).collect::<Vec<u32>>());
        }
    }

    #[test]
    fn test_leaves_respect_leaf_size() {
        let forest = IndexBuilder::new(VectorDimension::new(4).unwrap())
            .with_params(params(2, 4))
            .build(&ring(50, 4))
            .unwrap();

        for node in &forest.nodes {
            if let Node::Leaf { len, .. } = node {
                assert!(*len >= 1 && *len <= 4);
            }
        }
    }

    #[test]
    fn test_build_is_deterministic() {
        let builder =
            IndexBuilder::new(VectorDimension::new(4).unwrap()).with_params(params(4, 3));
        let a = builder.build(&ring(40, 4)).unwrap();
        let b = builder.build(&ring(40, 4)).unwrap();

        assert_eq!(a.nodes, b.nodes);
        assert_eq!(a.leaf_items, b.leaf_items);
        assert_eq!(a.planes, b.planes);
    }

    #[test]
    fn test_vectors_are_stored_normalized_by_id() {
        let items = vec![
            (ItemId::new(1), vec![0.0, 5.0]),
            (ItemId::new(0), vec![2.0, 0.0]),
        ];
        let forest = IndexBuilder::new(VectorDimension::new(2).unwrap())
            .build(&items)
            .unwrap();

        assert_eq!(forest.vectors, vec![1.0, 0.0, 0.0, 1.0]);
    }

    #[test]
    fn test_duplicate_vectors_still_split() {
        let items: Vec<_> = (0..20).map(|i| (ItemId::new(i), vec![1.0, 1.0])).collect();
        let forest = IndexBuilder::new(VectorDimension::new(2).unwrap())
            .with_params(params(1, 2))
            .build(&items)
            .unwrap();

        assert_eq!(forest.leaf_items.len(), 20);
    }

    #[test]
    fn test_build_rejects_bad_input() {
        let builder = IndexBuilder::new(VectorDimension::new(2).unwrap());

        assert!(matches!(
            builder.build(&[]),
            Err(VectorError::EmptyVectorSet)
        ));

        // Gap in the id space
        let gap = vec![(ItemId::new(0), vec![1.0, 0.0]), (ItemId::new(2), vec![0.0, 1.0])];
        assert!(matches!(
            builder.build(&gap),
            Err(VectorError::InvalidItemIds { found: 2, .. })
        ));

        // Duplicate id
        let dup = vec![(ItemId::new(0), vec![1.0, 0.0]), (ItemId::new(0), vec![0.0, 1.0])];
        assert!(matches!(
            builder.build(&dup),
            Err(VectorError::InvalidItemIds { found: 0, .. })
        ));

        let zero = vec![(ItemId::new(0), vec![0.0, 0.0])];
        assert!(matches!(
            builder.build(&zero),
            Err(VectorError::InvalidVector { id: 0, .. })
        ));

        let wrong_dim = vec![(ItemId::new(0), vec![1.0, 0.0, 0.0])];
        assert!(matches!(
            builder.build(&wrong_dim),
            Err(VectorError::DimensionMismatch { .. })
        ));

        let no_trees = builder.clone().with_params(params(0, 4));
        assert!(matches!(
            no_trees.build(&[(ItemId::new(0), vec![1.0, 0.0])]),
            Err(VectorError::InvalidParameter { name: "n_trees", .. })
        ));
    }
}
