//! Query side of the ANN index.
//!
//! [`AnnIndex`] wraps a validated [`IndexFile`] and answers k-nearest-neighbour
//! queries with a best-first search shared across all trees.
//!
//! # Algorithm
//! 1. Push every tree root with priority `+inf`
//! 2. Pop the most promising node; at a split push both children, each with
//!    the smaller of its parent priority and its signed margin
//! 3. At a leaf, collect item ids as candidates
//! 4. Stop once `search_k` leaf items were visited and at least `k` distinct
//!    candidates exist, or the queue is empty
//! 5. Score candidates exactly, sort by `(distance, id)`, keep `k`

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::path::Path;

use tracing::{debug, warn};

use crate::error::IndexLoadError;
use crate::vector::builder::Node;
use crate::vector::distance::{angular_distance_from_dot, normalize_vector_copy};
use crate::vector::storage::{IndexFile, IndexHeader};
use crate::vector::types::{ItemId, Metric, Neighbor, VectorDimension, VectorError};

/// Queue entry ordered by priority, then node index for a stable pop order.
#[derive(Debug, Clone, Copy)]
struct Pending {
    priority: f32,
    node: u32,
}

impl PartialEq for Pending {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Pending {}

impl PartialOrd for Pending {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Pending {
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority
            .total_cmp(&other.priority)
            .then_with(|| other.node.cmp(&self.node))
    }
}

/// An opened, immutable ANN index.
///
/// Cheap to share behind an `Arc`; queries only read the memory map.
#[derive(Debug)]
pub struct AnnIndex {
    file: IndexFile,
    dimension: VectorDimension,
}

impl AnnIndex {
    /// Opens an index and checks it against the caller's expectations.
    pub fn open(
        path: impl AsRef<Path>,
        dimension: VectorDimension,
        metric: Metric,
    ) -> Result<Self, IndexLoadError> {
        let file = IndexFile::open(path)?;
        let header = *file.header();

        if header.metric != metric {
            return Err(IndexLoadError::MetricMismatch {
                path: file.path().to_path_buf(),
                expected: metric,
                actual: header.metric.to_string(),
            });
        }
        if header.dimension != dimension.get() {
            return Err(IndexLoadError::DimensionMismatch {
                path: file.path().to_path_buf(),
                expected: dimension.get(),
                actual: header.dimension,
            });
        }

        debug!(
            "Opened index {} ({} items, {} trees)",
            file.path().display(),
            header.item_count,
            header.tree_count
        );

        Ok(Self { file, dimension })
    }

    /// Number of indexed items.
    #[must_use]
    pub fn len(&self) -> usize {
        self.file.header().item_count
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[must_use]
    pub fn dimension(&self) -> VectorDimension {
        self.dimension
    }

    #[must_use]
    pub fn metric(&self) -> Metric {
        self.file.header().metric
    }

    #[must_use]
    pub fn header(&self) -> &IndexHeader {
        self.file.header()
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        self.file.path()
    }

    /// Returns the `k` approximate nearest items to `query`.
    ///
    /// Uses the default search budget of `k * tree_count` leaf items.
    pub fn query(&self, query: &[f32], k: usize) -> Result<Vec<Neighbor>, VectorError> {
        self.query_with_search_k(query, k, None)
    }

    /// Returns the `k` approximate nearest items with an explicit budget.
    ///
    /// A larger `search_k` visits more leaves and improves recall; a budget
    /// of `item_count * tree_count` makes the result exact.
    pub fn query_with_search_k(
        &self,
        query: &[f32],
        k: usize,
        search_k: Option<usize>,
    ) -> Result<Vec<Neighbor>, VectorError> {
        if k == 0 {
            return Err(VectorError::InvalidParameter {
                name: "k",
                reason: "at least one result must be requested",
            });
        }
        self.dimension.validate_vector(query)?;
        if query.iter().any(|v| !v.is_finite()) {
            return Err(VectorError::InvalidQuery("contains NaN or infinite values"));
        }
        let query = normalize_vector_copy(query)
            .ok_or(VectorError::InvalidQuery("zero-length vectors have no direction"))?;

        let header = self.file.header();
        let item_count = header.item_count;
        let wanted = k.min(item_count);
        let budget = search_k.unwrap_or_else(|| k.saturating_mul(header.tree_count));

        let mut queue = BinaryHeap::with_capacity(header.tree_count * 2);
        for tree in 0..header.tree_count {
            if let Some(root) = self.file.root(tree) {
                queue.push(Pending {
                    priority: f32::INFINITY,
                    node: root,
                });
            }
        }

        let mut seen = vec![false; item_count];
        let mut candidates: Vec<u32> = Vec::with_capacity(budget.min(item_count));
        let mut visited = 0usize;
        let mut skipped = 0usize;
        // Every node has exactly one parent, so a valid forest never pops more
        let mut pops_left = header.node_count;

        while let Some(Pending { priority, node }) = queue.pop() {
            if visited >= budget && candidates.len() >= wanted {
                break;
            }
            if pops_left == 0 {
                skipped += 1;
                break;
            }
            pops_left -= 1;

            match self.file.node(node) {
                Some(Node::Split { left, right, plane }) => {
                    let Some(margin) = self.file.plane_margin(plane, &query) else {
                        skipped += 1;
                        continue;
                    };
                    queue.push(Pending {
                        priority: priority.min(margin),
                        node: right,
                    });
                    queue.push(Pending {
                        priority: priority.min(-margin),
                        node: left,
                    });
                }
                Some(Node::Leaf { start, len }) => {
                    let Some(items) = self.file.leaf_items(start, len) else {
                        skipped += 1;
                        continue;
                    };
                    for id in items {
                        let slot = id as usize;
                        if slot >= item_count {
                            skipped += 1;
                            continue;
                        }
                        visited += 1;
                        if !seen[slot] {
                            seen[slot] = true;
                            candidates.push(id);
                        }
                    }
                }
                None => skipped += 1,
            }
        }

        if skipped > 0 {
            warn!(
                "Skipped {skipped} out-of-range entries while querying {}; the index may be corrupt",
                self.file.path().display()
            );
        }

        let mut neighbors: Vec<Neighbor> = candidates
            .into_iter()
            .filter_map(|id| {
                self.file
                    .item_dot(id, &query)
                    .map(|d| Neighbor::new(ItemId::new(id), angular_distance_from_dot(d)))
            })
            .collect();
        neighbors.sort_unstable();
        neighbors.truncate(wanted);

        debug!(
            "Query visited {visited} leaf items, returning {} neighbours",
            neighbors.len()
        );

        Ok(neighbors)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vector::builder::{ForestParams, IndexBuilder};
    use crate::vector::distance::angular_distance;
    use tempfile::TempDir;

    const DIM: usize = 8;

    /// Deterministic pseudo-random vectors without pulling an rng into tests.
    fn vectors(n: usize) -> Vec<(ItemId, Vec<f32>)> {
        (0..n)
            .map(|i| {
                let v = (0..DIM)
                    .map(|d| (((i * 31 + d * 17) % 23) as f32 - 11.0) / 7.0 + 0.01)
                    .collect();
                (ItemId::new(i as u32), v)
            })
            .collect()
    }

    fn build(dir: &TempDir, items: &[(ItemId, Vec<f32>)], n_trees: usize) -> AnnIndex {
        let path = dir.path().join("index.ann");
        IndexBuilder::new(VectorDimension::new(DIM).unwrap())
            .with_params(ForestParams {
                n_trees,
                leaf_size: 4,
                seed: 3,
            })
            .build_to_file(items, &path)
            .unwrap();
        AnnIndex::open(&path, VectorDimension::new(DIM).unwrap(), Metric::Angular).unwrap()
    }

    #[test]
    fn test_query_returns_min_k_n_sorted() {
        let temp_dir = TempDir::new().unwrap();
        let items = vectors(60);
        let index = build(&temp_dir, &items, 5);
        let query = &items[7].1;

        for k in [1, 5, 60, 100] {
            let hits = index.query(query, k).unwrap();
            assert_eq!(hits.len(), k.min(60));
            assert!(hits.windows(2).all(|w| w[0].distance <= w[1].distance));
            assert!(hits.iter().all(|h| (0.0..=2.0).contains(&h.distance)));
        }
    }

    #[test]
    fn test_query_finds_the_item_itself() {
        let temp_dir = TempDir::new().unwrap();
        let items = vectors(60);
        let index = build(&temp_dir, &items, 5);

        let hits = index.query(&items[42].1, 1).unwrap();
        assert!(hits[0].distance < 1e-3);
    }

    #[test]
    fn test_full_budget_is_exact() {
        let temp_dir = TempDir::new().unwrap();
        let items = vectors(80);
        let index = build(&temp_dir, &items, 3);
        let query: Vec<f32> = (0..DIM).map(|d| d as f32 - 3.5).collect();

        let hits = index
            .query_with_search_k(&query, 10, Some(80 * 3))
            .unwrap();

        let mut exact: Vec<Neighbor> = items
            .iter()
            .map(|(id, v)| Neighbor::new(*id, angular_distance(&query, v)))
            .collect();
        exact.sort();

        for (hit, truth) in hits.iter().zip(&exact) {
            assert!((hit.distance - truth.distance).abs() < 1e-4);
        }
    }

    #[test]
    fn test_query_is_deterministic_and_magnitude_invariant() {
        let temp_dir = TempDir::new().unwrap();
        let items = vectors(50);
        let index = build(&temp_dir, &items, 4);
        let query = items[3].1.clone();
        let scaled: Vec<f32> = query.iter().map(|v| v * 4.0).collect();

        let a = index.query(&query, 7).unwrap();
        let b = index.query(&query, 7).unwrap();
        let c = index.query(&scaled, 7).unwrap();
        let ids = |hits: &[Neighbor]| hits.iter().map(|h| h.id).collect::<Vec<_>>();

        assert_eq!(ids(&a), ids(&b));
        assert_eq!(ids(&a), ids(&c));
    }

    #[test]
    fn test_query_rejects_bad_vectors() {
        let temp_dir = TempDir::new().unwrap();
        let index = build(&temp_dir, &vectors(10), 2);

        assert!(matches!(
            index.query(&[1.0; 3], 1),
            Err(VectorError::DimensionMismatch { .. })
        ));
        assert!(matches!(
            index.query(&[0.0; DIM], 1),
            Err(VectorError::InvalidQuery(_))
        ));
        assert!(matches!(
            index.query(&[1.0; DIM], 0),
            Err(VectorError::InvalidParameter { name: "k", .. })
        ));
    }

    #[test]
    fn test_open_checks_dimension() {
        let temp_dir = TempDir::new().unwrap();
        build(&temp_dir, &vectors(10), 2);

        let result = AnnIndex::open(
            temp_dir.path().join("index.ann"),
            VectorDimension::new(DIM + 1).unwrap(),
            Metric::Angular,
        );
        assert!(matches!(
            result,
            Err(IndexLoadError::DimensionMismatch {
                expected: 9,
                actual: 8,
                ..
            })
        ));
    }

    #[test]
    fn test_corrupt_leaf_ids_do_not_panic() {
        let temp_dir = TempDir::new().unwrap();
        let items = vectors(20);
        build(&temp_dir, &items, 2);
        let path = temp_dir.path().join("index.ann");

        // Overwrite the tail of the leaf item section with out-of-range ids
        let mut bytes = std::fs::read(&path).unwrap();
        let len = bytes.len();
        bytes[len - 8..].copy_from_slice(&[0xFF; 8]);
        std::fs::write(&path, &bytes).unwrap();

        let index =
            AnnIndex::open(&path, VectorDimension::new(DIM).unwrap(), Metric::Angular).unwrap();
        let hits = index.query_with_search_k(&items[0].1, 20, Some(1000)).unwrap();
        assert!(hits.iter().all(|h| h.id.as_index() < 20));
    }
}
