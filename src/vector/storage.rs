//! Memory-mapped index file format.
//!
//! An index is written once by [`write_index`] and afterwards only read
//! through a memory map, so opening is O(1) I/O and concurrent processes
//! share the pages through the OS page cache.
//!
//! # Storage Format
//!
//! All integers and floats are little-endian.
//! - Header (40 bytes): magic, version, metric, dimension, item count,
//!   tree count, node count, plane count, leaf item count, leaf size
//! - Vectors: unit vectors, item `i` at slot `i`
//! - Roots: one u32 node index per tree
//! - Nodes: 16-byte records `kind, a, b, c`
//! - Planes: one normal of `dimension` f32 per split node
//! - Leaf items: u32 item ids referenced by leaf nodes
//!
//! The file length must match the header exactly, which catches truncation.

use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};

use memmap2::{Mmap, MmapOptions};
use serde::Serialize;
use tracing::debug;

use crate::error::IndexLoadError;
use crate::vector::builder::{BuiltForest, Node};
use crate::vector::types::{ItemId, Metric};

/// Current storage format version.
pub const STORAGE_VERSION: u32 = 1;

/// Size of the storage header in bytes.
const HEADER_SIZE: usize = 40;

/// Magic bytes to identify index files.
const MAGIC_BYTES: &[u8; 4] = b"PANN";

/// Number of bytes per f32 value.
const BYTES_PER_F32: usize = 4;

/// Number of bytes per u32 value.
const BYTES_PER_U32: usize = 4;

/// Size of one node record.
const NODE_RECORD_SIZE: usize = 16;

const NODE_KIND_LEAF: u32 = 0;
const NODE_KIND_SPLIT: u32 = 1;

/// Decoded index header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct IndexHeader {
    pub version: u32,
    pub metric: Metric,
    pub dimension: usize,
    pub item_count: usize,
    pub tree_count: usize,
    pub node_count: usize,
    pub plane_count: usize,
    pub leaf_item_count: usize,
    pub leaf_size: usize,
}

/// Byte offsets of each section.
#[derive(Debug, Clone, Copy)]
struct Layout {
    vectors: usize,
    roots: usize,
    nodes: usize,
    planes: usize,
    leaf_items: usize,
    total: usize,
}

impl Layout {
    /// Computes section offsets, or `None` if the sizes overflow.
    fn of(header: &IndexHeader) -> Option<Self> {
        let vector_bytes = header
            .item_count
            .checked_mul(header.dimension)?
            .checked_mul(BYTES_PER_F32)?;
        let plane_bytes = header
            .plane_count
            .checked_mul(header.dimension)?
            .checked_mul(BYTES_PER_F32)?;

        let vectors = HEADER_SIZE;
        let roots = vectors.checked_add(vector_bytes)?;
        let nodes = roots.checked_add(header.tree_count.checked_mul(BYTES_PER_U32)?)?;
        let planes = nodes.checked_add(header.node_count.checked_mul(NODE_RECORD_SIZE)?)?;
        let leaf_items = planes.checked_add(plane_bytes)?;
        let total = leaf_items.checked_add(header.leaf_item_count.checked_mul(BYTES_PER_U32)?)?;

        Some(Self {
            vectors,
            roots,
            nodes,
            planes,
            leaf_items,
            total,
        })
    }
}

/// Writes a built forest to `path`.
///
/// The file is written to a temporary sibling and renamed into place, so a
/// reader never maps a half-written index.
pub fn write_index(path: &Path, forest: &BuiltForest) -> io::Result<()> {
    let parent = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };
    std::fs::create_dir_all(&parent)?;

    let mut tmp = tempfile::NamedTempFile::new_in(&parent)?;
    {
        let mut out = BufWriter::new(tmp.as_file_mut());

        // Header
        out.write_all(MAGIC_BYTES)?;
        for value in [
            STORAGE_VERSION,
            forest.metric.code(),
            to_u32(forest.dimension.get())?,
            to_u32(forest.item_count())?,
            to_u32(forest.roots.len())?,
            to_u32(forest.nodes.len())?,
            to_u32(forest.planes.len() / forest.dimension.get())?,
            to_u32(forest.leaf_items.len())?,
            to_u32(forest.params.leaf_size)?,
        ] {
            out.write_all(&value.to_le_bytes())?;
        }

        for value in &forest.vectors {
            out.write_all(&value.to_le_bytes())?;
        }
        for root in &forest.roots {
            out.write_all(&root.to_le_bytes())?;
        }
        for node in &forest.nodes {
            let record = match *node {
                Node::Leaf { start, len } => [NODE_KIND_LEAF, start, len, 0],
                Node::Split { left, right, plane } => [NODE_KIND_SPLIT, left, right, plane],
            };
            for value in record {
                out.write_all(&value.to_le_bytes())?;
            }
        }
        for value in &forest.planes {
            out.write_all(&value.to_le_bytes())?;
        }
        for id in &forest.leaf_items {
            out.write_all(&id.to_le_bytes())?;
        }

        out.flush()?;
    }
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| e.error)?;

    debug!("Wrote index to {}", path.display());
    Ok(())
}

fn to_u32(value: usize) -> io::Result<u32> {
    u32::try_from(value)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "value exceeds u32 range"))
}

#[inline]
fn read_u32(bytes: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes([
        bytes[offset],
        bytes[offset + 1],
        bytes[offset + 2],
        bytes[offset + 3],
    ])
}

/// Dot product of a stored f32 run with `query`, read straight from the map.
#[inline]
fn dot_stored(bytes: &[u8], query: &[f32]) -> f32 {
    bytes
        .chunks_exact(BYTES_PER_F32)
        .zip(query)
        .map(|(c, &q)| f32::from_le_bytes([c[0], c[1], c[2], c[3]]) * q)
        .sum()
}

/// A validated, memory-mapped index file.
///
/// All accessors are bounds-checked and return `None` on out-of-range
/// references instead of panicking, since node contents are not scanned when
/// the file is opened.
#[derive(Debug)]
pub struct IndexFile {
    path: PathBuf,
    mmap: Mmap,
    header: IndexHeader,
    layout: Layout,
}

impl IndexFile {
    /// Maps the file at `path` and validates its header and length.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, IndexLoadError> {
        let path = path.as_ref().to_path_buf();

        let file = File::open(&path).map_err(|source| {
            if source.kind() == io::ErrorKind::NotFound {
                IndexLoadError::NotFound { path: path.clone() }
            } else {
                IndexLoadError::Io {
                    path: path.clone(),
                    source,
                }
            }
        })?;
        // The index is immutable once written; rebuilds replace it by rename.
        let mmap = unsafe { MmapOptions::new().map(&file) }.map_err(|source| IndexLoadError::Io {
            path: path.clone(),
            source,
        })?;

        let header = Self::read_header(&path, &mmap)?;
        let layout = Layout::of(&header).ok_or_else(|| IndexLoadError::Corrupt {
            path: path.clone(),
            reason: "section sizes overflow".to_string(),
        })?;

        if mmap.len() != layout.total {
            return Err(IndexLoadError::Corrupt {
                path,
                reason: format!(
                    "expected {} bytes, found {} (truncated or trailing data)",
                    layout.total,
                    mmap.len()
                ),
            });
        }

        debug!(
            "Mapped index {} ({} items, {} trees)",
            path.display(),
            header.item_count,
            header.tree_count
        );

        Ok(Self {
            path,
            mmap,
            header,
            layout,
        })
    }

    fn read_header(path: &Path, bytes: &[u8]) -> Result<IndexHeader, IndexLoadError> {
        let corrupt = |reason: &str| IndexLoadError::Corrupt {
            path: path.to_path_buf(),
            reason: reason.to_string(),
        };

        if bytes.len() < HEADER_SIZE {
            return Err(corrupt("file too small to contain header"));
        }
        if &bytes[0..4] != MAGIC_BYTES {
            return Err(corrupt("invalid magic bytes"));
        }

        let version = read_u32(bytes, 4);
        if version != STORAGE_VERSION {
            return Err(IndexLoadError::VersionMismatch {
                path: path.to_path_buf(),
                expected: STORAGE_VERSION,
                actual: version,
            });
        }

        let metric_code = read_u32(bytes, 8);
        let metric = Metric::from_code(metric_code).ok_or_else(|| IndexLoadError::MetricMismatch {
            path: path.to_path_buf(),
            expected: Metric::Angular,
            actual: format!("unknown ({metric_code})"),
        })?;

        let header = IndexHeader {
            version,
            metric,
            dimension: read_u32(bytes, 12) as usize,
            item_count: read_u32(bytes, 16) as usize,
            tree_count: read_u32(bytes, 20) as usize,
            node_count: read_u32(bytes, 24) as usize,
            plane_count: read_u32(bytes, 28) as usize,
            leaf_item_count: read_u32(bytes, 32) as usize,
            leaf_size: read_u32(bytes, 36) as usize,
        };

        if header.dimension == 0 {
            return Err(corrupt("zero vector dimension"));
        }
        if header.item_count == 0 {
            return Err(corrupt("index holds no items"));
        }
        if header.tree_count == 0 {
            return Err(corrupt("index holds no trees"));
        }

        Ok(header)
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    #[must_use]
    pub fn header(&self) -> &IndexHeader {
        &self.header
    }

    /// Size of the mapped file in bytes.
    #[must_use]
    pub fn file_size(&self) -> usize {
        self.mmap.len()
    }

    pub(crate) fn root(&self, tree: usize) -> Option<u32> {
        (tree < self.header.tree_count)
            .then(|| read_u32(&self.mmap, self.layout.roots + tree * BYTES_PER_U32))
    }

    pub(crate) fn node(&self, index: u32) -> Option<Node> {
        let index = index as usize;
        if index >= self.header.node_count {
            return None;
        }
        let offset = self.layout.nodes + index * NODE_RECORD_SIZE;
        let a = read_u32(&self.mmap, offset + 4);
        let b = read_u32(&self.mmap, offset + 8);
        let c = read_u32(&self.mmap, offset + 12);

        match read_u32(&self.mmap, offset) {
            NODE_KIND_LEAF => Some(Node::Leaf { start: a, len: b }),
            NODE_KIND_SPLIT => Some(Node::Split {
                left: a,
                right: b,
                plane: c,
            }),
            _ => None,
        }
    }

    /// Signed distance of `query` to a split plane.
    pub(crate) fn plane_margin(&self, plane: u32, query: &[f32]) -> Option<f32> {
        let plane = plane as usize;
        if plane >= self.header.plane_count {
            return None;
        }
        let width = self.header.dimension * BYTES_PER_F32;
        let start = self.layout.planes + plane * width;
        Some(dot_stored(&self.mmap[start..start + width], query))
    }

    /// Dot product of the stored unit vector of `id` with `query`.
    pub(crate) fn item_dot(&self, id: u32, query: &[f32]) -> Option<f32> {
        self.item_bytes(id).map(|bytes| dot_stored(bytes, query))
    }

    /// Item ids of a leaf, if the range lies inside the leaf section.
    pub(crate) fn leaf_items(&self, start: u32, len: u32) -> Option<impl Iterator<Item = u32> + '_> {
        let end = (start as usize).checked_add(len as usize)?;
        if end > self.header.leaf_item_count {
            return None;
        }
        let from = self.layout.leaf_items + start as usize * BYTES_PER_U32;
        let to = self.layout.leaf_items + end * BYTES_PER_U32;
        Some(
            self.mmap[from..to]
                .chunks_exact(BYTES_PER_U32)
                .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]])),
        )
    }

    /// Reads the stored (unit-normalised) vector of an item.
    #[must_use]
    pub fn read_vector(&self, id: ItemId) -> Option<Vec<f32>> {
        self.item_bytes(id.get()).map(|bytes| {
            bytes
                .chunks_exact(BYTES_PER_F32)
                .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
                .collect()
        })
    }

    fn item_bytes(&self, id: u32) -> Option<&[u8]> {
        let id = id as usize;
        if id >= self.header.item_count {
            return None;
        }
        let width = self.header.dimension * BYTES_PER_F32;
        let start = self.layout.vectors + id * width;
        Some(&self.mmap[start..start + width])
    }
}
