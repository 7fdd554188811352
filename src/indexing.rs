//! Offline index construction.
//!
//! Embeds every corpus text through the embedding provider (or reads
//! precomputed vectors from a JSON Lines file) and writes the ANN index.

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};

use indicatif::ProgressBar;
use serde::Deserialize;
use tracing::{debug, info};

use crate::config::Settings;
use crate::corpus::Corpus;
use crate::error::{EmbeddingError, IndexBuildError};
use crate::provider::{EmbeddingProvider, Truncate};
use crate::vector::{
    BuiltForest, ForestParams, IndexBuilder, ItemId, VectorDimension, VectorError,
};

/// One line of a vectors file.
#[derive(Debug, Deserialize)]
struct VectorRecord {
    id: u32,
    embedding: Vec<f32>,
}

/// Summary of a finished build.
#[derive(Debug, Clone)]
pub struct BuildReport {
    pub path: PathBuf,
    pub items: usize,
    pub trees: usize,
    pub nodes: usize,
}

impl BuildReport {
    fn new(path: &Path, forest: &BuiltForest) -> Self {
        Self {
            path: path.to_path_buf(),
            items: forest.item_count(),
            trees: forest.tree_count(),
            nodes: forest.node_count(),
        }
    }
}

/// Embeds all corpus texts in batches, returning vectors keyed by item id.
pub fn embed_corpus(
    embedder: &dyn EmbeddingProvider,
    corpus: &Corpus,
    batch_size: usize,
    truncate: Truncate,
    progress: Option<&ProgressBar>,
) -> Result<Vec<(ItemId, Vec<f32>)>, IndexBuildError> {
    let batch_size = batch_size.max(1);
    let mut vectors = Vec::with_capacity(corpus.len());

    for batch in corpus.items().chunks(batch_size) {
        let texts: Vec<&str> = batch.iter().map(|item| item.text.as_str()).collect();
        let embeddings = embedder.embed(&texts, truncate)?;
        if embeddings.len() != texts.len() {
            return Err(EmbeddingError::CountMismatch {
                expected: texts.len(),
                actual: embeddings.len(),
            }
            .into());
        }

        vectors.extend(batch.iter().map(|item| item.id).zip(embeddings));
        if let Some(pb) = progress {
            pb.inc(batch.len() as u64);
        }
        debug!("Embedded {}/{} texts", vectors.len(), corpus.len());
    }

    Ok(vectors)
}

/// Reads `{"id": .., "embedding": [..]}` records, one per line.
pub fn read_vectors_jsonl(
    path: impl AsRef<Path>,
) -> Result<Vec<(ItemId, Vec<f32>)>, IndexBuildError> {
    let path = path.as_ref();
    let io_error = |source| IndexBuildError::Io {
        path: path.to_path_buf(),
        source,
    };

    let reader = BufReader::new(File::open(path).map_err(io_error)?);
    let mut vectors = Vec::new();

    for (index, line) in reader.lines().enumerate() {
        let line = line.map_err(io_error)?;
        if line.trim().is_empty() {
            continue;
        }
        let record: VectorRecord =
            serde_json::from_str(&line).map_err(|source| IndexBuildError::Json {
                path: path.to_path_buf(),
                line: index + 1,
                source,
            })?;
        vectors.push((ItemId::new(record.id), record.embedding));
    }

    debug!("Read {} vectors from {}", vectors.len(), path.display());
    Ok(vectors)
}

/// Builds a forest over `vectors` and writes it to `path`.
pub fn build_index(
    vectors: &[(ItemId, Vec<f32>)],
    dimension: VectorDimension,
    params: ForestParams,
    path: &Path,
) -> Result<BuildReport, IndexBuildError> {
    let forest = IndexBuilder::new(dimension)
        .with_params(params)
        .build(vectors)?;
    write_forest(&forest, path)
}

/// Like [`build_index`], but refuses to touch `path` unless the vectors
/// cover exactly the rows of `corpus`.
pub fn build_index_for_corpus(
    vectors: &[(ItemId, Vec<f32>)],
    corpus: &Corpus,
    dimension: VectorDimension,
    params: ForestParams,
    path: &Path,
) -> Result<BuildReport, IndexBuildError> {
    corpus.verify_len(vectors.len())?;
    let forest = IndexBuilder::new(dimension)
        .with_params(params)
        .build(vectors)?;
    corpus.verify_len(forest.item_count())?;
    write_forest(&forest, path)
}

fn write_forest(forest: &BuiltForest, path: &Path) -> Result<BuildReport, IndexBuildError> {
    forest.save(path)?;
    let report = BuildReport::new(path, forest);

    info!(
        "Wrote index {} ({} items, {} trees, {} nodes)",
        path.display(),
        report.items,
        report.trees,
        report.nodes
    );
    Ok(report)
}

/// Parameters of a corpus index build.
#[derive(Debug, Clone, Copy)]
pub struct BuildOptions {
    pub dimension: VectorDimension,
    pub params: ForestParams,
    pub batch_size: usize,
    pub truncate: Truncate,
}

impl BuildOptions {
    pub fn from_settings(settings: &Settings) -> Result<Self, VectorError> {
        Ok(Self {
            dimension: settings.embedding.vector_dimension()?,
            params: settings.build.forest_params(),
            batch_size: settings.build.embed_batch_size,
            truncate: settings.embedding.truncate,
        })
    }
}

/// Embeds a corpus and writes its index, checking the vectors cover every row
/// before anything is written.
pub fn build_corpus_index(
    embedder: &dyn EmbeddingProvider,
    corpus: &Corpus,
    options: &BuildOptions,
    path: &Path,
    progress: Option<&ProgressBar>,
) -> Result<BuildReport, IndexBuildError> {
    let vectors = embed_corpus(
        embedder,
        corpus,
        options.batch_size,
        options.truncate,
        progress,
    )?;
    build_index_for_corpus(&vectors, corpus, options.dimension, options.params, path)
}
