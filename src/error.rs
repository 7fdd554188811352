//! Error types for the recommendation pipeline
//!
//! Structural errors (bad index, bad corpus, failed query embedding) abort a
//! request and surface as [`SearchError`]. Per-record errors
//! ([`MetadataLookupError`], [`GenerationError`]) are contained by the result
//! assembler and reported alongside the records instead.

use crate::vector::{ItemId, Metric, VectorError};
use std::path::PathBuf;
use thiserror::Error;

/// Errors raised while opening a memory-mapped index file
#[derive(Error, Debug)]
pub enum IndexLoadError {
    #[error("Index file not found: '{path}'\nSuggestion: Run 'insighter build' for this corpus first")]
    NotFound { path: PathBuf },

    #[error("Failed to read index file '{path}': {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Index file '{path}' is corrupt: {reason}\nSuggestion: Rebuild the index")]
    Corrupt { path: PathBuf, reason: String },

    #[error(
        "Index file '{path}' has format version {actual}, expected {expected}\nSuggestion: Rebuild the index with this version of insighter"
    )]
    VersionMismatch {
        path: PathBuf,
        expected: u32,
        actual: u32,
    },

    #[error(
        "Index file '{path}' stores {actual}-dimensional vectors, expected {expected}\nSuggestion: Check that the embedding model matches the one used to build the index"
    )]
    DimensionMismatch {
        path: PathBuf,
        expected: usize,
        actual: usize,
    },

    #[error("Index file '{path}' was built for the {actual} metric, expected {expected}")]
    MetricMismatch {
        path: PathBuf,
        expected: Metric,
        actual: String,
    },

    #[error("No index configured for corpus '{corpus}'\nSuggestion: Add a [corpora.{corpus}] section to settings.toml")]
    UnknownCorpus { corpus: String },
}

/// Errors from the embedding collaborator
#[derive(Error, Debug)]
pub enum EmbeddingError {
    #[error("Embedding request failed: {0}")]
    Request(String),

    #[error("Embedding provider returned HTTP {status}")]
    Status { status: u16 },

    #[error("Embedding provider returned an unreadable response: {0}")]
    InvalidResponse(String),

    #[error("Embedding provider returned {actual} vectors for {expected} texts")]
    CountMismatch { expected: usize, actual: usize },

    #[error(
        "Embedding has {actual} dimensions, expected {expected}\nSuggestion: Use the same embedding model that built the index"
    )]
    DimensionMismatch { expected: usize, actual: usize },
}

/// Errors from the text generation collaborator
#[derive(Error, Debug, Clone, PartialEq)]
pub enum GenerationError {
    #[error("Generation request failed: {0}")]
    Request(String),

    #[error("Generation provider returned HTTP {status}")]
    Status { status: u16 },

    #[error("Generation provider returned an unreadable response: {0}")]
    InvalidResponse(String),

    #[error("Generation provider returned no text")]
    Empty,

    #[error("No generation provider configured")]
    Unavailable,
}

/// A ranked id with no matching corpus row (index/corpus desync)
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Corpus '{corpus}' has no row for item {id}\nSuggestion: Rebuild the index from the current metadata file")]
pub struct MetadataLookupError {
    pub corpus: String,
    pub id: ItemId,
}

/// Errors raised while loading or validating corpus metadata
#[derive(Error, Debug)]
pub enum CorpusError {
    #[error("Failed to read corpus metadata '{path}': {source}")]
    Read { path: PathBuf, source: csv::Error },

    #[error("Malformed corpus metadata at row {row}: {source}")]
    Row { row: u64, source: csv::Error },

    #[error("Corpus '{corpus}' is empty")]
    Empty { corpus: String },

    #[error(
        "Corpus '{corpus}' ids are not dense: expected id {expected}, found {found}\nSuggestion: Ids must be unique and cover 0..n"
    )]
    NonDenseIds {
        corpus: String,
        expected: u32,
        found: u32,
    },

    #[error(
        "Index for corpus '{corpus}' holds {index_len} items but the metadata has {corpus_len} rows\nSuggestion: Rebuild the index from the current metadata file"
    )]
    SizeMismatch {
        corpus: String,
        index_len: usize,
        corpus_len: usize,
    },
}

/// Errors that abort a search request
#[derive(Error, Debug)]
pub enum SearchError {
    #[error("Result count must be at least 1")]
    InvalidK,

    #[error("Unknown corpus '{corpus}'")]
    UnknownCorpus { corpus: String },

    #[error(transparent)]
    Embedding(#[from] EmbeddingError),

    #[error(transparent)]
    IndexLoad(#[from] IndexLoadError),

    #[error(transparent)]
    Corpus(#[from] CorpusError),

    #[error(transparent)]
    Query(#[from] VectorError),

    #[error("No results for this query in corpus '{corpus}'")]
    NoResults { corpus: String },
}

impl SearchError {
    /// Stable identifier for programmatic handling (JSON output, exit codes).
    pub fn status_code(&self) -> &'static str {
        match self {
            Self::InvalidK => "INVALID_K",
            Self::UnknownCorpus { .. } => "UNKNOWN_CORPUS",
            Self::Embedding(_) => "EMBEDDING_ERROR",
            Self::IndexLoad(_) => "INDEX_LOAD_ERROR",
            Self::Corpus(_) => "CORPUS_ERROR",
            Self::Query(_) => "QUERY_ERROR",
            Self::NoResults { .. } => "NO_RESULTS",
        }
    }

    /// Whether retrying the same request later could succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Embedding(EmbeddingError::Request(_)) => true,
            Self::Embedding(EmbeddingError::Status { status }) => {
                *status == 429 || *status >= 500
            }
            _ => false,
        }
    }

    /// Get recovery suggestions for this error
    pub fn recovery_suggestions(&self) -> Vec<&'static str> {
        match self {
            Self::InvalidK => vec!["Pass a result count of 1 or more"],
            Self::UnknownCorpus { .. } => vec![
                "Run 'insighter config' to list configured corpora",
                "Add the corpus under [corpora] in .insighter/settings.toml",
            ],
            Self::Embedding(EmbeddingError::Status { status: 401 | 403 }) => vec![
                "Check that COHERE_API_KEY holds a valid key",
                "Authentication errors are not retried",
            ],
            Self::Embedding(_) => vec![
                "Check network connectivity to the embedding provider",
                "Transient failures can be retried with backoff",
            ],
            Self::IndexLoad(_) | Self::Corpus(_) => vec![
                "Run 'insighter build --corpus <name>' to rebuild the index",
                "Restart the process after replacing an index file",
            ],
            Self::Query(_) => vec!["Check that the query embedding matches the index dimension"],
            Self::NoResults { .. } => vec!["Try a broader query or another corpus"],
        }
    }
}

/// Errors raised while wiring the pipeline together at startup
#[derive(Error, Debug)]
pub enum SetupError {
    #[error(
        "Environment variable {var} is not set\nSuggestion: Export your Cohere API key, e.g. `export {var}=...`"
    )]
    MissingApiKey { var: String },

    #[error("Invalid provider base URL '{url}': {source}")]
    InvalidBaseUrl {
        url: String,
        source: url::ParseError,
    },

    #[error("Unknown corpus '{corpus}'\nSuggestion: Add a [corpora.{corpus}] section to settings.toml")]
    UnknownCorpus { corpus: String },

    #[error(transparent)]
    Vector(#[from] VectorError),

    #[error("Failed to start explanation worker pool: {0}")]
    WorkerPool(#[from] rayon::ThreadPoolBuildError),

    #[error(transparent)]
    Corpus(#[from] CorpusError),
}

/// Errors raised while building an index offline
#[derive(Error, Debug)]
pub enum IndexBuildError {
    #[error(transparent)]
    Embedding(#[from] EmbeddingError),

    #[error(transparent)]
    Vector(#[from] VectorError),

    #[error(transparent)]
    Corpus(#[from] CorpusError),

    #[error("Failed to read vectors file '{path}': {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Malformed record at line {line} of '{path}': {source}")]
    Json {
        path: PathBuf,
        line: usize,
        source: serde_json::Error,
    },
}

/// Result type alias for search requests
pub type SearchResult<T> = Result<T, SearchError>;
