//! Semantic recommendations over pre-embedded text corpora.
//!
//! A query is embedded through an [`EmbeddingProvider`], matched against a
//! memory-mapped approximate nearest neighbour index, joined with the corpus
//! metadata and optionally annotated with generated explanations.

pub mod assemble;
pub mod cache;
pub mod config;
pub mod corpus;
pub mod display;
pub mod error;
pub mod indexing;
pub mod provider;
pub mod recommend;
pub mod search;
pub mod vector;

// Explicit exports for better API clarity
pub use assemble::{Assembled, RecordIssue, ResultAssembler, ResultRecord};
pub use cache::{CorpusIndexSource, IndexCache, IndexHandle, IndexSource, SingleFlightCache};
pub use config::Settings;
pub use corpus::{Corpus, CorpusItem};
pub use error::{
    CorpusError, EmbeddingError, GenerationError, IndexBuildError, IndexLoadError,
    MetadataLookupError, SearchError, SearchResult, SetupError,
};
pub use provider::{CohereClient, EmbeddingProvider, GenerationProvider, SamplingConfig, Truncate};
pub use recommend::{RecommendRequest, Recommendations, Recommender};
pub use search::QueryEngine;
pub use vector::{AnnIndex, ItemId, Neighbor, VectorDimension};
