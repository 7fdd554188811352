//! Query engine: text in, ranked neighbours out.

use std::sync::Arc;

use tracing::debug;

use crate::cache::{IndexCache, SingleFlightCache};
use crate::config::{EmbeddingConfig, SearchConfig};
use crate::error::{EmbeddingError, SearchError, SearchResult};
use crate::provider::{EmbeddingProvider, Truncate};
use crate::vector::{Neighbor, normalize_vector_copy};

/// Key of the optional result cache.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SearchKey {
    pub query: String,
    pub corpus: String,
    pub k: usize,
}

/// Embeds queries and runs them against cached indices.
pub struct QueryEngine {
    embedder: Arc<dyn EmbeddingProvider>,
    indices: Arc<IndexCache>,
    truncate: Truncate,
    search_k: Option<usize>,
    results: Option<SingleFlightCache<SearchKey, Arc<Vec<Neighbor>>>>,
}

impl std::fmt::Debug for QueryEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryEngine")
            .field("model", &self.embedder.model())
            .field("truncate", &self.truncate)
            .field("search_k", &self.search_k)
            .field("cache_results", &self.results.is_some())
            .finish_non_exhaustive()
    }
}

impl QueryEngine {
    pub fn new(
        embedder: Arc<dyn EmbeddingProvider>,
        indices: Arc<IndexCache>,
        search: &SearchConfig,
        embedding: &EmbeddingConfig,
    ) -> Self {
        Self {
            embedder,
            indices,
            truncate: embedding.truncate,
            search_k: search.search_k,
            results: search.cache_results.then(SingleFlightCache::new),
        }
    }

    pub fn indices(&self) -> &Arc<IndexCache> {
        &self.indices
    }

    /// Returns the `k` nearest corpus items to `query`, nearest first.
    ///
    /// Fewer than `k` results come back only when the corpus is smaller.
    pub fn search(&self, query: &str, corpus: &str, k: usize) -> SearchResult<Vec<Neighbor>> {
        if k == 0 {
            return Err(SearchError::InvalidK);
        }

        match &self.results {
            Some(cache) => {
                let key = SearchKey {
                    query: query.to_string(),
                    corpus: corpus.to_string(),
                    k,
                };
                let hits = cache.get_or_try_load(&key, || {
                    self.search_uncached(query, corpus, k).map(Arc::new)
                })?;
                Ok(hits.as_ref().clone())
            }
            None => self.search_uncached(query, corpus, k),
        }
    }

    fn search_uncached(&self, query: &str, corpus: &str, k: usize) -> SearchResult<Vec<Neighbor>> {
        let mut embeddings = self.embedder.embed(&[query], self.truncate)?;
        if embeddings.len() != 1 {
            return Err(EmbeddingError::CountMismatch {
                expected: 1,
                actual: embeddings.len(),
            }
            .into());
        }
        let embedding = embeddings.swap_remove(0);

        let index = self.indices.get_or_load(corpus)?;
        let dimension = index.dimension().get();
        if embedding.len() != dimension {
            return Err(EmbeddingError::DimensionMismatch {
                expected: dimension,
                actual: embedding.len(),
            }
            .into());
        }

        if embedding.iter().any(|value| !value.is_finite()) {
            return Err(EmbeddingError::InvalidResponse(
                "query embedding contains non-finite values".to_string(),
            )
            .into());
        }
        if normalize_vector_copy(&embedding).is_none() {
            return Err(EmbeddingError::InvalidResponse(
                "query embedding is a zero vector".to_string(),
            )
            .into());
        }

        let hits = index.query_with_search_k(&embedding, k, self.search_k)?;
        debug!("Found {} neighbours in corpus '{corpus}'", hits.len());
        Ok(hits)
    }

    /// Drops the cached index and any cached results for `corpus`.
    pub fn invalidate_corpus(&self, corpus: &str) {
        self.indices.invalidate(corpus);
        if let Some(cache) = &self.results {
            cache.invalidate_where(|key| key.corpus == corpus);
        }
    }
}
