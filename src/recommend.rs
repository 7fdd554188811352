//! End-to-end recommendation pipeline.
//!
//! [`Recommender`] ties the query engine, the corpora and the result
//! assembler together behind a single request type. Everything it holds is
//! built once at startup and shared read-only afterwards.

use std::collections::HashMap;
use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::assemble::{Assembled, RecordIssue, ResultAssembler, ResultRecord};
use crate::cache::{CorpusIndexSource, IndexCache};
use crate::config::Settings;
use crate::corpus::Corpus;
use crate::error::{SearchError, SearchResult, SetupError};
use crate::provider::{EmbeddingProvider, GenerationProvider};
use crate::search::QueryEngine;

/// One recommendation request.
#[derive(Debug, Clone, Default)]
pub struct RecommendRequest {
    pub text: String,
    /// Corpus to search; the configured default when `None`
    pub corpus: Option<String>,
    /// Result count; the configured default when `None`
    pub k: Option<usize>,
    pub explain: bool,
}

impl RecommendRequest {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            ..Self::default()
        }
    }
}

/// The answer to a [`RecommendRequest`].
#[derive(Debug, Clone, Serialize)]
pub struct Recommendations {
    pub corpus: String,
    pub query: String,
    pub records: Vec<ResultRecord>,
    /// Contained per-record failures
    #[serde(skip)]
    pub issues: Vec<RecordIssue>,
}

impl Recommendations {
    /// Wraps assembled records, failing with [`SearchError::NoResults`] when
    /// none survived the metadata join.
    pub fn from_assembled(corpus: &str, query: &str, assembled: Assembled) -> SearchResult<Self> {
        if !assembled.issues.is_empty() {
            warn!(
                "{} records degraded for query in corpus '{corpus}'",
                assembled.issues.len()
            );
        }
        if assembled.records.is_empty() {
            return Err(SearchError::NoResults {
                corpus: corpus.to_string(),
            });
        }

        debug!(
            "Assembled {} records for corpus '{corpus}'",
            assembled.records.len()
        );

        Ok(Self {
            corpus: corpus.to_string(),
            query: query.to_string(),
            records: assembled.records,
            issues: assembled.issues,
        })
    }
}

/// Answers recommendation requests against preloaded corpora.
#[derive(Debug)]
pub struct Recommender {
    engine: QueryEngine,
    assembler: ResultAssembler,
    corpora: HashMap<String, Arc<Corpus>>,
    default_corpus: String,
    default_k: usize,
}

impl Recommender {
    pub fn new(
        engine: QueryEngine,
        assembler: ResultAssembler,
        corpora: impl IntoIterator<Item = Corpus>,
        default_corpus: impl Into<String>,
        default_k: usize,
    ) -> Self {
        let corpora = corpora
            .into_iter()
            .map(|corpus| (corpus.name().to_string(), Arc::new(corpus)))
            .collect();
        Self {
            engine,
            assembler,
            corpora,
            default_corpus: default_corpus.into(),
            default_k,
        }
    }

    /// Wires the full pipeline from settings, loading every corpus listed in
    /// `corpus_names` from its metadata file.
    pub fn from_settings(
        settings: &Settings,
        embedder: Arc<dyn EmbeddingProvider>,
        generator: Option<Arc<dyn GenerationProvider>>,
        corpus_names: &[&str],
    ) -> Result<Self, SetupError> {
        let mut corpora = Vec::with_capacity(corpus_names.len());
        for name in corpus_names {
            let config = settings
                .corpus(name)
                .ok_or_else(|| SetupError::UnknownCorpus {
                    corpus: name.to_string(),
                })?;
            let path = settings.resolve_path(&config.metadata_path);
            corpora.push(Corpus::from_csv(*name, path)?);
        }

        let source = CorpusIndexSource::from_settings(settings)?;
        let indices = Arc::new(IndexCache::new(source));
        let engine = QueryEngine::new(embedder, indices, &settings.search, &settings.embedding);

        let assembler = match generator {
            Some(generator) => ResultAssembler::new(generator, &settings.generation)?,
            None => ResultAssembler::without_generation(&settings.generation)?,
        };

        info!("Recommender ready with {} corpora", corpora.len());
        Ok(Self::new(
            engine,
            assembler,
            corpora,
            settings.default_corpus.clone(),
            settings.search.default_k,
        ))
    }

    pub fn engine(&self) -> &QueryEngine {
        &self.engine
    }

    pub fn corpus(&self, name: &str) -> Option<&Arc<Corpus>> {
        self.corpora.get(name)
    }

    /// Runs search and assembly for one request.
    pub fn recommend(&self, request: &RecommendRequest) -> SearchResult<Recommendations> {
        let corpus_name = request.corpus.as_deref().unwrap_or(&self.default_corpus);
        let k = request.k.unwrap_or(self.default_k);
        if k == 0 {
            return Err(SearchError::InvalidK);
        }

        let corpus = self
            .corpora
            .get(corpus_name)
            .ok_or_else(|| SearchError::UnknownCorpus {
                corpus: corpus_name.to_string(),
            })?;

        // Index and metadata must describe the same item set
        let index = self.engine.indices().get_or_load(corpus_name)?;
        corpus.verify_index(&index)?;

        let ranked = self.engine.search(&request.text, corpus_name, k)?;
        let assembled = self
            .assembler
            .assemble(&ranked, corpus, request.explain, &request.text);

        Recommendations::from_assembled(corpus_name, &request.text, assembled)
    }
}
