#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use insighter::config::{EmbeddingConfig, GenerationConfig, SearchConfig};
use insighter::indexing::{build_index, embed_corpus};
use insighter::vector::ForestParams;
use insighter::{
    AnnIndex, Corpus, CorpusIndexSource, CorpusItem, EmbeddingError, EmbeddingProvider,
    GenerationError, GenerationProvider, IndexCache, IndexLoadError, IndexSource, QueryEngine,
    SamplingConfig, Truncate, VectorDimension,
};
use tempfile::TempDir;

pub const DIM: usize = 4;

/// Keyword to vector table used by [`KeywordEmbedder`].
const TOPICS: [(&str, [f32; DIM]); 5] = [
    ("focus", [1.0, 0.1, 0.0, 0.0]),
    ("teams", [0.2, 1.0, 0.0, 0.0]),
    ("supply", [0.0, 0.1, 1.0, 0.0]),
    ("remote", [0.1, 0.5, 0.0, 1.0]),
    ("leader", [0.5, 0.5, 0.5, 0.5]),
];

/// Embeds a text as the vector of the first topic keyword it contains.
#[derive(Default)]
pub struct KeywordEmbedder {
    pub calls: AtomicUsize,
}

impl KeywordEmbedder {
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl EmbeddingProvider for KeywordEmbedder {
    fn embed(&self, texts: &[&str], _truncate: Truncate) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(texts
            .iter()
            .map(|text| {
                let lower = text.to_lowercase();
                TOPICS
                    .iter()
                    .find(|(keyword, _)| lower.contains(keyword))
                    .map(|(_, vector)| vector.to_vec())
                    .unwrap_or_else(|| vec![0.3, 0.3, 0.3, 0.1])
            })
            .collect())
    }

    fn model(&self) -> &str {
        "keywords"
    }
}

/// Generator driven by a closure over the prompt.
pub struct FnGenerator<F>(F);

impl<F> FnGenerator<F>
where
    F: Fn(&str) -> Result<Vec<String>, GenerationError> + Send + Sync,
{
    pub fn new(f: F) -> Self {
        Self(f)
    }
}

impl<F> GenerationProvider for FnGenerator<F>
where
    F: Fn(&str) -> Result<Vec<String>, GenerationError> + Send + Sync,
{
    fn generate(
        &self,
        prompt: &str,
        _sampling: &SamplingConfig,
    ) -> Result<Vec<String>, GenerationError> {
        (self.0)(prompt)
    }
}

/// Wraps another source and counts opens.
pub struct CountingSource<S> {
    pub inner: S,
    pub opens: Arc<AtomicUsize>,
    pub delay: std::time::Duration,
}

impl<S: IndexSource> IndexSource for CountingSource<S> {
    fn open(&self, corpus: &str) -> Result<AnnIndex, IndexLoadError> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        std::thread::sleep(self.delay);
        self.inner.open(corpus)
    }
}

pub fn talks_corpus() -> Corpus {
    let rows = [
        ("A talk about focus", "Focus"),
        ("A talk about teams", "Teams"),
        ("Fixing supply chains", "Supply"),
        ("Remote work in practice", "Remote"),
        ("What leaders do differently", "Leadership"),
    ];
    corpus_from("talks", &rows)
}

pub fn corpus_from(name: &str, rows: &[(&str, &str)]) -> Corpus {
    let items = rows
        .iter()
        .enumerate()
        .map(|(i, (text, title))| {
            CorpusItem::new(
                i as u32,
                *text,
                *title,
                format!("https://example.com/{}", title.to_lowercase()),
            )
        })
        .collect();
    Corpus::new(name, items).unwrap()
}

pub fn dimension() -> VectorDimension {
    VectorDimension::new(DIM).unwrap()
}

pub fn params() -> ForestParams {
    ForestParams {
        n_trees: 4,
        leaf_size: 2,
        seed: 7,
    }
}

/// Embeds `corpus` with [`KeywordEmbedder`] and writes its index into `dir`.
pub fn write_corpus_index(dir: &Path, corpus: &Corpus) -> PathBuf {
    std::fs::create_dir_all(dir).unwrap();
    let path = dir.join(format!("{}.ann", corpus.name()));
    let vectors = embed_corpus(&KeywordEmbedder::default(), corpus, 8, Truncate::Left, None).unwrap();
    build_index(&vectors, dimension(), params(), &path).unwrap();
    path
}

pub fn embedding_config() -> EmbeddingConfig {
    EmbeddingConfig {
        dimension: DIM,
        ..EmbeddingConfig::default()
    }
}

pub fn generation_config() -> GenerationConfig {
    GenerationConfig {
        concurrency: 4,
        ..GenerationConfig::default()
    }
}

/// A corpus with its index on disk and an engine over it.
pub struct Fixture {
    pub dir: TempDir,
    pub corpus: Corpus,
    pub index_path: PathBuf,
    pub embedder: Arc<KeywordEmbedder>,
    pub opens: Arc<AtomicUsize>,
}

impl Fixture {
    pub fn new(corpus: Corpus) -> Self {
        let dir = TempDir::new().unwrap();
        let index_path = write_corpus_index(dir.path(), &corpus);
        Self {
            dir,
            corpus,
            index_path,
            embedder: Arc::new(KeywordEmbedder::default()),
            opens: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn index_cache(&self) -> IndexCache {
        let source = CorpusIndexSource::new(
            [(self.corpus.name().to_string(), self.index_path.clone())],
            dimension(),
        );
        IndexCache::new(CountingSource {
            inner: source,
            opens: Arc::clone(&self.opens),
            delay: std::time::Duration::ZERO,
        })
    }

    pub fn engine(&self, search: &SearchConfig) -> QueryEngine {
        QueryEngine::new(
            self.embedder.clone(),
            Arc::new(self.index_cache()),
            search,
            &embedding_config(),
        )
    }

    pub fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }
}
