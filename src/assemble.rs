//! Joins ranked ids with corpus rows and optional explanations.
//!
//! Per-record failures never abort assembly: a missing row drops that record,
//! a failed explanation is replaced by a placeholder. Both are logged and
//! reported in [`Assembled::issues`].

use std::sync::Arc;

use rayon::prelude::*;
use rayon::{ThreadPool, ThreadPoolBuilder};
use serde::Serialize;
use tracing::{debug, warn};

use crate::config::GenerationConfig;
use crate::corpus::Corpus;
use crate::error::{GenerationError, MetadataLookupError, SetupError};
use crate::provider::{GenerationProvider, SamplingConfig};
use crate::vector::{ItemId, Neighbor};

/// A fully assembled search result.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResultRecord {
    pub id: ItemId,
    pub distance: f32,
    pub text: String,
    pub title: String,
    pub url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub explanation: Option<String>,
}

/// A contained per-record failure.
#[derive(Debug, Clone, PartialEq)]
pub enum RecordIssue {
    /// The ranked id had no corpus row; the record was skipped
    MissingMetadata {
        rank: usize,
        error: MetadataLookupError,
    },
    /// The explanation failed; the placeholder was used
    ExplanationFailed {
        rank: usize,
        id: ItemId,
        error: GenerationError,
    },
}

impl std::fmt::Display for RecordIssue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::MissingMetadata { rank, error } => write!(f, "rank {rank}: {error}"),
            Self::ExplanationFailed { rank, id, error } => {
                write!(f, "rank {rank} (item {id}): {error}")
            }
        }
    }
}

/// Records in rank order plus whatever went wrong along the way.
#[derive(Debug, Clone, Default)]
pub struct Assembled {
    pub records: Vec<ResultRecord>,
    pub issues: Vec<RecordIssue>,
}

/// Builds the prompt asking why `passage` answers `query`.
pub fn explanation_prompt(query: &str, passage: &str) -> String {
    format!(
        "A listener is interested in: \"{query}\"\n\
         Podcast excerpt: \"{passage}\"\n\
         In one sentence, explain why this episode is relevant to the listener's interest.\n\
         Explanation:"
    )
}

/// Turns ranked neighbours into displayable records.
pub struct ResultAssembler {
    generator: Option<Arc<dyn GenerationProvider>>,
    sampling: SamplingConfig,
    placeholder: String,
    pool: ThreadPool,
}

impl std::fmt::Debug for ResultAssembler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResultAssembler")
            .field("generation", &self.generator.is_some())
            .field("placeholder", &self.placeholder)
            .field("threads", &self.pool.current_num_threads())
            .finish_non_exhaustive()
    }
}

impl ResultAssembler {
    pub fn new(
        generator: Arc<dyn GenerationProvider>,
        config: &GenerationConfig,
    ) -> Result<Self, SetupError> {
        Self::build(Some(generator), config)
    }

    /// An assembler that cannot explain; explanation requests get the
    /// placeholder.
    pub fn without_generation(config: &GenerationConfig) -> Result<Self, SetupError> {
        Self::build(None, config)
    }

    fn build(
        generator: Option<Arc<dyn GenerationProvider>>,
        config: &GenerationConfig,
    ) -> Result<Self, SetupError> {
        let pool = ThreadPoolBuilder::new()
            .num_threads(config.concurrency.max(1))
            .thread_name(|i| format!("explain-{i}"))
            .build()?;

        Ok(Self {
            generator,
            sampling: config.sampling(),
            placeholder: config.placeholder.clone(),
            pool,
        })
    }

    pub fn placeholder(&self) -> &str {
        &self.placeholder
    }

    /// Assembles records in the exact order of `ranked`.
    pub fn assemble(
        &self,
        ranked: &[Neighbor],
        corpus: &Corpus,
        explain: bool,
        query: &str,
    ) -> Assembled {
        let mut assembled = Assembled::default();
        let mut ranks = Vec::with_capacity(ranked.len());

        for (rank, hit) in ranked.iter().enumerate() {
            match corpus.get(hit.id) {
                Ok(item) => {
                    ranks.push(rank);
                    assembled.records.push(ResultRecord {
                        id: hit.id,
                        distance: hit.distance,
                        text: item.text.clone(),
                        title: item.title.clone(),
                        url: item.url.clone(),
                        explanation: None,
                    });
                }
                Err(error) => {
                    warn!("Skipping result at rank {rank}: {error}");
                    assembled
                        .issues
                        .push(RecordIssue::MissingMetadata { rank, error });
                }
            }
        }

        if explain && !assembled.records.is_empty() {
            self.attach_explanations(&mut assembled, &ranks, query);
        }

        assembled
    }

    fn attach_explanations(&self, assembled: &mut Assembled, ranks: &[usize], query: &str) {
        debug!(
            "Generating {} explanations on {} threads",
            assembled.records.len(),
            self.pool.current_num_threads()
        );

        // par_iter().collect() keeps input order regardless of completion order
        let outcomes: Vec<Result<String, GenerationError>> = self.pool.install(|| {
            assembled
                .records
                .par_iter()
                .map(|record| self.explain(query, &record.text))
                .collect()
        });

        for ((record, outcome), &rank) in assembled.records.iter_mut().zip(outcomes).zip(ranks) {
            match outcome {
                Ok(text) => record.explanation = Some(text),
                Err(error) => {
                    warn!("Explanation for item {} failed: {error}", record.id);
                    record.explanation = Some(self.placeholder.clone());
                    assembled.issues.push(RecordIssue::ExplanationFailed {
                        rank,
                        id: record.id,
                        error,
                    });
                }
            }
        }
    }

    fn explain(&self, query: &str, passage: &str) -> Result<String, GenerationError> {
        let generator = self.generator.as_ref().ok_or(GenerationError::Unavailable)?;
        let prompt = explanation_prompt(query, passage);

        let text = generator
            .generate(&prompt, &self.sampling)?
            .into_iter()
            .next()
            .map(|text| text.trim().to_string())
            .unwrap_or_default();

        if text.is_empty() {
            return Err(GenerationError::Empty);
        }
        Ok(text)
    }
}
