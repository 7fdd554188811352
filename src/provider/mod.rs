//! Remote model collaborators.
//!
//! The search pipeline only talks to the traits defined here, so the Cohere
//! client can be swapped for in-process fakes in tests.

mod cohere;

pub use cohere::CohereClient;

use serde::{Deserialize, Serialize};

use crate::error::{EmbeddingError, GenerationError};

/// What the provider should do with texts longer than the model accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Truncate {
    /// Reject over-long input
    None,
    /// Drop the start, keep the end
    #[default]
    Left,
    /// Drop the end, keep the start
    Right,
}

/// Turns texts into fixed-length vectors.
pub trait EmbeddingProvider: Send + Sync {
    /// Embeds `texts`, returning one vector per text in input order.
    fn embed(&self, texts: &[&str], truncate: Truncate) -> Result<Vec<Vec<f32>>, EmbeddingError>;

    /// Model identifier, for logs and index metadata.
    fn model(&self) -> &str;
}

/// Sampling parameters for one generation request.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SamplingConfig {
    pub max_tokens: u32,
    pub temperature: f32,
    pub p: f32,
    pub k: u32,
    pub frequency_penalty: f32,
    pub presence_penalty: f32,
    pub stop_sequences: Vec<String>,
}

/// Continues a prompt.
pub trait GenerationProvider: Send + Sync {
    /// Returns the generated continuations; callers use the first.
    fn generate(
        &self,
        prompt: &str,
        sampling: &SamplingConfig,
    ) -> Result<Vec<String>, GenerationError>;
}
