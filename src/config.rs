//! Configuration module for the recommender.
//!
//! This module provides a layered configuration system that supports:
//! - Default values
//! - TOML configuration file
//! - Environment variable overrides
//! - CLI argument overrides
//!
//! # Environment Variables
//!
//! Environment variables must be prefixed with `INSIGHTER_` and use double
//! underscores to separate nested levels:
//! - `INSIGHTER_SEARCH__DEFAULT_K=10` sets `search.default_k`
//! - `INSIGHTER_GENERATION__TEMPERATURE=0.2` sets `generation.temperature`
//! - `INSIGHTER_DEFAULT_CORPUS=mckinsey` sets `default_corpus`

use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crate::provider::{SamplingConfig, Truncate};
use crate::vector::{
    DEFAULT_EMBEDDING_DIMENSION, DEFAULT_LEAF_SIZE, DEFAULT_SEED, DEFAULT_TREE_COUNT,
    ForestParams, VectorDimension, VectorError,
};

/// Directory holding the settings file, searched for in ancestors.
pub const CONFIG_DIR: &str = ".insighter";

/// Settings file name inside [`CONFIG_DIR`].
pub const CONFIG_FILE: &str = "settings.toml";

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct Settings {
    /// Version of the configuration schema
    #[serde(default = "default_version")]
    pub version: u32,

    /// Workspace root directory (where .insighter is located)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub workspace_root: Option<PathBuf>,

    /// Corpus used when a request names none
    #[serde(default = "default_corpus_name")]
    pub default_corpus: String,

    /// Known corpora keyed by identity
    #[serde(default = "default_corpora")]
    pub corpora: HashMap<String, CorpusConfig>,

    /// Query embedding settings
    #[serde(default)]
    pub embedding: EmbeddingConfig,

    /// Explanation generation settings
    #[serde(default)]
    pub generation: GenerationConfig,

    /// Search settings
    #[serde(default)]
    pub search: SearchConfig,

    /// Offline index build settings
    #[serde(default)]
    pub build: BuildConfig,

    /// Cohere API client settings
    #[serde(default)]
    pub cohere: CohereConfig,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct CorpusConfig {
    /// Index file, relative to the workspace root unless absolute
    pub index_path: PathBuf,

    /// Metadata CSV, relative to the workspace root unless absolute
    pub metadata_path: PathBuf,

    /// Display name used in result headers
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,

    /// Link shown next to the label
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub homepage: Option<String>,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct EmbeddingConfig {
    /// Embedding model name passed to the provider
    #[serde(default = "default_embedding_model")]
    pub model: String,

    /// Vector dimension produced by the model
    #[serde(default = "default_dimension")]
    pub dimension: usize,

    /// Truncation policy for over-long query texts
    #[serde(default = "default_truncate")]
    pub truncate: Truncate,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct GenerationConfig {
    #[serde(default = "default_generation_model")]
    pub model: String,

    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,

    #[serde(default = "default_temperature")]
    pub temperature: f32,

    /// Nucleus sampling cutoff
    #[serde(default = "default_top_p")]
    pub p: f32,

    /// Top-k sampling, 0 disables it
    #[serde(default)]
    pub k: u32,

    #[serde(default = "default_frequency_penalty")]
    pub frequency_penalty: f32,

    #[serde(default)]
    pub presence_penalty: f32,

    #[serde(default = "default_stop_sequences")]
    pub stop_sequences: Vec<String>,

    /// Text shown when an explanation could not be generated
    #[serde(default = "default_placeholder")]
    pub placeholder: String,

    /// Maximum concurrent generation calls per request
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct SearchConfig {
    /// Results per query when the caller gives no count
    #[serde(default = "default_k")]
    pub default_k: usize,

    /// Leaf items visited per query, defaults to `k * n_trees`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub search_k: Option<usize>,

    /// Memoize ranked results per (query, corpus, k)
    #[serde(default = "default_false")]
    pub cache_results: bool,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct BuildConfig {
    #[serde(default = "default_n_trees")]
    pub n_trees: usize,

    #[serde(default = "default_leaf_size")]
    pub leaf_size: usize,

    #[serde(default = "default_seed")]
    pub seed: u64,

    /// Texts per embedding request while building
    #[serde(default = "default_embed_batch_size")]
    pub embed_batch_size: usize,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct CohereConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,

    /// Name of the environment variable holding the API key
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,

    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    /// Retries for transient failures (5xx, 429, network errors)
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

// Default value functions
fn default_version() -> u32 {
    1
}
fn default_false() -> bool {
    false
}
fn default_corpus_name() -> String {
    "mckinsey".to_string()
}
fn default_corpora() -> HashMap<String, CorpusConfig> {
    let mut corpora = HashMap::new();
    corpora.insert(
        default_corpus_name(),
        CorpusConfig {
            index_path: PathBuf::from(".insighter/podcasts.ann"),
            metadata_path: PathBuf::from("mckinsey_podcasts_embeds.csv"),
            label: Some("The McKinsey podcast".to_string()),
            homepage: Some(
                "https://www.mckinsey.com/featured-insights/mckinsey-podcast#".to_string(),
            ),
        },
    );
    corpora
}
fn default_embedding_model() -> String {
    "large".to_string()
}
fn default_dimension() -> usize {
    DEFAULT_EMBEDDING_DIMENSION
}
fn default_truncate() -> Truncate {
    Truncate::Left
}
fn default_generation_model() -> String {
    "command".to_string()
}
fn default_max_tokens() -> u32 {
    60
}
fn default_temperature() -> f32 {
    0.6
}
fn default_top_p() -> f32 {
    0.9
}
fn default_frequency_penalty() -> f32 {
    0.3
}
fn default_stop_sequences() -> Vec<String> {
    vec!["--".to_string()]
}
fn default_placeholder() -> String {
    "Explanation unavailable.".to_string()
}
fn default_concurrency() -> usize {
    num_cpus::get().clamp(1, 8)
}
fn default_k() -> usize {
    5
}
fn default_n_trees() -> usize {
    DEFAULT_TREE_COUNT
}
fn default_leaf_size() -> usize {
    DEFAULT_LEAF_SIZE
}
fn default_seed() -> u64 {
    DEFAULT_SEED
}
fn default_embed_batch_size() -> usize {
    96
}
fn default_base_url() -> String {
    "https://api.cohere.ai".to_string()
}
fn default_api_key_env() -> String {
    "COHERE_API_KEY".to_string()
}
fn default_timeout_secs() -> u64 {
    30
}
fn default_max_retries() -> u32 {
    3
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            version: default_version(),
            workspace_root: None,
            default_corpus: default_corpus_name(),
            corpora: default_corpora(),
            embedding: EmbeddingConfig::default(),
            generation: GenerationConfig::default(),
            search: SearchConfig::default(),
            build: BuildConfig::default(),
            cohere: CohereConfig::default(),
        }
    }
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            model: default_embedding_model(),
            dimension: default_dimension(),
            truncate: default_truncate(),
        }
    }
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            model: default_generation_model(),
            max_tokens: default_max_tokens(),
            temperature: default_temperature(),
            p: default_top_p(),
            k: 0,
            frequency_penalty: default_frequency_penalty(),
            presence_penalty: 0.0,
            stop_sequences: default_stop_sequences(),
            placeholder: default_placeholder(),
            concurrency: default_concurrency(),
        }
    }
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            default_k: default_k(),
            search_k: None,
            cache_results: false,
        }
    }
}

impl Default for BuildConfig {
    fn default() -> Self {
        Self {
            n_trees: default_n_trees(),
            leaf_size: default_leaf_size(),
            seed: default_seed(),
            embed_batch_size: default_embed_batch_size(),
        }
    }
}

impl Default for CohereConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            api_key_env: default_api_key_env(),
            timeout_secs: default_timeout_secs(),
            max_retries: default_max_retries(),
        }
    }
}

impl EmbeddingConfig {
    pub fn vector_dimension(&self) -> Result<VectorDimension, VectorError> {
        VectorDimension::new(self.dimension)
    }
}

impl GenerationConfig {
    /// Sampling parameters sent with every explanation request.
    pub fn sampling(&self) -> SamplingConfig {
        SamplingConfig {
            max_tokens: self.max_tokens,
            temperature: self.temperature,
            p: self.p,
            k: self.k,
            frequency_penalty: self.frequency_penalty,
            presence_penalty: self.presence_penalty,
            stop_sequences: self.stop_sequences.clone(),
        }
    }
}

impl BuildConfig {
    pub fn forest_params(&self) -> ForestParams {
        ForestParams {
            n_trees: self.n_trees,
            leaf_size: self.leaf_size,
            seed: self.seed,
        }
    }
}

impl Settings {
    pub fn load() -> Result<Self, Box<figment::Error>> {
        // Try to find the workspace root by looking for .insighter directory
        let config_path = Self::find_workspace_config()
            .unwrap_or_else(|| PathBuf::from(CONFIG_DIR).join(CONFIG_FILE));

        Self::figment(config_path)
            .extract()
            .map_err(Box::new)
            .map(|mut settings: Settings| {
                // If workspace_root is not set in config, detect it
                if settings.workspace_root.is_none() {
                    settings.workspace_root = Self::workspace_root();
                }
                settings
            })
    }

    pub fn load_from(path: impl AsRef<Path>) -> Result<Self, Box<figment::Error>> {
        let path = path.as_ref();
        Self::figment(path)
            .extract()
            .map_err(Box::new)
            .map(|mut settings: Settings| {
                // Relative corpus paths resolve next to the .insighter directory
                if settings.workspace_root.is_none() {
                    let dir = path.parent().filter(|dir| !dir.as_os_str().is_empty());
                    settings.workspace_root = match dir {
                        Some(dir) if dir.ends_with(CONFIG_DIR) => dir.parent(),
                        other => other,
                    }
                    .filter(|root| !root.as_os_str().is_empty())
                    .map(Path::to_path_buf);
                }
                settings
            })
    }

    fn figment(config_path: impl AsRef<Path>) -> Figment {
        Figment::new()
            // Start with defaults
            .merge(Serialized::defaults(Settings::default()))
            // Layer in config file if it exists
            .merge(Toml::file(config_path.as_ref()))
            // Double underscore (__) separates nested levels,
            // single underscore (_) remains as is within field names
            .merge(Env::prefixed("INSIGHTER_").map(|key| {
                key.as_str()
                    .to_lowercase()
                    .replace("__", ".")
                    .into()
            }))
    }

    fn find_workspace_config() -> Option<PathBuf> {
        Self::workspace_root().map(|root| root.join(CONFIG_DIR).join(CONFIG_FILE))
    }

    pub fn workspace_root() -> Option<PathBuf> {
        let current = std::env::current_dir().ok()?;

        for ancestor in current.ancestors() {
            let config_dir = ancestor.join(CONFIG_DIR);
            if config_dir.exists() && config_dir.is_dir() {
                return Some(ancestor.to_path_buf());
            }
        }

        None
    }

    /// Resolves a configured path against the workspace root.
    pub fn resolve_path(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            return path.to_path_buf();
        }
        match &self.workspace_root {
            Some(root) => root.join(path),
            None => path.to_path_buf(),
        }
    }

    /// Looks up a corpus by name.
    pub fn corpus(&self, name: &str) -> Option<&CorpusConfig> {
        self.corpora.get(name)
    }

    /// Corpus names in stable order.
    pub fn corpus_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.corpora.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), Box<dyn std::error::Error>> {
        let parent = path.as_ref().parent().ok_or("Invalid path")?;
        std::fs::create_dir_all(parent)?;

        let toml_string = toml::to_string_pretty(self)?;
        std::fs::write(path, toml_string)?;

        Ok(())
    }

    pub fn init_config_file(force: bool) -> Result<PathBuf, Box<dyn std::error::Error>> {
        let config_path = PathBuf::from(CONFIG_DIR).join(CONFIG_FILE);

        if !force && config_path.exists() {
            return Err("Configuration file already exists. Use --force to overwrite".into());
        }

        // Create parent directory if needed
        if let Some(parent) = config_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let template = format!(
            r#"# Insighter Configuration File

# Version of the configuration schema
version = 1

# Corpus searched when none is given on the command line
default_corpus = "mckinsey"

[corpora.mckinsey]
# Paths are relative to the directory containing .insighter/
index_path = ".insighter/podcasts.ann"
metadata_path = "mckinsey_podcasts_embeds.csv"
label = "The McKinsey podcast"
homepage = "https://www.mckinsey.com/featured-insights/mckinsey-podcast#"

[embedding]
# Cohere embedding model; must match the model used to build the index
model = "large"
dimension = {dimension}

# Over-long queries keep their end: NONE, LEFT or RIGHT
truncate = "LEFT"

[generation]
# Model used for per-result explanations
model = "command"
max_tokens = 60
temperature = 0.6
p = 0.9
k = 0
frequency_penalty = 0.3
presence_penalty = 0.0
stop_sequences = ["--"]

# Shown in place of an explanation that failed to generate
placeholder = "Explanation unavailable."

# Concurrent explanation requests per query (defaults to CPU count, max 8)
# concurrency = {concurrency}

[search]
# Results returned per query
default_k = 5

# Leaf items visited per query (default: k * n_trees). Higher is slower
# but more accurate.
# search_k = 500

# Memoize results per (query, corpus, k) for the life of the process
cache_results = false

[build]
n_trees = {n_trees}
leaf_size = {leaf_size}
seed = {seed}

# Texts per embedding request when building an index
embed_batch_size = 96

[cohere]
base_url = "https://api.cohere.ai"

# Environment variable holding the API key
api_key_env = "COHERE_API_KEY"
timeout_secs = 30
max_retries = 3
"#,
            dimension = DEFAULT_EMBEDDING_DIMENSION,
            concurrency = default_concurrency(),
            n_trees = DEFAULT_TREE_COUNT,
            leaf_size = DEFAULT_LEAF_SIZE,
            seed = DEFAULT_SEED,
        );

        std::fs::write(&config_path, template)?;

        Ok(config_path)
    }
}
