//! CLI entry point for insighter.
//!
//! Provides commands for searching a corpus, building its index, and
//! inspecting configuration.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result, bail};
use clap::{
    Parser, Subcommand,
    builder::styling::{AnsiColor, Effects, Styles},
};
use insighter::config::CONFIG_FILE;
use insighter::display::{CorpusLabel, THEME, create_progress_bar, render_markdown, with_spinner};
use insighter::indexing::{
    BuildOptions, build_corpus_index, build_index_for_corpus, read_vectors_jsonl,
};
use insighter::vector::IndexFile;
use insighter::{
    CohereClient, Corpus, EmbeddingProvider, GenerationProvider, RecommendRequest, Recommender,
    SearchError, Settings,
};
use tracing_subscriber::EnvFilter;

fn clap_cargo_style() -> Styles {
    Styles::styled()
        .header(AnsiColor::Cyan.on_default() | Effects::BOLD)
        .usage(AnsiColor::Cyan.on_default() | Effects::BOLD)
        .literal(AnsiColor::Green.on_default())
        .placeholder(AnsiColor::Green.on_default())
}

/// Semantic podcast recommendations
#[derive(Parser)]
#[command(
    name = "insighter",
    version = env!("CARGO_PKG_VERSION"),
    about = "Semantic recommendations over pre-embedded podcast corpora",
    next_line_help = true,
    styles = clap_cargo_style()
)]
struct Cli {
    /// Path to custom settings.toml file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Log debug output to stderr (overridden by RUST_LOG)
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

/// Available CLI commands
#[derive(Subcommand)]
enum Commands {
    /// Recommend corpus entries for a free-text interest
    #[command(
        after_help = "Examples:\n  insighter search \"leading remote teams\"\n  insighter search \"supply chains\" -k 3 --explain\n  insighter search \"focus\" --json | jq '.records[].title'"
    )]
    Search {
        /// What the listener is interested in
        query: String,

        /// Corpus to search (defaults to default_corpus)
        #[arg(long)]
        corpus: Option<String>,

        /// Number of results (defaults to search.default_k)
        #[arg(short, long)]
        k: Option<usize>,

        /// Generate a one-line explanation per result
        #[arg(long)]
        explain: bool,

        /// Output in JSON format
        #[arg(long)]
        json: bool,
    },

    /// Build the ANN index for a corpus
    #[command(
        after_help = "Examples:\n  insighter build --corpus mckinsey\n  insighter build --corpus mckinsey --vectors embeds.jsonl --trees 50"
    )]
    Build {
        /// Corpus to build
        #[arg(long)]
        corpus: Option<String>,

        /// Build from precomputed vectors instead of calling the embedding API
        #[arg(long)]
        vectors: Option<PathBuf>,

        /// Number of trees (overrides build.n_trees)
        #[arg(long)]
        trees: Option<usize>,

        /// Maximum items per leaf (overrides build.leaf_size)
        #[arg(long)]
        leaf_size: Option<usize>,

        /// Random seed (overrides build.seed)
        #[arg(long)]
        seed: Option<u64>,
    },

    /// Show metadata of a corpus index file
    Info {
        /// Corpus to inspect
        #[arg(long)]
        corpus: Option<String>,
    },

    /// Set up .insighter directory with default configuration
    Init {
        /// Force overwrite existing configuration
        #[arg(short, long)]
        force: bool,
    },

    /// Display active settings
    Config,
}

fn main() {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    if let Err(e) = run(cli) {
        eprintln!("{}", THEME.error_with_icon(&format!("Error: {e:#}")));
        std::process::exit(1);
    }
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "insighter=debug" } else { "warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn run(cli: Cli) -> Result<()> {
    if let Commands::Init { force } = cli.command {
        let path = Settings::init_config_file(force).map_err(|e| anyhow::anyhow!("{e}"))?;
        println!(
            "{}",
            THEME.success_with_icon(&format!("Created configuration file at: {}", path.display()))
        );
        println!("Edit this file to customize your settings.");
        return Ok(());
    }

    let settings = load_settings(cli.config.as_deref())?;

    match cli.command {
        Commands::Search {
            query,
            corpus,
            k,
            explain,
            json,
        } => run_search(&settings, query, corpus, k, explain, json),
        Commands::Build {
            corpus,
            vectors,
            trees,
            leaf_size,
            seed,
        } => {
            let corpus = corpus.unwrap_or_else(|| settings.default_corpus.clone());
            run_build(&settings, &corpus, vectors.as_deref(), trees, leaf_size, seed)
        }
        Commands::Info { corpus } => {
            let corpus = corpus.unwrap_or_else(|| settings.default_corpus.clone());
            run_info(&settings, &corpus)
        }
        Commands::Config => {
            println!("{}", THEME.apply(&THEME.header, "Current Configuration:"));
            println!("{}", "=".repeat(50));
            println!("{}", toml::to_string_pretty(&settings)?);
            Ok(())
        }
        Commands::Init { .. } => unreachable!("handled before settings are loaded"),
    }
}

fn load_settings(path: Option<&Path>) -> Result<Settings> {
    match path {
        Some(path) => Settings::load_from(path).map_err(|e| {
            anyhow::anyhow!("Configuration error loading from {}: {e}", path.display())
        }),
        None => Settings::load().or_else(|e| {
            eprintln!(
                "{}",
                THEME.warning_with_icon(&format!("Configuration error: {e}"))
            );
            eprintln!("Using default configuration. Run 'insighter init' to create {CONFIG_FILE}.");
            Ok(Settings::default())
        }),
    }
}

fn run_search(
    settings: &Settings,
    query: String,
    corpus: Option<String>,
    k: Option<usize>,
    explain: bool,
    json: bool,
) -> Result<()> {
    let corpus_name = corpus.unwrap_or_else(|| settings.default_corpus.clone());

    let client = Arc::new(CohereClient::from_env(settings)?);
    let embedder: Arc<dyn EmbeddingProvider> = client.clone();
    let generator = explain.then(|| client as Arc<dyn GenerationProvider>);
    let recommender =
        Recommender::from_settings(settings, embedder, generator, &[corpus_name.as_str()])?;

    let request = RecommendRequest {
        text: query,
        corpus: Some(corpus_name.clone()),
        k,
        explain,
    };

    let start = Instant::now();
    let outcome = with_spinner("Searching...", || recommender.recommend(&request));
    let recommendations = match outcome {
        Ok(recommendations) => recommendations,
        Err(SearchError::NoResults { .. }) if !json => {
            print!("{}", render_markdown(&[], label_for(settings, &corpus_name)));
            return Ok(());
        }
        Err(e) => {
            report_search_error(&e, json);
            std::process::exit(if e.is_transient() { 75 } else { 1 });
        }
    };
    tracing::debug!("Search completed in {:?}", start.elapsed());

    for issue in &recommendations.issues {
        eprintln!("{}", THEME.warning_with_icon(&issue.to_string()));
    }

    if json {
        println!("{}", serde_json::to_string_pretty(&recommendations)?);
    } else {
        print!(
            "{}",
            render_markdown(&recommendations.records, label_for(settings, &corpus_name))
        );
    }
    Ok(())
}

fn label_for<'a>(settings: &'a Settings, corpus: &'a str) -> CorpusLabel<'a> {
    let config = settings.corpus(corpus);
    CorpusLabel {
        name: config.and_then(|c| c.label.as_deref()).unwrap_or(corpus),
        homepage: config.and_then(|c| c.homepage.as_deref()),
    }
}

fn report_search_error(error: &SearchError, json: bool) {
    if json {
        let body = serde_json::json!({
            "status": error.status_code(),
            "error": error.to_string(),
            "suggestions": error.recovery_suggestions(),
        });
        println!("{body:#}");
        return;
    }

    eprintln!(
        "{}",
        THEME.error_with_icon(&format!("{error} [{}]", error.status_code()))
    );
    for suggestion in error.recovery_suggestions() {
        eprintln!("  {}", THEME.apply(&THEME.dim, suggestion));
    }
}

fn run_build(
    settings: &Settings,
    corpus_name: &str,
    vectors: Option<&Path>,
    trees: Option<usize>,
    leaf_size: Option<usize>,
    seed: Option<u64>,
) -> Result<()> {
    let Some(config) = settings.corpus(corpus_name) else {
        bail!("Unknown corpus '{corpus_name}'. Configured: {:?}", settings.corpus_names());
    };
    let corpus = Corpus::from_csv(corpus_name, settings.resolve_path(&config.metadata_path))?;
    let index_path = settings.resolve_path(&config.index_path);
    if let Some(parent) = index_path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }

    let mut options = BuildOptions::from_settings(settings)?;
    if let Some(trees) = trees {
        options.params.n_trees = trees;
    }
    if let Some(leaf_size) = leaf_size {
        options.params.leaf_size = leaf_size;
    }
    if let Some(seed) = seed {
        options.params.seed = seed;
    }

    let start = Instant::now();
    let report = match vectors {
        Some(vectors_path) => {
            let vectors = read_vectors_jsonl(vectors_path)?;
            with_spinner("Building index...", || {
                build_index_for_corpus(
                    &vectors,
                    &corpus,
                    options.dimension,
                    options.params,
                    &index_path,
                )
            })?
        }
        None => {
            let client = CohereClient::from_env(settings)?;
            let progress = create_progress_bar(corpus.len() as u64, "texts embedded");
            let result =
                build_corpus_index(&client, &corpus, &options, &index_path, Some(&progress));
            progress.finish_and_clear();
            result?
        }
    };

    println!(
        "{}",
        THEME.success_with_icon(&format!(
            "Indexed {} items into {} trees ({} nodes) in {:.1}s",
            report.items,
            report.trees,
            report.nodes,
            start.elapsed().as_secs_f64()
        ))
    );
    println!("  {}", THEME.apply(&THEME.path, report.path.display()));
    Ok(())
}

fn run_info(settings: &Settings, corpus_name: &str) -> Result<()> {
    let Some(config) = settings.corpus(corpus_name) else {
        bail!("Unknown corpus '{corpus_name}'. Configured: {:?}", settings.corpus_names());
    };
    let file = IndexFile::open(&settings.resolve_path(&config.index_path))?;
    let header = file.header();

    println!(
        "{}",
        THEME.apply(&THEME.header, format!("Index for corpus '{corpus_name}'"))
    );
    println!("  Path:        {}", THEME.apply(&THEME.path, file.path().display()));
    let rows = [
        ("Version", header.version.to_string()),
        ("Metric", header.metric.to_string()),
        ("Dimension", header.dimension.to_string()),
        ("Items", header.item_count.to_string()),
        ("Trees", header.tree_count.to_string()),
        ("Nodes", header.node_count.to_string()),
        ("Leaf size", header.leaf_size.to_string()),
        ("File size", format!("{} bytes", file.file_size())),
    ];
    for (name, value) in rows {
        println!(
            "  {:<12} {}",
            format!("{name}:"),
            THEME.apply(&THEME.number, value)
        );
    }
    Ok(())
}
