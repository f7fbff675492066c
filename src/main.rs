//! # evidence-index CLI (`evi`)
//!
//! The `evi` binary drives the incremental indexing pipeline. It provides
//! commands for project initialization, indexing chunk records into the
//! vector store, semantic search, and store statistics.
//!
//! ## Usage
//!
//! ```bash
//! evi --config ./evidence.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `evi init` | Create directories, a default config, and the store schema |
//! | `evi index` | Embed new/changed chunks and update the vector store |
//! | `evi search "<query>"` | Cosine-ranked semantic search over the store |
//! | `evi stats` | Store overview: counts, latest build, last run status |

use clap::{Parser, Subcommand};
use std::path::PathBuf;

use evidence_index::config::{self, Config};
use evidence_index::db;
use evidence_index::indexer;
use evidence_index::migrate;
use evidence_index::report::ProgressMode;
use evidence_index::search;
use evidence_index::stats;

/// evidence-index — incremental embedding and vector indexing for
/// evidence-backed retrieval.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file; `evi init` writes a commented default.
#[derive(Parser)]
#[command(
    name = "evi",
    about = "evidence-index — incremental embedding and vector indexing for evidence-backed retrieval",
    version,
    long_about = "evidence-index embeds only new or changed chunk records through a remote, \
    rate-limited embedding provider and keeps a SQLite vector store in sync with the current \
    input set, with checkpointed batch writes, adaptive concurrency, and a durable failure ledger."
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./evidence.toml")]
    config: PathBuf,

    /// Progress output on stderr: auto, off, human, or json.
    #[arg(long, global = true, default_value = "auto")]
    progress: String,

    #[command(subcommand)]
    command: Commands,
}

/// Top-level CLI commands.
#[derive(Subcommand)]
enum Commands {
    /// Initialize the project layout and store schema.
    ///
    /// Creates the meta/ and chunks/ directories, writes a default config
    /// file if none exists, and creates the SQLite schema. Idempotent.
    Init,

    /// Embed new or changed chunks and update the vector store.
    ///
    /// Reads chunk records from `chunks/chunks.jsonl`, reuses vectors whose
    /// content hash is already stored, embeds the rest through the
    /// configured provider, and rewrites the store to mirror the input set.
    /// Chunks that fail after all retries are recorded in the failure
    /// ledger; the run still succeeds.
    Index {
        /// Ignore prior store state — recompute every chunk.
        #[arg(long)]
        full: bool,

        /// Show reuse/recompute counts without calling the provider.
        #[arg(long)]
        dry_run: bool,

        /// Maximum number of chunk records to process.
        #[arg(long)]
        limit: Option<usize>,
    },

    /// Search the vector store.
    ///
    /// Embeds the query and returns cosine-ranked rows. Only citable rows
    /// are returned unless `--all` is given.
    Search {
        /// The search query string.
        query: String,

        /// Maximum number of results.
        #[arg(long)]
        limit: Option<usize>,

        /// Include non-citable rows in the results.
        #[arg(long)]
        all: bool,
    },

    /// Show store statistics and the last run status.
    Stats,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let progress_mode = match cli.progress.as_str() {
        "off" => ProgressMode::Off,
        "human" => ProgressMode::Human,
        "json" => ProgressMode::Json,
        _ => ProgressMode::default_for_tty(),
    };

    let result = match &cli.command {
        Commands::Init => run_init(&cli.config).await,
        Commands::Index {
            full,
            dry_run,
            limit,
        } => match config::load_config(&cli.config) {
            Ok(cfg) => {
                let reporter = progress_mode.reporter();
                indexer::run_index(&cfg, reporter.as_ref(), *full, *dry_run, *limit).await
            }
            Err(e) => Err(e),
        },
        Commands::Search { query, limit, all } => match config::load_config(&cli.config) {
            Ok(cfg) => search::run_search(&cfg, query, *limit, *all).await,
            Err(e) => Err(e),
        },
        Commands::Stats => match config::load_config(&cli.config) {
            Ok(cfg) => stats::run_stats(&cfg).await,
            Err(e) => Err(e),
        },
    };

    if let Err(e) = result {
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }
}

/// Create the project layout, default config, and store schema.
async fn run_init(config_path: &PathBuf) -> anyhow::Result<()> {
    if config_path.exists() {
        println!("config exists: {}", config_path.display());
    } else {
        std::fs::write(config_path, config::default_config_toml())?;
        println!("wrote default config: {}", config_path.display());
    }

    let cfg: Config = config::load_config(config_path)?;

    for dir in [&cfg.paths.meta, &cfg.paths.chunks, &cfg.paths.builds_dir()] {
        std::fs::create_dir_all(dir)?;
    }

    let pool = db::connect(&cfg.db.path).await?;
    migrate::run_migrations(&pool).await?;
    pool.close().await;

    println!("initialized");
    Ok(())
}
