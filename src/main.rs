//! # docsift CLI
//!
//! ## Usage
//!
//! ```bash
//! docsift --config ./config/docsift.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `docsift init` | Create the schema and the collection, check the dimension |
//! | `docsift ingest [all\|documents\|code]` | Run the ingestion pipelines |
//! | `docsift search "<query>"` | Semantic search |
//! | `docsift get <path>` | Stored chunks and rebuilt text of one source |
//! | `docsift stats` | Collection statistics |
//! | `docsift serve` | HTTP endpoint for tool hosts |
//!
//! Exit codes: `0` on success (an ingest run with per-source failures still
//! succeeds), `2` for configuration errors, `1` for anything else.

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

use docsift::config::{self, Config};
use docsift::embedding::create_embedder;
use docsift::error::ConfigError;
use docsift::ingest::{self, IngestOptions, IngestScope};
use docsift::models::SourceKind;
use docsift::progress::ProgressMode;
use docsift::search::{self, SearchArgs};
use docsift::store::{CollectionStore, SqliteStore};
use docsift::{get, server, stats};

/// docsift: semantic search over your documents and code.
///
/// All commands read a TOML configuration file given with `--config`.
#[derive(Parser)]
#[command(name = "docsift", version, about)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/docsift.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the database schema and the collection.
    ///
    /// Idempotent. Fails if the collection exists with another dimension or model.
    Init,

    /// Ingest the documents root and/or the code repositories.
    ///
    /// Unchanged files are skipped by content fingerprint, so repeated runs
    /// only embed what changed.
    Ingest {
        /// `all`, `documents`, or `code`.
        #[arg(default_value = "all")]
        scope: IngestScope,

        /// Check fingerprints and count chunks without embedding or writing.
        #[arg(long)]
        dry_run: bool,

        /// Delete records of files that no longer exist.
        #[arg(long)]
        prune: bool,

        /// Progress on stderr: `human`, `json`, or `off`.
        /// Defaults to human when stderr is a terminal.
        #[arg(long)]
        progress: Option<ProgressMode>,
    },

    /// Semantic search over the collection.
    Search {
        query: String,

        /// Number of results (defaults to `[retrieval] default_k`).
        #[arg(long)]
        k: Option<usize>,

        /// Restrict to `document` or `code`.
        #[arg(long)]
        kind: Option<SourceKind>,

        /// Restrict to source paths starting with this prefix.
        #[arg(long)]
        path_prefix: Option<String>,

        /// Print results as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Show the stored chunks of one source path.
    Get {
        path: String,

        /// Print as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Show collection statistics.
    Stats,

    /// Serve `POST /tools/search` over HTTP.
    Serve,
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("docsift=info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

async fn run_init(cfg: &Config) -> anyhow::Result<()> {
    let store = SqliteStore::open(&cfg.db).await?;
    let embedder = create_embedder(&cfg.embedding)?;
    let info = store
        .ensure_collection(&cfg.collection.name, embedder.dims(), embedder.model_name())
        .await?;
    store.pool().close().await;
    println!(
        "Collection '{}' ready ({} dims, model {}, {} records).",
        info.name, info.dims, info.model, info.records
    );
    Ok(())
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Init => run_init(&cfg).await?,
        Commands::Ingest {
            scope,
            dry_run,
            prune,
            progress,
        } => {
            let opts = IngestOptions {
                scope,
                dry_run,
                prune,
                progress: progress.unwrap_or_else(ProgressMode::default_for_tty),
            };
            ingest::run_ingest(&cfg, opts).await?;
        }
        Commands::Search {
            query,
            k,
            kind,
            path_prefix,
            json,
        } => {
            let args = SearchArgs {
                query,
                k,
                kind,
                path_prefix,
                json,
            };
            search::run_search(&cfg, args).await?;
        }
        Commands::Get { path, json } => get::run_get(&cfg, &path, json).await?,
        Commands::Stats => stats::run_stats(&cfg).await?,
        Commands::Serve => server::run_server(&cfg).await?,
    }
    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    init_tracing();
    let cli = Cli::parse();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("Error: {:#}", err);
            if err.chain().any(|e| e.is::<ConfigError>()) {
                ExitCode::from(2)
            } else {
                ExitCode::FAILURE
            }
        }
    }
}
