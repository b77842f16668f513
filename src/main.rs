//! # kb CLI
//!
//! The `kb` binary drives a single knowledge base: ingest files and
//! directories, remove or list them, search, inspect statistics and repair
//! the registry.
//!
//! ## Usage
//!
//! ```bash
//! kb --config ./config/kb.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `kb add <files>...` | Ingest files (batch when more than one) |
//! | `kb add-dir <dir>` | Ingest every matching file under a directory |
//! | `kb remove <name>` | Drop a file's chunks |
//! | `kb clear` | Remove everything from the knowledge base |
//! | `kb list` | List indexed files |
//! | `kb search "<query>"` | Retrieve the most relevant chunks |
//! | `kb stats` | Show counts, formats, languages and embedding setup |
//! | `kb repair` | Rebuild the file registry from chunk metadata |
//!
//! Logging goes to stderr and is controlled by `RUST_LOG`
//! (default `kb_rag=info`).

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

use kb_rag::config::{self, Config};
use kb_rag::handler::{CancelFlag, IngestOutcome, IngestStatus, RagHandler};
use kb_rag::models::RetrievedChunk;
use kb_rag::progress::{ProgressMode, ProgressReporter};
use kb_rag::search::SearchOptions;
use kb_rag::stats;

const DEFAULT_CONFIG_PATH: &str = "./config/kb.toml";

/// kb: a local knowledge base with hybrid semantic and keyword retrieval.
///
/// Configuration is read from `--config` (TOML). Without the flag,
/// `./config/kb.toml` is used when present, otherwise built-in defaults.
#[derive(Parser)]
#[command(name = "kb", version, about = "Local knowledge base with hybrid retrieval")]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Knowledge-base directory; overrides `[knowledge_base].path`.
    #[arg(long, global = true)]
    kb_path: Option<PathBuf>,

    /// Progress output on stderr. Defaults to `human` on a terminal, `off` otherwise.
    #[arg(long, global = true, value_enum)]
    progress: Option<ProgressMode>,

    /// Tighten retrieval (fewer results, higher importance floor, no expansion).
    #[arg(long, global = true)]
    safe_mode: bool,

    /// Index with zero vectors; only lexical scoring remains meaningful.
    #[arg(long, global = true)]
    ultra_safe_mode: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Ingest one or more files.
    ///
    /// Unchanged files (same content hash) are skipped. A changed file
    /// replaces its previous chunks.
    Add {
        #[arg(required = true)]
        files: Vec<PathBuf>,
    },

    /// Ingest every file under a directory matching the ingestion globs.
    AddDir { dir: PathBuf },

    /// Remove a file's chunks by file name.
    Remove { file_name: String },

    /// Remove every file, chunk and vector. The embeddings cache is kept.
    Clear {
        /// Skip the confirmation check.
        #[arg(long)]
        yes: bool,
    },

    /// List indexed files.
    List {
        /// Print registry entries as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Retrieve the chunks most relevant to a query.
    Search {
        query: String,

        /// Number of results.
        #[arg(short = 'n', long)]
        n_results: Option<usize>,

        /// Semantic weight in hybrid scoring (0.0 to 1.0).
        #[arg(long)]
        alpha: Option<f32>,

        /// Disable lexical re-scoring.
        #[arg(long)]
        no_rerank: bool,

        /// Disable query expansion.
        #[arg(long)]
        no_expand: bool,

        /// Run the cross-encoder stage.
        #[arg(long)]
        cross_encoder: bool,

        /// Drop chunks below this importance score.
        #[arg(long)]
        min_importance: Option<f32>,

        /// Only return chunks in this language (ISO 639-1).
        #[arg(long)]
        language: Option<String>,

        #[arg(long)]
        json: bool,
    },

    /// Show knowledge-base statistics.
    Stats {
        #[arg(long)]
        json: bool,
    },

    /// Reconcile the file registry with the indexed chunks.
    Repair,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("kb_rag=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let mut cfg = resolve_config(cli.config.as_deref())?;
    if let Some(path) = &cli.kb_path {
        cfg.knowledge_base.path = path.clone();
    }
    if cli.safe_mode {
        cfg.retrieval.safe_mode = true;
    }
    if cli.ultra_safe_mode {
        cfg.retrieval.ultra_safe_mode = true;
    }
    let progress = cli.progress.unwrap_or_else(ProgressMode::default_for_tty);

    let handler = Arc::new(RagHandler::open(cfg)?);

    match cli.command {
        Commands::Add { files } => {
            let outcomes = if files.len() == 1 {
                let reporter = progress.reporter();
                vec![handler.add_file(&files[0], Some(reporter.as_ref()))]
            } else {
                let reporter: Arc<dyn ProgressReporter> = Arc::from(progress.reporter());
                runtime()?.block_on(handler.batch_add_files(files, Some(reporter), &cancel_on_ctrl_c()))
            };
            report_outcomes(&outcomes)?;
        }
        Commands::AddDir { dir } => {
            let reporter: Arc<dyn ProgressReporter> = Arc::from(progress.reporter());
            let outcomes = runtime()?.block_on(handler.add_directory(
                &dir,
                Some(reporter),
                &cancel_on_ctrl_c(),
            ))?;
            if outcomes.is_empty() {
                println!("No matching files under {}", dir.display());
            }
            report_outcomes(&outcomes)?;
        }
        Commands::Remove { file_name } => {
            if !handler.remove_file(&file_name) {
                bail!("'{}' is not in the knowledge base", file_name);
            }
            println!("Removed {}", file_name);
        }
        Commands::Clear { yes } => {
            if !yes {
                bail!("refusing to clear {} without --yes", handler.knowledge_base_path().display());
            }
            if !handler.clear_knowledge_base() {
                bail!("failed to clear knowledge base");
            }
            println!("Knowledge base cleared.");
        }
        Commands::List { json } => {
            let files = handler.get_indexed_files_detailed();
            if json {
                println!("{}", serde_json::to_string_pretty(&files)?);
            } else if files.is_empty() {
                println!("No files indexed.");
            } else {
                for f in &files {
                    println!(
                        "{:<40} {:>5} chunks  v{}  {}",
                        f.file_name,
                        f.entry.chunk_count,
                        f.entry.version_count,
                        f.entry.indexed_at.format("%Y-%m-%d %H:%M")
                    );
                }
            }
        }
        Commands::Search {
            query,
            n_results,
            alpha,
            no_rerank,
            no_expand,
            cross_encoder,
            min_importance,
            language,
            json,
        } => {
            let mut opts = SearchOptions::from_config(&handler.config().retrieval);
            if let Some(n) = n_results {
                opts.n_results = n.max(1);
            }
            if let Some(a) = alpha {
                if !(0.0..=1.0).contains(&a) {
                    bail!("--alpha must be between 0.0 and 1.0");
                }
                opts.alpha = a;
            }
            opts.reranking &= !no_rerank;
            opts.query_expansion &= !no_expand;
            opts.cross_encoder_reranking |= cross_encoder;
            if min_importance.is_some() {
                opts.filter.min_importance = min_importance;
            }
            if language.is_some() {
                opts.filter.language = language;
            }
            let results = handler.get_relevant_chunks(&query, &opts);
            if json {
                println!("{}", serde_json::to_string_pretty(&results)?);
            } else {
                print_results(&results);
            }
        }
        Commands::Stats { json } => {
            let s = handler.get_stats();
            if json {
                println!("{}", serde_json::to_string_pretty(&s)?);
            } else {
                print!("{}", stats::render(&s));
            }
        }
        Commands::Repair => {
            let report = handler.repair_registry();
            if report.is_clean() {
                println!("Registry is consistent.");
            } else {
                for (label, names) in [
                    ("added", &report.added),
                    ("removed", &report.removed),
                    ("corrected", &report.corrected),
                ] {
                    for name in names {
                        println!("{:<10} {}", label, name);
                    }
                }
            }
        }
    }

    Ok(())
}

fn resolve_config(explicit: Option<&Path>) -> Result<Config> {
    match explicit {
        Some(path) => config::load_config(path),
        None => {
            let default = Path::new(DEFAULT_CONFIG_PATH);
            if default.exists() {
                config::load_config(default)
            } else {
                Ok(Config::default())
            }
        }
    }
}

fn runtime() -> Result<tokio::runtime::Runtime> {
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("starting async runtime")
}

/// A flag that flips on the first Ctrl-C. Files already being ingested finish.
fn cancel_on_ctrl_c() -> CancelFlag {
    let flag = CancelFlag::new();
    let handle = flag.clone();
    std::thread::spawn(move || {
        let Ok(rt) = tokio::runtime::Builder::new_current_thread().enable_all().build() else {
            return;
        };
        if rt.block_on(tokio::signal::ctrl_c()).is_ok() {
            eprintln!("Cancelling after in-flight files...");
            handle.cancel();
        }
    });
    flag
}

fn report_outcomes(outcomes: &[IngestOutcome]) -> Result<()> {
    let mut failed = 0;
    for o in outcomes {
        match &o.status {
            IngestStatus::Indexed { chunks, replaced } if *replaced > 0 => {
                println!("updated   {} ({} chunks, replaced {})", o.file_name, chunks, replaced)
            }
            IngestStatus::Indexed { chunks, .. } => {
                println!("added     {} ({} chunks)", o.file_name, chunks)
            }
            IngestStatus::Unchanged => println!("unchanged {}", o.file_name),
            IngestStatus::Cancelled => println!("cancelled {}", o.file_name),
            IngestStatus::Failed { reason } => {
                failed += 1;
                println!("failed    {}: {}", o.path.display(), reason)
            }
        }
    }
    if failed > 0 {
        bail!("{} of {} files failed", failed, outcomes.len());
    }
    Ok(())
}

fn print_results(results: &[RetrievedChunk]) {
    if results.is_empty() {
        println!("No results.");
        return;
    }
    for (i, r) in results.iter().enumerate() {
        let m = &r.metadata;
        let mut location = m.file_name.clone();
        if let Some(page) = m.page {
            location.push_str(&format!(" p.{}", page));
        }
        if let Some(sheet) = &m.sheet_name {
            location.push_str(&format!(" [{}]", sheet));
        }
        if let Some(row) = m.row_index {
            location.push_str(&format!(" row {}", row));
        }
        println!("{}. [{:.3}] {}", i + 1, r.score, location);
        if let Some(title) = &m.section_title {
            println!("   § {}", title);
        }
        let snippet: String = r.content.chars().take(240).collect();
        let ellipsis = if r.content.chars().count() > 240 { "..." } else { "" };
        println!("   {}{}", snippet.replace('\n', " "), ellipsis);
        println!();
    }
}
