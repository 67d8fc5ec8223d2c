use clap::{Parser, Subcommand};
use ragnote_embed::EmbedModel;
use ragnote_retriever::retrieval::indexing_engine::EngineStats;
use ragnote_retriever::watch::NotesWatcher;
use ragnote_retriever::{NotesDirectorySource, Retriever, RetrieverConfig, SearchHit};
use std::path::{Path, PathBuf};
use std::process;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

/// Index a notes directory and run similarity queries against it.
#[derive(Parser, Debug)]
#[command(name = "ragnote", author, version, about, long_about = None)]
struct Args {
    /// TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Directory holding the .ragnote.db record store
    #[arg(short, long)]
    base_dir: Option<PathBuf>,

    /// Embedding model, overriding the configuration (e.g. all-minilm-l6-v2, mock)
    #[arg(short, long)]
    model: Option<EmbedModel>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Index every page under a notes directory
    Index {
        /// Notes directory
        dir: PathBuf,
        /// Maximum number of blocks to send (defaults to source.max_documents_per_run)
        #[arg(long)]
        max: Option<usize>,
    },
    /// Find the blocks most similar to a query
    Query {
        /// Query text
        text: String,
        /// Number of results
        #[arg(short, default_value_t = 5)]
        k: usize,
        /// Output format
        #[arg(short, long, default_value = "summary")]
        format: OutputFormat,
    },
    /// Keep the index in step with a notes directory until interrupted
    Watch {
        /// Notes directory
        dir: PathBuf,
        /// Seconds to wait for a burst of file events to settle
        #[arg(long, default_value_t = 2)]
        debounce_secs: u64,
    },
    /// Show index statistics
    Stats {
        /// Output format
        #[arg(short, long, default_value = "summary")]
        format: OutputFormat,
    },
}

#[derive(Debug, Clone, PartialEq)]
enum OutputFormat {
    Summary,
    Full,
    Json,
}

impl std::str::FromStr for OutputFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "summary" => Ok(OutputFormat::Summary),
            "full" => Ok(OutputFormat::Full),
            "json" => Ok(OutputFormat::Json),
            _ => Err(format!("Invalid format: {s}")),
        }
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    if let Err(e) = run().await {
        eprintln!("Error: {e:#}");
        process::exit(1);
    }
}

async fn run() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => RetrieverConfig::load(path)?,
        None => RetrieverConfig::default(),
    };
    if let Some(model) = args.model {
        config.embedding.model = model;
    }

    match args.command {
        Commands::Index { dir, max } => {
            let dir = notes_dir(&dir)?;
            let config = with_store_dir(config, args.base_dir, Some(&dir));
            let max = max.unwrap_or(config.source.max_documents_per_run);
            let source = NotesDirectorySource::new(&dir, config.source.extensions.clone());

            let retriever = Retriever::initialize(config).await?;
            let sent = retriever.index_all(&source, max).await?;
            let stats = retriever.flush().await?;
            retriever.shutdown().await;

            println!("Sent {} blocks from {}", sent, dir.display());
            print_stats(&stats, &OutputFormat::Summary)?;
            Ok(())
        }
        Commands::Query { text, k, format } => {
            let config = with_store_dir(config, args.base_dir, None);
            let retriever = Retriever::initialize(config).await?;
            // Wait for stored records to finish loading
            retriever.flush().await?;
            let hits = retriever.query(&text, k).await;
            retriever.shutdown().await;

            print_hits(&hits?, &format)
        }
        Commands::Watch { dir, debounce_secs } => {
            let dir = notes_dir(&dir)?;
            let config = with_store_dir(config, args.base_dir, Some(&dir));
            let max = config.source.max_documents_per_run;
            let source = NotesDirectorySource::new(&dir, config.source.extensions.clone());

            let retriever = Arc::new(Retriever::initialize(config).await?);
            let watcher = NotesWatcher::start(
                source,
                retriever.clone(),
                Duration::from_secs(debounce_secs),
                max,
            )
            .await?;

            println!("Watching {} (Ctrl-C to stop)", dir.display());
            tokio::signal::ctrl_c().await?;
            watcher.stop().await;

            if let Ok(retriever) = Arc::try_unwrap(retriever) {
                if let Some(stats) = retriever.shutdown().await {
                    print_stats(&stats, &OutputFormat::Summary)?;
                }
            }
            Ok(())
        }
        Commands::Stats { format } => {
            let config = with_store_dir(config, args.base_dir, None);
            let retriever = Retriever::initialize(config).await?;
            let stats = retriever.flush().await?;
            retriever.shutdown().await;

            print_stats(&stats, &format)
        }
    }
}

/// Canonical notes directory, so paths reported by the file watcher line up.
fn notes_dir(dir: &Path) -> anyhow::Result<PathBuf> {
    if !dir.is_dir() {
        anyhow::bail!("{} is not a directory", dir.display());
    }
    Ok(std::fs::canonicalize(dir)?)
}

/// `--base-dir` wins, then the config file, then the notes directory itself.
fn with_store_dir(
    config: RetrieverConfig,
    base_dir: Option<PathBuf>,
    notes_dir: Option<&Path>,
) -> RetrieverConfig {
    if let Some(base_dir) = base_dir {
        return config.with_base_dir(base_dir);
    }
    if config.storage.base_dir.is_some() || !config.storage.enabled {
        return config;
    }
    match notes_dir {
        Some(dir) => config.with_base_dir(dir),
        None => config,
    }
}

fn print_hits(hits: &[SearchHit], format: &OutputFormat) -> anyhow::Result<()> {
    match format {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(hits)?);
        }
        OutputFormat::Summary => {
            println!("Found {} similar blocks:", hits.len());
            for hit in hits {
                let first_line = hit.content.lines().next().unwrap_or("");
                let preview: String = first_line.chars().take(80).collect();
                println!("  {:.3}  {}  {}", hit.score, hit.id, preview);
            }
        }
        OutputFormat::Full => {
            for hit in hits {
                println!("Similarity: {:.3}", hit.score);
                println!("Block: {}", hit.id);
                println!("Content:\n{}", hit.content);
                println!("---");
            }
        }
    }
    Ok(())
}

fn print_stats(stats: &EngineStats, format: &OutputFormat) -> anyhow::Result<()> {
    if *format == OutputFormat::Json {
        println!("{}", serde_json::to_string_pretty(stats)?);
        return Ok(());
    }

    println!("Index:");
    println!("  Entries: {} / {}", stats.index_len, stats.index_capacity);
    println!("  Stored records: {}", stats.stored_records);
    println!("  Persistent: {}", stats.persistent);
    if let Some(updated) = stats.last_updated {
        println!("  Last updated: {}", updated.format("%Y-%m-%d %H:%M:%S UTC"));
    }
    println!("  Queued: {}", stats.queue_len);
    if let Some(error) = &stats.fatal_error {
        println!("  Fatal error: {error}");
    }
    if *format == OutputFormat::Full {
        let processing = &stats.processing;
        println!("Processing:");
        println!("  Embedded: {}", processing.documents_embedded);
        println!("  Unchanged skipped: {}", processing.duplicates_skipped);
        println!("  Empty filtered: {}", processing.documents_filtered);
        println!("  Failed batches: {}", processing.batches_failed);
        println!("  Replayed: {}", processing.records_replayed);
        println!("  Unreadable records: {}", processing.records_unreadable);
        println!("  Deleted: {}", processing.deletions);
    }
    Ok(())
}
