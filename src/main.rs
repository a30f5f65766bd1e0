//! # Context Memory CLI (`ctxmem`)
//!
//! A thin shell over [`MemoryEngine`] for operating a knowledge base by
//! hand.
//!
//! | Command | Description |
//! |---------|-------------|
//! | `ctxmem init` | Create the knowledge base and run migrations |
//! | `ctxmem ingest <path>` | Index a file, or a directory with `--glob` |
//! | `ctxmem context <topics>...` | Build budgeted context across topics |
//! | `ctxmem ask "<question>"` | Retrieval-QA against the configured LLM |
//! | `ctxmem delete <key-or-content>` | Securely delete matching chunks |
//! | `ctxmem pii` | Scan stored chunks for PII |
//! | `ctxmem health` | Cache and storage health |
//!
//! Logs go to stderr (`RUST_LOG` overrides the default `info` level);
//! command output goes to stdout.

use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use context_memory::config::{self, Config};
use context_memory::engine::MemoryEngine;
use context_memory::qa::QaRequest;
use context_memory::stats;

#[derive(Parser)]
#[command(
    name = "ctxmem",
    about = "Context Memory: bounded, access-controlled context retrieval for LLM agents",
    version
)]
struct Cli {
    /// Path to configuration file (TOML). Defaults apply when it is missing.
    #[arg(long, global = true, default_value = "./config/ctxmem.toml")]
    config: PathBuf,

    /// Act as this user. Unset means the configured anonymous role.
    #[arg(long, global = true)]
    user: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the knowledge base file and schema. Idempotent.
    Init,

    /// Index a file, or every matching file under a directory.
    Ingest {
        path: PathBuf,

        /// Glob matched against paths relative to a directory argument.
        #[arg(long, default_value = "**/*.md")]
        glob: String,

        /// Override the chunk window (characters) for a single file.
        #[arg(long)]
        chunk_size: Option<usize>,

        /// Override the chunk overlap (characters) for a single file.
        #[arg(long)]
        chunk_overlap: Option<usize>,
    },

    /// Build focused context across one or more topics.
    Context {
        #[arg(required = true)]
        topics: Vec<String>,

        #[arg(long, default_value = "2000")]
        max_tokens: usize,

        /// Chunks per topic; defaults to `retrieval.max_per_topic`.
        #[arg(long)]
        per_topic: Option<usize>,
    },

    /// Ask a question over the knowledge base.
    Ask {
        question: String,

        #[arg(long, default_value = "0.0")]
        temperature: f32,

        #[arg(long)]
        k: Option<usize>,

        /// Print the full response as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Securely delete chunks by key or by content.
    Delete { key_or_content: String },

    /// Scan stored chunks for emails, SSNs, and card numbers.
    Pii,

    /// Show cache and storage health.
    Health,
}

fn load(path: &Path) -> anyhow::Result<Config> {
    if path.exists() {
        config::load_config(path)
    } else {
        tracing::info!(path = %path.display(), "config file not found, using defaults");
        Ok(Config::default())
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let cfg = load(&cli.config)?;
    let kb_path = cfg.knowledge_base_path.clone();
    let engine = MemoryEngine::open(cfg).await?;
    let user = cli.user.as_deref();

    match cli.command {
        Commands::Init => {
            println!("Knowledge base initialized at {}.", kb_path.display());
        }
        Commands::Ingest {
            path,
            glob,
            chunk_size,
            chunk_overlap,
        } => {
            if path.is_dir() {
                let report = engine.add_directory(&path, &glob, None, user).await?;
                for done in &report.ingested {
                    println!(
                        "  {}  chunks={} added={} skipped={}",
                        done.source_path, done.chunks, done.added, done.skipped
                    );
                }
                for failed in &report.failed {
                    println!("  FAILED {}: {}", failed.path.display(), failed.error);
                }
                println!(
                    "Ingested {} file(s), {} failed.",
                    report.ingested.len(),
                    report.failed.len()
                );
            } else {
                let done = engine
                    .add_document(&path, None, chunk_size, chunk_overlap, user)
                    .await?;
                println!(
                    "Indexed {}: chunks={} added={} skipped={} purged={}",
                    done.source_path, done.chunks, done.added, done.skipped, done.purged
                );
            }
        }
        Commands::Context {
            topics,
            max_tokens,
            per_topic,
        } => {
            let per_topic = per_topic.unwrap_or(engine.config().retrieval.max_per_topic);
            let context = engine
                .build_focused_context(&topics, max_tokens, per_topic, user, None, None)
                .await;
            println!("{context}");
        }
        Commands::Ask {
            question,
            temperature,
            k,
            json,
        } => {
            let mut request = QaRequest::stateless(question).with_temperature(temperature);
            request.user = cli.user.clone();
            request.k = k;
            let response = engine.answer(request).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&response)?);
            } else {
                println!("{}", response.text());
                if !response.source_keys().is_empty() {
                    println!();
                    println!("Sources:");
                    for key in response.source_keys() {
                        println!("  {key}");
                    }
                }
            }
        }
        Commands::Delete { key_or_content } => {
            if engine.secure_delete(&key_or_content, user).await? {
                println!("Deleted.");
            } else {
                println!("Nothing matched.");
            }
        }
        Commands::Pii => {
            let flags = engine.scan_for_pii(user).await;
            if flags.is_empty() {
                println!("No PII detected.");
            }
            for flag in &flags {
                println!(
                    "  {:<12} {}  chars {}..{}",
                    format!("{:?}", flag.kind),
                    flag.chunk_key,
                    flag.start,
                    flag.end
                );
            }
        }
        Commands::Health => {
            let health = engine.get_index_health().await?;
            print!("{}", stats::render_health(&kb_path, &health));
            let profile = stats::render_profile(&engine.profiler_stats());
            if !profile.is_empty() {
                println!();
                print!("{profile}");
            }
        }
    }

    Ok(())
}
