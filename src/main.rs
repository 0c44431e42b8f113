//! # Context Kit CLI (`ckit`)
//!
//! Builds and queries the semantic index of a context repository.
//!
//! ## Usage
//!
//! ```bash
//! ckit --config ./config/ckit.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `ckit index` | Embed every entity document and persist the index |
//! | `ckit status` | Show the persisted index and its integrity |
//! | `ckit similar <ID>` | Rank entities similar to `<ID>` |
//! | `ckit search "<text>"` | Free-text semantic search |
//! | `ckit ask "<question>"` | Stream an answer grounded on retrieved entities |
//!
//! Logs go to stderr (`RUST_LOG`, or `-v` for debug output), so stdout
//! can be piped. During `ask`, Ctrl-C stops the stream and prints the
//! partial answer.

use clap::{Parser, Subcommand};
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use context_kit::config;
use context_kit::models::RetrievalResult;
use context_kit::rag::{QueryOutcome, StreamEvent};
use context_kit::service::ContextService;
use tracing_subscriber::EnvFilter;

/// Context Kit CLI: semantic search and question answering over a
/// repository of product context entities.
#[derive(Parser)]
#[command(
    name = "ckit",
    about = "Context Kit: semantic search and RAG over context repositories",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/ckit.toml")]
    config: PathBuf,

    /// Enable debug logging.
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Print results as JSON.
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Build the vector index from `contexts/**/*.yaml`.
    ///
    /// Fails before any network call if the Azure embedding deployment is
    /// the chat deployment.
    Index,

    /// Show whether an index is present, its model, and its checksum state.
    Status,

    /// Find entities similar to an existing entity.
    Similar {
        /// Entity ID (e.g. `FEAT-001`).
        id: String,

        /// Maximum number of results.
        #[arg(long)]
        limit: Option<usize>,
    },

    /// Semantic search with free text.
    Search {
        query: String,

        /// Maximum number of results.
        #[arg(long)]
        limit: Option<usize>,
    },

    /// Ask a question answered from the indexed entities.
    Ask { question: String },
}

fn init_tracing(verbose: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(if verbose {
            "context_kit=debug,ckit=debug"
        } else {
            "context_kit=info,ckit=info"
        })
    });
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn print_results(results: &[RetrievalResult], json: bool) -> anyhow::Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(results)?);
        return Ok(());
    }
    if results.is_empty() {
        println!("No results.");
        return Ok(());
    }
    for (i, r) in results.iter().enumerate() {
        println!(
            "{}. [{:>3}] {} ({}) {}",
            i + 1,
            r.similarity,
            r.id,
            r.entity_type,
            r.title.as_deref().unwrap_or("")
        );
        println!("    {}", r.excerpt.replace('\n', " "));
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let cfg = config::load_config(&cli.config)?;
    let service = Arc::new(ContextService::new(cfg));

    match cli.command {
        Commands::Index => {
            let summary = service
                .index_repository()
                .await
                .context("indexing failed")?;
            if cli.json {
                println!("{}", serde_json::to_string_pretty(&summary)?);
            } else {
                println!(
                    "Indexed {} documents with {}/{}",
                    summary.doc_count, summary.provider, summary.embedding_model
                );
                println!("  checksum: {}", summary.checksum);
                println!("  path: {}", summary.path.display());
            }
        }
        Commands::Status => {
            service.load_index().await?;
            let status = service.status();
            if cli.json {
                println!("{}", serde_json::to_string_pretty(&status)?);
            } else if !status.indexed {
                println!("Not indexed ({}). Run `ckit index`.", status.path.display());
            } else {
                println!("Indexed: {} documents", status.doc_count);
                println!(
                    "  model: {}/{}",
                    status.provider.unwrap_or_default(),
                    status.embedding_model.unwrap_or_default()
                );
                println!("  checksum: {}", status.checksum.unwrap_or_default());
                if let Some(built_at) = status.built_at {
                    println!("  built: {}", built_at.format("%Y-%m-%d %H:%M:%S UTC"));
                }
                if status.checksum_valid == Some(false) {
                    println!("  WARNING: checksum mismatch; consider re-indexing");
                }
            }
        }
        Commands::Similar { id, limit } => {
            service.load_index().await?;
            let results = service.find_similar(&id, limit)?;
            print_results(&results, cli.json)?;
        }
        Commands::Search { query, limit } => {
            service.load_index().await?;
            let results = service.search(&query, limit).await?;
            print_results(&results, cli.json)?;
        }
        Commands::Ask { question } => {
            service.load_index().await?;

            let canceller = Arc::clone(&service);
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    canceller.cancel_query();
                }
            });

            let json = cli.json;
            let outcome = service
                .ask_stream(&question, move |event| {
                    if let StreamEvent::Token(text) = event {
                        if !json {
                            print!("{}", text);
                            let _ = std::io::stdout().flush();
                        }
                    }
                })
                .await?;

            match outcome {
                QueryOutcome::Completed(response) => {
                    if json {
                        println!("{}", serde_json::to_string_pretty(&response)?);
                    } else {
                        println!();
                        println!();
                        println!("Sources:");
                        for s in &response.sources {
                            println!(
                                "  [{:>3}] {} {}",
                                s.relevance,
                                s.id,
                                s.title.as_deref().unwrap_or("")
                            );
                        }
                        if let Some(tokens) = response.tokens_used {
                            println!("Tokens used: {}", tokens);
                        }
                    }
                }
                QueryOutcome::Cancelled { partial_answer, .. } => {
                    if json {
                        println!(
                            "{}",
                            serde_json::json!({ "cancelled": true, "partialAnswer": partial_answer })
                        );
                    } else {
                        println!();
                        eprintln!("(cancelled)");
                    }
                }
            }
        }
    }

    Ok(())
}
