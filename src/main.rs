//! # Context daemon CLI (`ctxd`)
//!
//! ## Usage
//!
//! ```bash
//! ctxd --config ./config/ctxd.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `ctxd serve` | Run the daemon and its HTTP API until Ctrl-C |
//! | `ctxd gather <file> --line N --column N` | Gather one bundle and print it as JSON |
//! | `ctxd index` | Bring the semantic index snapshot up to date and exit |
//! | `ctxd sources` | List configured sources |
//! | `ctxd tools [--server S]` | List the tools each resource server advertises |
//! | `ctxd resources [--server S] [--scope DIR]` | List resources each server advertises |
//! | `ctxd read-resource --server S --uri U` | Print one resource |
//! | `ctxd call-tool --server S --tool T [--args JSON]` | Call a tool and print its text output |
//!
//! Logs go to stderr; `RUST_LOG` overrides `--log-level`.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use context_daemon::config::{load_config, Config};
use context_daemon::daemon::{restore_snapshot, Daemon};
use context_daemon::embedding::create_provider;
use context_daemon::indexer::Indexer;
use context_daemon::inspect;
use context_daemon::server::run_server;
use context_daemon::sources::list_sources;
use context_daemon_core::rag::RagStore;
use context_daemon_core::{CompletionQuery, Position, SourceId};

/// Context daemon: gathers code-completion context from editor buffers,
/// resource servers and a local semantic index under a strict latency bound.
#[derive(Parser)]
#[command(name = "ctxd", version)]
struct Cli {
    /// Path to configuration file (TOML). A missing file means defaults.
    #[arg(long, global = true, default_value = "./config/ctxd.toml")]
    config: PathBuf,

    /// Log filter used when `RUST_LOG` is unset.
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    /// Emit logs as JSON lines.
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the daemon and serve the HTTP API.
    Serve,

    /// Gather a context bundle once and print it as JSON.
    Gather {
        /// File the cursor is in.
        file: String,

        /// Cursor line (0-indexed).
        #[arg(long, default_value_t = 0)]
        line: usize,

        /// Cursor column (0-indexed).
        #[arg(long, default_value_t = 0)]
        column: usize,

        /// Language id; guessed from the extension when omitted.
        #[arg(long)]
        language: Option<String>,

        /// Restrict to these source ids (repeatable).
        #[arg(long = "source")]
        sources: Vec<String>,
    },

    /// Scan the workspace, update the semantic index, and save its snapshot.
    Index,

    /// List configured sources.
    Sources,

    /// List the tools advertised by resource servers.
    Tools {
        /// Only this server.
        #[arg(long)]
        server: Option<String>,
    },

    /// List the resources advertised by resource servers.
    Resources {
        /// Only this server.
        #[arg(long)]
        server: Option<String>,

        /// Only resources under this directory.
        #[arg(long, default_value = "")]
        scope: String,
    },

    /// Read one resource and print it.
    ReadResource {
        #[arg(long)]
        server: String,

        #[arg(long)]
        uri: String,
    },

    /// Call a tool and print its text output.
    CallTool {
        #[arg(long)]
        server: String,

        #[arg(long)]
        tool: String,

        /// Arguments as a JSON object.
        #[arg(long)]
        args: Option<String>,
    },
}

fn init_telemetry(cli: &Cli) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));

    if cli.json_logs {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_target(true).with_writer(std::io::stderr))
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(false).with_writer(std::io::stderr))
            .init();
    }
}

fn read_config(path: &Path) -> Result<Config> {
    if path.exists() {
        load_config(path)
    } else {
        info!(path = %path.display(), "config file not found; using defaults");
        Ok(Config::default())
    }
}

fn language_for(file: &str) -> String {
    let ext = Path::new(file)
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("");
    match ext {
        "rs" => "rust",
        "py" => "python",
        "ts" | "tsx" => "typescript",
        "js" | "jsx" => "javascript",
        "go" => "go",
        "lua" => "lua",
        "c" | "h" => "c",
        "cpp" | "cc" | "hpp" => "cpp",
        "java" => "java",
        "md" => "markdown",
        other => other,
    }
    .to_string()
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_telemetry(&cli);
    let config = read_config(&cli.config)?;

    match cli.command {
        Commands::Serve => {
            let daemon = Arc::new(Daemon::start(config).await?);
            run_server(Arc::clone(&daemon), async {
                let _ = tokio::signal::ctrl_c().await;
                info!("interrupt received");
            })
            .await?;
            match Arc::try_unwrap(daemon) {
                Ok(daemon) => daemon.shutdown().await?,
                Err(_) => bail!("daemon still referenced after server exit"),
            }
        }
        Commands::Gather {
            file,
            line,
            column,
            language,
            sources,
        } => {
            let daemon = Daemon::start(config).await?;
            let language = language.unwrap_or_else(|| language_for(&file));
            let mut query = CompletionQuery::new(file, Position { line, column }, language);
            if !sources.is_empty() {
                query.enabled_sources = Some(sources.into_iter().map(SourceId::new).collect());
            }
            let bundle = daemon.gather(query).await;
            println!("{}", serde_json::to_string_pretty(&bundle)?);
            daemon.shutdown().await?;
        }
        Commands::Index => run_index(&config).await?,
        Commands::Sources => list_sources(&config)?,
        Commands::Tools { server } => inspect::list_tools(&config, server.as_deref()).await?,
        Commands::Resources { server, scope } => {
            inspect::list_resources(&config, server.as_deref(), &scope).await?
        }
        Commands::ReadResource { server, uri } => {
            inspect::read_resource(&config, &server, &uri).await?
        }
        Commands::CallTool { server, tool, args } => {
            inspect::call_tool(&config, &server, &tool, args.as_deref()).await?
        }
    }
    Ok(())
}

async fn run_index(config: &Config) -> Result<()> {
    let Some(provider) = create_provider(&config.embedding)? else {
        bail!("embeddings are disabled; nothing to index");
    };
    let rag = Arc::new(
        RagStore::new(provider, config.rag.chunk_params())
            .with_batch_size(config.embedding.batch_size),
    );
    restore_snapshot(&rag, config.rag.snapshot_path.as_ref());

    let indexer = Indexer::new(Arc::clone(&rag), &config.rag)
        .with_context(|| format!("Failed to open workspace root: {}", config.rag.root.display()))?;
    let stats = indexer.scan(&CancellationToken::new()).await?;
    println!(
        "indexed {} unchanged {} removed {} skipped {} failed {}",
        stats.indexed, stats.unchanged, stats.removed, stats.skipped, stats.failed
    );

    let totals = rag.stats();
    println!("{} files, {} chunks", totals.files, totals.chunks);
    if let Some(path) = &config.rag.snapshot_path {
        rag.save_snapshot(path)
            .with_context(|| format!("Failed to write index snapshot: {}", path.display()))?;
        println!("snapshot written to {}", path.display());
    }
    Ok(())
}
