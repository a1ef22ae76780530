//! Deep Research MCP server — stdio entry point.
//!
//! Wires the store, provider, notifier, and engine once at startup, recovers
//! in-flight tasks, then serves JSON-RPC over stdin/stdout. All logging goes
//! to stderr and a rolling JSON file; stdout carries only protocol frames.

use clap::Parser;
use deepresearch_mcp::{serve, RequestHandler, StdioTransport, ToolSurface};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

/// Deep Research: long-running research task orchestrator (MCP server)
#[derive(Parser, Debug)]
#[command(name = "deepresearch-mcp", version, about, long_about = None)]
struct Cli {
    /// Working directory (database and config are resolved relative to it)
    #[arg(short, long, default_value = ".")]
    workspace: PathBuf,

    /// Override the database path
    #[arg(long)]
    db_path: Option<PathBuf>,

    /// Override the report output directory
    #[arg(long)]
    output_dir: Option<PathBuf>,

    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Suppress non-essential output
    #[arg(short, long)]
    quiet: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();

    // stderr layer is human-readable; stdout stays reserved for JSON-RPC.
    let filter = match cli.verbose {
        0 if cli.quiet => "error",
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let stderr_layer = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_writer(std::io::stderr)
        .with_filter(EnvFilter::new(filter));

    let log_dir = directories::ProjectDirs::from("dev", "deepresearch", "deepresearch")
        .map(|d| d.data_dir().join("logs"))
        .unwrap_or_else(|| PathBuf::from("."));
    let _ = std::fs::create_dir_all(&log_dir);
    let file_appender = tracing_appender::rolling::daily(&log_dir, "deepresearch.log");
    let (non_blocking, _guard) = tracing_appender::non_blocking(file_appender);
    let json_layer = tracing_subscriber::fmt::layer()
        .json()
        .with_writer(non_blocking)
        .with_filter(EnvFilter::new("debug"));

    tracing_subscriber::registry()
        .with(stderr_layer)
        .with(json_layer)
        .init();

    let workspace = cli
        .workspace
        .canonicalize()
        .unwrap_or_else(|_| std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")));

    let mut config = deepresearch_core::load_config(Some(&workspace))
        .map_err(|e| anyhow::anyhow!("configuration error: {e}"))?;
    if let Some(db_path) = cli.db_path {
        config.storage.db_path = db_path;
    }
    if let Some(output_dir) = cli.output_dir {
        config.storage.output_dir = output_dir;
    }

    let db_path = if config.storage.db_path.is_absolute() {
        config.storage.db_path.clone()
    } else {
        workspace.join(&config.storage.db_path)
    };
    let store = Arc::new(
        deepresearch_core::StateStore::open(&db_path)
            .map_err(|e| anyhow::anyhow!("failed to open state store: {e}"))?,
    );

    // A missing credential disables submissions but keeps the read-only
    // tools (status, get, estimate, save) serviceable.
    let provider: Arc<dyn deepresearch_core::ResearchProvider> =
        match deepresearch_core::HttpProvider::from_config(&config.provider) {
            Ok(provider) => Arc::new(provider),
            Err(e) => {
                tracing::warn!(error = %e, "research provider unavailable");
                Arc::new(deepresearch_core::UnavailableProvider::new(e.to_string()))
            }
        };
    let notifier = Arc::new(deepresearch_core::DesktopNotifier::new());

    let engine = deepresearch_core::ResearchEngine::new(store, provider, notifier, config);

    let recovery = engine
        .recover_on_startup()
        .await
        .map_err(|e| anyhow::anyhow!("startup recovery failed: {e}"))?;
    tracing::info!(
        resumed = recovery.resumed.len(),
        failed_pre_submit = recovery.failed_pre_submit.len(),
        "startup recovery complete"
    );

    let mut handler = RequestHandler::new(ToolSurface::new(engine.clone()));
    let mut transport = StdioTransport::new();
    let served = serve(&mut transport, &mut handler).await;

    // Client hung up: wind down background units before exit.
    let stopped = engine.shutdown(std::time::Duration::from_secs(5)).await;
    tracing::info!(stopped, "shutdown complete");

    served.map_err(|e| anyhow::anyhow!("transport error: {e}"))
}
