//! Fanout orchestrator server and one-shot runner.

use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use fanout_orchestrator::{http, AppState, Config, JsonLinesSink, Orchestrator, RunRequest};

/// Fan tasks out to streaming backends with retry and fallback.
#[derive(Parser)]
#[command(name = "fanout")]
#[command(about = "Bounded-concurrency task orchestrator", long_about = None)]
struct Cli {
    /// Path to a JSON config file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Log filter used when RUST_LOG is not set
    #[arg(long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Serve the HTTP API
    Serve {
        /// Override the configured bind address
        #[arg(long)]
        bind: Option<String>,
    },

    /// Execute one run request and stream envelopes to stdout as NDJSON
    Run {
        /// Path to the run request JSON
        request: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // Logs go to stderr; stdout carries envelopes for `run`.
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(&cli.log_level)?,
    };
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let config = match &cli.config {
        Some(path) => Config::load(path)?,
        None => Config::default(),
    };
    let orchestrator = Orchestrator::from_config(&config)?;

    match cli.command {
        Commands::Serve { bind } => {
            let addr = bind.unwrap_or_else(|| config.bind_addr.clone());
            serve(orchestrator, &addr, &config).await?;
        }
        Commands::Run { request } => {
            run_once(orchestrator, &request).await?;
        }
    }

    Ok(())
}

async fn serve(
    orchestrator: Orchestrator,
    addr: &str,
    config: &Config,
) -> Result<(), Box<dyn std::error::Error>> {
    let state = AppState::new(orchestrator, config.event_buffer, config.max_retained_runs);
    let router = http::create_router(state);

    let listener = TcpListener::bind(addr).await?;
    info!(addr = %listener.local_addr()?, "HTTP server listening");

    axum::serve(listener, router)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!(error = %e, "Failed to listen for shutdown signal");
            }
            info!("Shutting down");
        })
        .await?;
    Ok(())
}

async fn run_once(
    orchestrator: Orchestrator,
    path: &Path,
) -> Result<(), Box<dyn std::error::Error>> {
    let text = tokio::fs::read_to_string(path)
        .await
        .map_err(|e| format!("Failed to read run request from '{}': {}", path.display(), e))?;
    let request: RunRequest = serde_json::from_str(&text)?;

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, cancelling run");
            on_signal.cancel();
        }
    });

    let sink = JsonLinesSink::new(tokio::io::stdout());
    let summary = orchestrator
        .execute(request, Box::new(sink), &cancel)
        .await?;

    info!(
        completed = summary.completed,
        failed = summary.failed,
        skipped = summary.skipped,
        "Run finished"
    );
    Ok(())
}
