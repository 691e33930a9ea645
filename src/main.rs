use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;

use quill_core::bus::Bus;
use quill_engine::{EngineConfig, HookRegistry, SessionEngine, ToolRegistry};
use quill_llm::{NoAuthProvider, ProviderRegistry, RetryProvider};
use quill_server::{AppState, ServerConfig};
use quill_store::projects::ProjectRepo;
use quill_store::{import, Database, DB_FILE};
use quill_telemetry::TelemetryConfig;

#[derive(Parser)]
#[command(name = "quill", about = "Local AI-coding agent runtime")]
struct Args {
    /// Port to listen on.
    #[arg(long, default_value_t = 4096)]
    port: u16,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Data directory. Defaults to ~/.quill.
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Worktree directory. Defaults to the current directory.
    #[arg(long)]
    directory: Option<PathBuf>,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    quill_telemetry::init_telemetry(&TelemetryConfig {
        log_level: args.log_level.clone(),
        ..Default::default()
    });

    let data_dir = args.data_dir.unwrap_or_else(|| home_dir().join(".quill"));
    let directory = args
        .directory
        .unwrap_or_else(|| std::env::current_dir().unwrap_or_else(|_| PathBuf::from("/tmp")));

    // A failed migration leaves the database untouched and is fatal.
    let db = match Database::open(&data_dir.join(DB_FILE)) {
        Ok(db) => db,
        Err(e) => {
            eprintln!("quill: failed to open database: {e}");
            std::process::exit(1);
        }
    };

    // One-shot legacy JSON import; retried next start if it did not commit.
    match import::run(&db, &data_dir) {
        Ok(report) if report.total() > 0 => {
            tracing::info!(imported = report.total(), skipped = report.skipped, "legacy storage imported");
        }
        Ok(_) => {}
        Err(e) => tracing::error!(error = %e, "legacy storage import failed; will retry on next start"),
    }

    let project = match ProjectRepo::new(db.clone()).resolve_for_directory(&directory) {
        Ok(project) => project,
        Err(e) => {
            eprintln!("quill: failed to resolve project: {e}");
            std::process::exit(1);
        }
    };
    tracing::info!(project_id = %project.id, worktree = %project.worktree, "project resolved");

    let bus = Bus::new();

    // Providers register here, each behind the transient-error retry
    // wrapper. Without configured credentials the default adapter reports an
    // auth error on use.
    let providers = ProviderRegistry::new();
    providers.register(Arc::new(RetryProvider::with_defaults(NoAuthProvider::new(
        "anthropic",
        "claude-sonnet-4-5",
    ))));
    tracing::warn!("no provider credentials configured — prompts will fail with AuthError");

    let config = EngineConfig::new(&data_dir, &directory, &project.id);
    let engine = SessionEngine::new(
        db.clone(),
        bus,
        config,
        ToolRegistry::new(),
        Arc::new(providers),
        HookRegistry::new(),
    );

    let state = AppState::new(engine.clone(), db);
    let handle = match quill_server::start(ServerConfig { port: args.port }, state).await {
        Ok(handle) => handle,
        Err(e) => {
            eprintln!("quill: failed to bind port {}: {e}", args.port);
            std::process::exit(1);
        }
    };
    tracing::info!(port = handle.port, "quill ready");

    wait_for_shutdown_signal().await;
    tracing::info!("shutdown signal received");

    // Phase 1: cancel live turns so locks release and messages finalise.
    let cancelled = engine.dispose();
    if cancelled > 0 {
        tracing::info!(cancelled, "cancelled live turns");
    }

    // Phase 2: stop accepting connections, then drain in-flight requests.
    handle.shutdown();
    if tokio::time::timeout(std::time::Duration::from_secs(10), handle.drain())
        .await
        .is_err()
    {
        tracing::warn!("server drain timed out after 10s");
    }

    tracing::info!("shutdown complete");
}

async fn wait_for_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate()).expect("install SIGTERM handler");
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {},
            _ = sigterm.recv() => {},
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await.expect("listen for ctrl+c");
    }
}

fn home_dir() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
}
