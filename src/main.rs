//! imageforged - the image composition daemon
//!
//! Opens the blueprint store and the resolver handle, recovers the build
//! queue from any unclean shutdown, starts the single background worker, and
//! serves the HTTP API until interrupted.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;

use imageforge::api::{self, AppState};
use imageforge::config::Config;
use imageforge::queue::{Queue, Worker};
use imageforge::resolver::{ResolverHandle, SourceStore};
use imageforge::store::BlueprintStore;

/// Image composition service daemon
#[derive(Parser)]
#[command(name = "imageforged")]
#[command(about = "Turn blueprints into queued, reproducible image builds")]
#[command(version = env!("CARGO_PKG_VERSION"))]
struct Cli {
    /// Configuration file path
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_level = match cli.log_level.as_str() {
        "trace" => tracing::Level::TRACE,
        "debug" => tracing::Level::DEBUG,
        "info" => tracing::Level::INFO,
        "warn" => tracing::Level::WARN,
        "error" => tracing::Level::ERROR,
        _ => tracing::Level::INFO,
    };
    tracing_subscriber::fmt().with_max_level(log_level).init();

    let cfg = Arc::new(Config::load(cli.config.as_deref()).context("loading configuration")?);

    // Single-threaded initialization of the process-wide state.
    let store = BlueprintStore::open(&cfg.paths.repo_dir).context("opening blueprint store")?;
    let sources = SourceStore::new(cfg.system_sources_dir(), cfg.user_sources_dir());
    let resolver = ResolverHandle::open(
        sources,
        Duration::from_secs(cfg.resolver.metadata_expire_secs),
    )
    .context("opening package database")?;
    let queue = Queue::open(&cfg.paths.lib_dir).context("opening build queue")?;

    // Reclassify builds orphaned by an unclean shutdown before accepting
    // new work.
    queue.recover().context("recovering build queue")?;

    let state = AppState {
        cfg: cfg.clone(),
        store: Arc::new(Mutex::new(store)),
        resolver: Arc::new(Mutex::new(resolver)),
        queue: queue.clone(),
    };

    // The single background worker. It runs builds on a blocking thread and
    // drains on shutdown.
    let running = Arc::new(AtomicBool::new(true));
    let worker = Worker::new(cfg.clone(), queue);
    let worker_flag = running.clone();
    let worker_task = tokio::task::spawn_blocking(move || worker.run(&worker_flag));

    let addr = format!("{}:{}", cfg.api.host, cfg.api.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("binding {addr}"))?;
    info!(%addr, version = imageforge::VERSION, "imageforged listening");

    axum::serve(listener, api::router(state))
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutting down");
        })
        .await
        .context("serving API")?;

    running.store(false, Ordering::SeqCst);
    worker_task.await.context("joining worker")?;

    Ok(())
}
