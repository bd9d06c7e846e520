use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use maestro_core::config::{MaestroConfig, SHUTDOWN_FUSE_SECS};
use maestro_engine::Orchestrator;
use maestro_store::Store;
use maestro_tasks::TaskScheduler;

mod app;
mod http;
mod ws;

#[derive(Parser)]
#[command(name = "maestro-gateway", version, about = "Assistant orchestration gateway")]
struct Args {
    /// Path to maestro.toml (default: ~/.maestro/maestro.toml).
    #[arg(long)]
    config: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "maestro_gateway=info,tower_http=debug".into()),
        )
        .init();

    let args = Args::parse();
    let config_path = args
        .config
        .or_else(|| std::env::var("MAESTRO_CONFIG").ok());
    let config = MaestroConfig::load(config_path.as_deref()).unwrap_or_else(|e| {
        warn!("config load failed ({e}), using defaults");
        MaestroConfig::default()
    });

    if let Some(parent) = Path::new(&config.database.path).parent() {
        std::fs::create_dir_all(parent)?;
    }
    let store = Arc::new(Store::open(&config.database.path)?);
    let orch = Orchestrator::new(config.clone(), Arc::clone(&store))?;
    let scheduler = TaskScheduler::new(Arc::clone(&orch));
    let shutdown = CancellationToken::new();

    tokio::spawn(maestro_store::maintenance::run_loop(
        Arc::clone(&store),
        config.limits.session_ttl_days,
        config.limits.cleanup_interval_hours,
    ));
    tokio::spawn(Arc::clone(&scheduler).run(shutdown.clone()));
    tokio::spawn(maestro_tasks::recovery::run(Arc::clone(&orch)));

    let state = Arc::new(app::AppState {
        orch: Arc::clone(&orch),
        scheduler,
        started_at: Instant::now(),
        shutdown: shutdown.clone(),
    });
    let router = app::build_router(Arc::clone(&state));

    let addr: SocketAddr = format!("{}:{}", config.gateway.bind, config.gateway.port).parse()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("maestro gateway listening on {addr}");

    let serve_shutdown = shutdown.clone();
    axum::serve(listener, router)
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutdown requested");
            serve_shutdown.cancel();
            // Hard fuse: if teardown wedges, leave anyway.
            tokio::spawn(async {
                tokio::time::sleep(Duration::from_secs(SHUTDOWN_FUSE_SECS)).await;
                error!("shutdown fuse fired, forcing exit");
                std::process::exit(1);
            });
        })
        .await?;

    // Connections are gone; abort the runners, flush the store, leave.
    orch.stop_all();
    orch.plugin_configs.sweep();
    if let Err(e) = store.checkpoint_truncate() {
        warn!("final checkpoint failed: {e}");
    }
    info!("shutdown complete");
    Ok(())
}
