use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use tokio::sync::{broadcast, watch};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use usagestats_core::{
    FileSettingsStore, FileSnapshotStore, FileSource, MemorySource, MetricSource, SettingsStore,
    StatsConfig,
};
use usagestats_server::{bootstrap_access_token, LogNotifier, RollupScheduler, TelemetryReporter};
use usagestats_web::{create_router, BearerAdminKey, ServerState};

/// Environment variable naming the configuration file.
const CONFIG_ENV: &str = "USAGESTATS_CONFIG";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info,usagestats_server=debug".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Usage statistics service starting...");

    let config = load_config()?;
    let bind_addr: SocketAddr = config
        .bind_addr
        .parse()
        .with_context(|| format!("invalid bindAddr {}", config.bind_addr))?;

    // Stores
    let snapshots = Arc::new(
        FileSnapshotStore::open_in(&config.data_dir).context("failed to open snapshot history")?,
    );
    let settings: Arc<dyn SettingsStore> = Arc::new(
        FileSettingsStore::open_in(&config.data_dir).context("failed to open settings")?,
    );
    bootstrap_access_token(settings.as_ref()).context("failed to issue access token")?;

    let source: Arc<dyn MetricSource> = match &config.source_file {
        Some(path) => {
            tracing::info!(path = %path.display(), "source records are re-read on every rollup");
            Arc::new(FileSource::open(path)?)
        }
        None => {
            tracing::warn!("no sourceFile configured, aggregating over an empty record set");
            Arc::new(MemorySource::new())
        }
    };

    let (live_tx, _) = broadcast::channel(16);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // Rollup scheduler, designated writer only
    let scheduler_handle = if config.is_designated_writer() {
        let reporter = TelemetryReporter::from_settings(&config.telemetry)?;
        if reporter.is_none() {
            tracing::info!("no telemetry endpoint configured, reporting disabled");
        }
        let scheduler = RollupScheduler::new(
            source,
            snapshots.clone(),
            settings.clone(),
            Arc::new(LogNotifier),
        )
        .with_reporter(reporter)
        .with_publisher(live_tx.clone())
        .with_duplicate_rows(config.duplicate_rows);
        Some(tokio::spawn(scheduler.run(shutdown_rx)))
    } else {
        tracing::info!(
            replica = config.replica_index,
            "not the designated writer, rollup scheduler disabled"
        );
        None
    };

    // HTTP server
    let state = ServerState::new(
        snapshots,
        settings,
        Arc::new(BearerAdminKey::new(config.admin_key.clone())),
        live_tx,
    );
    let app = create_router(state);
    let listener = tokio::net::TcpListener::bind(bind_addr).await?;
    tracing::info!("HTTP server listening on {}", bind_addr);
    let http_handle = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            tracing::error!("HTTP server error: {}", e);
        }
    });

    // Wait for shutdown signal
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Received Ctrl+C, shutting down...");
        }
        _ = http_handle => {
            tracing::warn!("HTTP server stopped");
        }
    }

    let _ = shutdown_tx.send(true);
    if let Some(handle) = scheduler_handle {
        let _ = handle.await;
    }

    tracing::info!("Shutdown complete");
    Ok(())
}

/// Configuration from `$USAGESTATS_CONFIG` or the first argument, defaults otherwise.
fn load_config() -> anyhow::Result<StatsConfig> {
    let path = std::env::var_os(CONFIG_ENV).or_else(|| std::env::args_os().nth(1));
    match path {
        Some(path) => {
            let config = StatsConfig::load(&path)?;
            tracing::info!(path = %std::path::Path::new(&path).display(), "loaded configuration");
            Ok(config)
        }
        None => {
            tracing::info!("no configuration file given, using defaults");
            Ok(StatsConfig::default())
        }
    }
}
