//! content-sorter binary entrypoint.
//! Loads config, builds the sorting engine, starts the backup ticker and
//! serves the HTTP API.

use std::sync::Arc;

use anyhow::Context;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use content_sorter::metrics::Metrics;
use content_sorter::sync::{spawn_backup_task, BackupSynchronizer};
use content_sorter::{router, AppState, SorterConfig, SortingEngine};

/// Compact logs by default; JSON lines when SORTER_LOG_JSON=1.
fn init_tracing() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("content_sorter=info,warn"));
    let json = std::env::var("SORTER_LOG_JSON").is_ok_and(|v| v == "1");

    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(fmt::layer().json()).init();
    } else {
        registry.with(fmt::layer().compact()).init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env in local/dev; no-op when absent.
    let _ = dotenvy::dotenv();
    init_tracing();

    let cfg = SorterConfig::load_default()?;
    tracing::info!(
        target: "sorter",
        base = %cfg.storage.base_path.display(),
        rate_limit = cfg.rate_limit.limit,
        window_secs = cfg.rate_limit.window_secs,
        "config loaded"
    );

    let engine = Arc::new(SortingEngine::from_config(&cfg)?);
    let mut state = AppState::new(engine);

    if let Some(sync) = BackupSynchronizer::from_config(&cfg.backup, &cfg.storage.base_path) {
        let sync = Arc::new(sync);
        spawn_backup_task(sync.clone());
        tracing::info!(target: "backup", interval_secs = cfg.backup.interval_secs, "backup task started");
        state = state.with_backup(sync);
    }

    let mut app = router(state);
    match Metrics::init() {
        Ok(m) => app = app.merge(m.router()),
        Err(e) => tracing::warn!(error = %e, "metrics disabled"),
    }

    let listener = tokio::net::TcpListener::bind(&cfg.server.bind)
        .await
        .with_context(|| format!("binding {}", cfg.server.bind))?;
    tracing::info!(target: "sorter", bind = %cfg.server.bind, "listening");
    axum::serve(listener, app).await.context("http server")?;
    Ok(())
}
