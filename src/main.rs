use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use mailbridge::config::Config;
use mailbridge::pipeline::Pipeline;
use mailbridge::server::{AppState, router};
use mailbridge::store::{LibSqlThreadStore, ThreadStore};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // A missing .env file is fine; the process environment still applies.
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let config = Config::from_env().context("invalid configuration")?;

    // ── Database ─────────────────────────────────────────────────────────
    let store: Arc<dyn ThreadStore> = Arc::new(
        LibSqlThreadStore::new_local(Path::new(&config.store.db_path))
            .await
            .with_context(|| format!("failed to open database at {}", config.store.db_path))?,
    );

    // ── Pipeline ─────────────────────────────────────────────────────────
    let client = config.http_client()?;
    let pipeline = Pipeline::from_config(&config, store, client);

    let app = router(AppState::new(pipeline), config.server.body_limit_bytes);

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;

    tracing::info!(
        addr = %addr,
        version = env!("CARGO_PKG_VERSION"),
        backend = %config.backend.base_url,
        api = ?config.backend.api,
        signal = ?config.threading.strategy,
        db = %config.store.db_path,
        "mailbridge listening"
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    tracing::info!("mailbridge stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::warn!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
}
