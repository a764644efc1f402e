use anyhow::Result;
use axum::{routing::get, Router};
use clap::Parser;
use std::time::Duration;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;

mod cli;
mod config;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("palaver=info,tower_http=debug")),
        )
        .init();

    let args = cli::Args::parse();
    let config = config::Config::load(&args.config)?;

    ensure_data_dirs(&config);

    let db = palaver_db::create_pool(&config.database.url, config.database.max_connections).await?;
    palaver_db::run_migrations(&db).await?;

    let state = palaver_core::AppState::new(db, config.app_config());

    spawn_maintenance_tasks(&state);

    let app = Router::new()
        .route("/healthz", get(|| async { "ok" }))
        .merge(palaver_ws::gateway_router())
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state.clone());

    let listener = tokio::net::TcpListener::bind(&config.server.bind_address).await?;
    tracing::info!(bind_address = %config.server.bind_address, "palaver server listening");

    let shutdown = state.shutdown.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    tracing::info!("shutdown signal received");
                }
                _ = shutdown.notified() => {}
            }
        })
        .await?;

    Ok(())
}

fn ensure_data_dirs(config: &config::Config) {
    // sqlite file urls look like sqlite://./data/palaver.db?mode=rwc
    if let Some(path) = config
        .database
        .url
        .strip_prefix("sqlite://")
        .map(|rest| rest.split('?').next().unwrap_or(rest))
    {
        if let Some(parent) = std::path::Path::new(path).parent() {
            if !parent.as_os_str().is_empty() {
                let _ = std::fs::create_dir_all(parent);
            }
        }
    }
}

/// Presence sweep and coalescer pruning run on their own intervals for the
/// life of the process.
fn spawn_maintenance_tasks(state: &palaver_core::AppState) {
    let sweep_state = state.clone();
    let sweep_interval = Duration::from_secs(state.config.presence_sweep_interval_secs.max(1));
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(sweep_interval);
        interval.tick().await; // skip immediate first tick
        loop {
            interval.tick().await;
            sweep_state.presence.sweep().await;
        }
    });

    let prune_state = state.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(300));
        interval.tick().await;
        loop {
            interval.tick().await;
            prune_state.read_coalescer.prune();
        }
    });
}
