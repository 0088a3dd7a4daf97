use anyhow::{Context, Result};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

mod api;
mod checks;
mod config;
mod engine;
mod models;
mod state;
mod store;
mod utils;

use crate::api::AppState;
use crate::checks::NetworkProber;
use crate::config::ScoringConfig;
use crate::engine::ScoringEngine;
use crate::state::StatusBoard;
use crate::store::SqliteLog;

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env()
            .add_directive(tracing::Level::INFO.into()))
        .with_ansi(true)
        .init();

    let config_path = std::env::var("SCORING_CONFIG")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("config.json"));
    let config = ScoringConfig::load(&config_path)?;

    let log = SqliteLog::open(&config.database_path)
        .with_context(|| format!("Failed to open result log {}", config.database_path.display()))?;
    let log = Arc::new(log);
    let board = StatusBoard::new(config.max_score());
    let prober = Arc::new(NetworkProber::new(config.check_timeout())?);

    info!(
        "Scoring engine starting: range {} | network {}.0/24 | interval {}s | timeout {}s",
        config.range_id.map_or("-".to_string(), |r| r.to_string()),
        config.base_net().unwrap_or_else(|| "custom".into()),
        config.check_interval_secs,
        config.check_timeout_secs
    );
    info!(
        "Worst-case round duration ~{}s if every target is unreachable",
        config.services.len() as u64 * config.check_timeout_secs
    );

    let api_state = AppState {
        board: board.clone(),
        log: log.clone(),
        services: Arc::new(config.services.clone()),
        check_interval_secs: config.check_interval_secs,
    };
    let api_port = config.api_port;
    tokio::spawn(async move {
        if let Err(e) = api::start_server(api_port, api_state).await {
            error!("Dashboard server failed: {:#}", e);
        }
    });

    let shutdown = CancellationToken::new();
    let engine = Arc::new(ScoringEngine::new(&config, prober, log, board));
    let engine_task = tokio::spawn(engine.run(shutdown.clone()));

    signal::ctrl_c().await?;
    info!("Shutdown signal received. Stopping scoring engine...");
    shutdown.cancel();
    engine_task.await.context("Scoring engine task failed")?;

    Ok(())
}
