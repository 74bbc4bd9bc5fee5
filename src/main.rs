// =============================================================================
// PulseWatch — derivatives market alert engine, main entry point
// =============================================================================
//
// Startup order: config → store (fatal if unreachable) → shared state →
// ingestion pipelines → density tracker → alert scheduler → API server.
// Ctrl+C aborts every spawned task and exits cleanly.
// =============================================================================

mod alert;
mod api;
mod app_state;
mod binance;
mod broadcast;
mod density;
mod ingest;
mod runtime_config;
mod store;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::task::JoinHandle;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::app_state::AppState;
use crate::runtime_config::RuntimeConfig;
use crate::store::MetricStore;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("╔══════════════════════════════════════════════╗");
    info!("║        PulseWatch Alert Engine               ║");
    info!("╚══════════════════════════════════════════════╝");

    // ── 1. Configuration & store ─────────────────────────────────────────
    let config = RuntimeConfig::load("pulsewatch.json")?;
    info!(
        store = %config.store_path,
        bind = %config.bind_addr,
        "configuration resolved"
    );

    // A store that cannot open is a fatal bootstrap error: exit non-zero.
    let store = Arc::new(
        MetricStore::open(&config.store_path).context("metric store unavailable at startup")?,
    );

    let state = Arc::new(AppState::new(config, store));
    let mut tasks: Vec<JoinHandle<()>> = Vec::new();

    // ── 2. Ingestion pipelines ───────────────────────────────────────────
    tasks.push(tokio::spawn(ingest::price::run_price_pipeline(
        state.exchange.clone(),
        state.store.clone(),
        Duration::from_secs(state.config.price_poll_secs),
    )));
    tasks.push(tokio::spawn(ingest::volume::run_volume_pipeline(
        state.exchange.clone(),
        state.store.clone(),
    )));
    tasks.push(tokio::spawn(ingest::trade_count::run_trade_count_pipeline(
        state.exchange.clone(),
        state.store.clone(),
        Duration::from_secs(state.config.trade_count_poll_secs),
    )));
    tasks.push(tokio::spawn(
        ingest::open_interest::run_open_interest_pipeline(
            state.exchange.clone(),
            state.store.clone(),
            Duration::from_secs(state.config.open_interest_poll_secs),
        ),
    ));
    tasks.push(tokio::spawn(ingest::funding::run_funding_pipeline(
        state.exchange.clone(),
        state.store.clone(),
        Duration::from_secs(state.config.funding_poll_secs),
    )));
    info!("ingestion pipelines launched");

    // ── 3. Density tracker ───────────────────────────────────────────────
    tasks.push(tokio::spawn(density::stream::run_density_stream(
        state.exchange.clone(),
        state.density_book.clone(),
    )));
    tasks.push(tokio::spawn(density::book::run_density_flush(
        state.density_book.clone(),
        state.store.clone(),
    )));
    tasks.push(tokio::spawn(density::book::run_stale_sweep(
        state.density_book.clone(),
    )));
    tasks.push(tokio::spawn(density::book::run_band_sweep(
        state.density_book.clone(),
    )));
    tasks.push(tokio::spawn(
        state.density_feed.clone().run_broadcast_loop(),
    ));
    info!("density tracker and live feed launched");

    // ── 4. Store retention ───────────────────────────────────────────────
    {
        let store = state.store.clone();
        let cadence = Duration::from_secs(state.config.retention_sweep_secs);
        tasks.push(tokio::spawn(async move {
            let mut interval = tokio::time::interval(cadence);
            loop {
                interval.tick().await;
                if let Err(e) = store.run_retention_sweep(chrono::Utc::now().timestamp_millis()) {
                    warn!(error = %e, "retention sweep failed");
                }
            }
        }));
    }

    // ── 5. Composite scheduler ───────────────────────────────────────────
    // Warm-up pass so the first tick never reads empty leaf snapshots.
    state.leaf_manager.refresh_all().await;
    tasks.push(tokio::spawn(state.engine.clone().run_tick_loop(
        Duration::from_secs(state.config.composite_base_step_secs),
    )));

    // ── 6. API server ────────────────────────────────────────────────────
    let app = api::rest::router(state.clone());
    let listener = tokio::net::TcpListener::bind(&state.config.bind_addr)
        .await
        .with_context(|| format!("failed to bind {}", state.config.bind_addr))?;
    info!(addr = %state.config.bind_addr, "API server listening");
    tasks.push(tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            warn!(error = %e, "API server stopped");
        }
    }));

    info!("all subsystems running — press Ctrl+C to stop");

    // ── 7. Shutdown ──────────────────────────────────────────────────────
    tokio::signal::ctrl_c().await?;
    warn!("shutdown signal received — stopping");
    for task in &tasks {
        task.abort();
    }

    info!("PulseWatch shut down complete");
    Ok(())
}
