use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use horizon_referrals::{
    AppState, config::Config, init_pool, init_router, maturity, store::PgStore,
};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::info;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::from_env().context("invalid configuration")?;
    let pool = init_pool(&config).await?;
    let backend = Arc::new(PgStore::new(pool));
    let state = AppState::new(backend.clone(), config.clone());
    let sessions = Arc::clone(&state.sessions);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let sweeper = (config.maturity_sweep_secs > 0).then(|| {
        maturity::spawn_sweeper(
            backend.clone(),
            config.default_cycle_days,
            Duration::from_secs(config.maturity_sweep_secs),
            shutdown_rx,
        )
    });

    let addr: SocketAddr = ([0, 0, 0, 0], config.server_port).into();
    let listener = TcpListener::bind(addr).await?;
    info!(%addr, "listening");

    axum::serve(listener, init_router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("shutting down");
    let _ = shutdown_tx.send(true);
    if let Some(sweeper) = sweeper {
        sweeper.await.context("maturity sweeper panicked")?;
    }
    sessions.stop_all().await;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("failed to listen for ctrl-c: {e}");
        std::future::pending::<()>().await;
    }
}
