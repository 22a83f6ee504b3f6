//! Referral commissions and investment accrual for the Horizon platform.

pub mod accrual;
pub mod api;
pub mod balance;
pub mod config;
pub mod error;
pub mod graph;
pub mod maturity;
pub mod referral;
pub mod registration;
pub mod responses;
pub mod session;
pub mod store;
pub mod types;

use anyhow::Context;
use anyhow::Result;
pub use api::{AppState, init_router};
use sqlx::{PgPool, postgres::PgPoolOptions};

/// Initializes the database pool and applies pending migrations.
pub async fn init_pool(config: &config::Config) -> Result<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(config.database_max_connections)
        .connect(&config.database_url)
        .await
        .context("Failed to connect to Postgres")?;
    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .context("Failed to run migrations")?;
    Ok(pool)
}
