//! Connection pool setup

use anyhow::{Context, Result};
use expense_core::PipelineConfig;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use std::time::Duration;

pub async fn connect_pool(config: &PipelineConfig) -> Result<PgPool> {
    let database_url = config
        .database_url
        .as_deref()
        .context("EXPENSE_DATABASE_URL is not set")?;

    tracing::info!("Connecting to database...");
    let pool = PgPoolOptions::new()
        .max_connections(config.db_max_connections)
        .acquire_timeout(Duration::from_secs(30))
        .idle_timeout(Duration::from_secs(600))
        .max_lifetime(Duration::from_secs(1800))
        .connect(database_url)
        .await
        .context("Failed to connect to database")?;

    tracing::info!(
        max_connections = config.db_max_connections,
        "Database connected"
    );

    Ok(pool)
}
