//! Postgres connection pool

use sqlx::postgres::{PgConnectOptions, PgPool, PgPoolOptions};
use std::str::FromStr;
use std::time::Duration;

use crate::config::DatabaseConfig;
use crate::error::DatabaseError;

/// Connect options for `config`: explicit password and `search_path` applied on
/// top of whatever the URL carries.
pub fn connect_options(config: &DatabaseConfig) -> Result<PgConnectOptions, DatabaseError> {
    let mut options = PgConnectOptions::from_str(&config.url)
        .map_err(|e| DatabaseError::fatal(format!("Invalid database URL: {}", e)))?;

    if let Some(ref password) = config.password {
        options = options.password(password);
    }
    if let Some(ref schema) = config.schema {
        options = options.options([("search_path", format!("{},public", schema))]);
    }
    Ok(options)
}

pub async fn create_pool(config: &DatabaseConfig) -> Result<PgPool, DatabaseError> {
    let mut options = PgPoolOptions::new()
        .max_connections(config.max_connections)
        .min_connections(config.min_connections)
        .acquire_timeout(Duration::from_secs(config.connect_timeout_secs));

    if let Some(idle_timeout) = config.idle_timeout_secs {
        options = options.idle_timeout(Duration::from_secs(idle_timeout));
    }

    let pool = options.connect_with(connect_options(config)?).await?;

    tracing::info!(
        max_connections = config.max_connections,
        min_connections = config.min_connections,
        schema = config.schema.as_deref().unwrap_or("public"),
        "Database connection pool created"
    );

    Ok(pool)
}

pub async fn health_check(pool: &PgPool) -> Result<(), DatabaseError> {
    sqlx::query("SELECT 1")
        .execute(pool)
        .await
        .map(|_| ())
        .map_err(DatabaseError::from)
}
