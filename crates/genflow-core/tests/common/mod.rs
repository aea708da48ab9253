//! Shared helpers for Postgres integration tests
//!
//! Each test starts its own container; tests are also marked `#[serial]` so
//! that only one container runs at a time.

#![allow(dead_code)]

use anyhow::{Context, Result};
use genflow_core::{DatabaseConfig, Settings};
use sqlx::PgPool;
use testcontainers::core::IntoContainerPort;
use testcontainers::runners::AsyncRunner;
use testcontainers::ContainerAsync;
use testcontainers_modules::postgres::Postgres;
use tracing::{debug, info};

pub struct TestPostgres {
    _container: ContainerAsync<Postgres>,
    pool: PgPool,
    connection_string: String,
}

impl TestPostgres {
    pub async fn start() -> Result<Self> {
        info!("Starting PostgreSQL test container...");
        let container = Postgres::default()
            .start()
            .await
            .context("Failed to start PostgreSQL container")?;
        let host = container.get_host().await.context("Failed to get container host")?;
        let port = container
            .get_host_port_ipv4(5432.tcp())
            .await
            .context("Failed to get container port")?;
        let connection_string = format!("postgresql://postgres:postgres@{}:{}/postgres", host, port);
        debug!("PostgreSQL connection: {}", connection_string);

        let pool = PgPool::connect(&connection_string)
            .await
            .context("Failed to connect to PostgreSQL")?;
        Ok(Self {
            _container: container,
            pool,
            connection_string,
        })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Settings pointing the engine and the completion log at this container
    pub fn settings(&self) -> Settings {
        let mut settings = Settings {
            database: DatabaseConfig::new(&self.connection_string),
            ..Settings::default()
        };
        settings.engine.retry_backoff_ms = 10;
        settings
    }
}

pub fn init_test_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};

    let _ = fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,genflow_core=debug,sqlx=warn,testcontainers=info")),
        )
        .with_test_writer()
        .try_init();
}
