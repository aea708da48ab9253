//! `genflow ping` command implementation

use colored::Colorize;
use genflow_core::config::mask_url_password;
use genflow_core::db::{create_pool, health_check};
use genflow_core::Settings;

use crate::error::Result;

/// Connect to the target database and the completion log database
pub async fn run(settings: &Settings) -> Result<()> {
    let mut databases = vec![("database", &settings.database)];
    if let Some(ref log_db) = settings.log_database {
        databases.push(("log_database", log_db));
    }

    for (section, config) in databases {
        let pool = create_pool(config).await?;
        health_check(&pool).await?;
        pool.close().await;
        println!("{} {} ({})", "✓".green(), section, mask_url_password(&config.url));
    }
    Ok(())
}
