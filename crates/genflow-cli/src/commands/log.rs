//! `genflow init-log` and `genflow log` command implementations

use colored::Colorize;
use comfy_table::{modifiers::UTF8_ROUND_CORNERS, presets::UTF8_FULL, Table};
use genflow_core::db::create_pool;
use genflow_core::log::{CompletionLog, GeneratorRunRecord, PgCompletionLog, RunStatus};
use genflow_core::Settings;

use crate::error::Result;

async fn open(settings: &Settings) -> Result<PgCompletionLog> {
    let pool = create_pool(settings.log_database()).await?;
    Ok(PgCompletionLog::new(pool, settings.log_schema.clone()))
}

/// Create the completion log schema and tables
pub async fn init(settings: &Settings) -> Result<()> {
    open(settings).await?.ensure_schema().await?;
    println!("{} Completion log ready in schema '{}'", "✓".green(), settings.log_schema);
    Ok(())
}

/// List the most recent generator runs, newest first
pub async fn list(settings: &Settings, limit: i64) -> Result<()> {
    let records = open(settings).await?.recent(limit).await?;
    if records.is_empty() {
        println!("No generator runs recorded");
        return Ok(());
    }
    println!("{}", records_table(&records));
    Ok(())
}

fn records_table(records: &[GeneratorRunRecord]) -> Table {
    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .apply_modifier(UTF8_ROUND_CORNERS)
        .set_header(vec!["Finished", "Generator", "Status", "Extracted", "Loaded", "Error", "Run"]);

    for record in records {
        let status = match record.status {
            RunStatus::Completed => record.status.to_string(),
            RunStatus::Failed => match record.stage {
                Some(stage) => format!("failed ({})", stage),
                None => record.status.to_string(),
            },
        };
        table.add_row(vec![
            record.finished_at.format("%Y-%m-%d %H:%M:%S").to_string(),
            record.generator.clone(),
            status,
            record.rows_extracted.to_string(),
            record.rows_loaded.to_string(),
            record.error.clone().unwrap_or_default(),
            record.run_id.to_string(),
        ]);
    }
    table
}
