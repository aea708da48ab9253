//! `genflow run` command implementation

use colored::Colorize;
use comfy_table::{modifiers::UTF8_ROUND_CORNERS, presets::UTF8_FULL, Table};
use genflow_core::{Engine, GeneratorOutcome, Model, RunReport, Settings};
use tracing::info;

use crate::error::{CliError, Result};
use crate::RunArgs;

/// Run the selected generators and print one row per generator
pub async fn run(model: Model, settings: &Settings, args: &RunArgs) -> Result<()> {
    let engine = Engine::connect(model, settings).await?;
    if args.create_schema {
        engine.create_schema().await?;
    }

    let report = engine.run(&args.filter()).await?;
    println!("{}", report_table(&report));

    let summary = report.summary();
    info!(run_id = %report.run_id, ?summary, "Run complete");
    if report.is_success() {
        println!(
            "{} {} completed, {} skipped, {} rows loaded",
            "✓".green(),
            summary.completed,
            summary.skipped,
            summary.rows_loaded
        );
        Ok(())
    } else {
        Err(CliError::RunFailed {
            failed: summary.failed,
            not_run: summary.not_run,
        })
    }
}

fn report_table(report: &RunReport) -> Table {
    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .apply_modifier(UTF8_ROUND_CORNERS)
        .set_header(vec!["Generator", "Outcome", "Extracted", "Loaded", "Detail"]);

    for generator in &report.generators {
        let (extracted, loaded, detail) = match &generator.outcome {
            GeneratorOutcome::Completed {
                rows_extracted,
                rows_loaded,
            } => (rows_extracted.to_string(), rows_loaded.to_string(), String::new()),
            GeneratorOutcome::Skipped => ("-".into(), "-".into(), "already complete".into()),
            GeneratorOutcome::Failed(err) => ("-".into(), "-".into(), err.to_string()),
            GeneratorOutcome::NotRun { reason } => ("-".into(), "-".into(), reason.clone()),
        };
        table.add_row(vec![
            generator.name.clone(),
            generator.outcome.label().to_string(),
            extracted,
            loaded,
            detail,
        ]);
    }
    table
}
