//! `genflow test` command implementation
//!
//! Runs one generator in isolation and prints the extracted, transformed and
//! loaded row sets.

use std::sync::Arc;

use colored::Colorize;
use comfy_table::{modifiers::UTF8_ROUND_CORNERS, presets::UTF8_FULL, Table};
use genflow_core::engine::{MemoryStore, RowSet};
use genflow_core::log::MemoryCompletionLog;
use genflow_core::{Engine, Model, Settings, TestMode, TestReport};

use crate::error::Result;

pub async fn run(
    model: Model,
    settings: &Settings,
    generator: &str,
    mode: TestMode,
    json: bool,
    limit: usize,
) -> Result<()> {
    let engine = match mode {
        TestMode::Rollback => Engine::connect(model, settings).await?,
        TestMode::DryRun => Engine::new(
            model,
            Arc::new(MemoryStore::new()),
            Arc::new(MemoryCompletionLog::new()),
            settings.engine.clone(),
        ),
    };
    let report = engine.test_generator(generator, mode).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&report.to_json())?);
    } else {
        print_report(&report, limit);
    }
    Ok(())
}

fn print_report(report: &TestReport, limit: usize) {
    println!("{} {}", "Generator:".cyan().bold(), report.generator);
    if !report.extracted.columns.is_empty() {
        print_rows("Extracted", &report.extracted, limit);
    }
    if !report.transformed.columns.is_empty() {
        print_rows("Transformed", &report.transformed, limit);
    }
    for load in &report.loads {
        let title = format!("Load {} ({} {})", load.load, load.mode.as_str(), load.entity);
        print_rows(&title, &load.rows, limit);
    }
}

fn print_rows(title: &str, rows: &RowSet, limit: usize) {
    println!();
    println!("{} ({} rows)", title.cyan(), rows.len());
    println!("{}", rows_table(rows, limit));
    if rows.len() > limit {
        println!("... {} more", rows.len() - limit);
    }
}

fn rows_table(rows: &RowSet, limit: usize) -> Table {
    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .apply_modifier(UTF8_ROUND_CORNERS)
        .set_header(&rows.columns);
    for row in rows.rows.iter().take(limit) {
        table.add_row(row.iter().map(ToString::to_string).collect::<Vec<_>>());
    }
    table
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use genflow_common::Value;

    use super::*;

    #[test]
    fn test_rows_table_respects_limit() {
        let rows = RowSet {
            columns: vec!["n".into(), "label".into()],
            rows: (1..=5).map(|n| vec![Value::Int(n), Value::Null]).collect(),
        };
        let rendered = rows_table(&rows, 2).to_string();
        assert!(rendered.contains("label"));
        assert!(rendered.contains("NULL"));
        assert!(rendered.contains('2'));
        assert!(!rendered.contains('5'));
    }
}
