//! `genflow config` command implementation

use colored::Colorize;
use genflow_core::Settings;

use crate::error::Result;

/// Show the effective configuration
pub fn show(settings: &Settings, show_passwords: bool) -> Result<()> {
    println!("{}", "Genflow Configuration:".cyan().bold());
    println!();
    print!("{}", settings.display(show_passwords));
    println!();
    println!("{}", "Environment Variables:".cyan());
    println!("  GENFLOW_CONFIG              - Configuration file (default: genflow.toml)");
    println!("  GENFLOW_DATABASE__URL       - Database URL");
    println!("  GENFLOW_DATABASE__PASSWORD  - Database password");
    println!("  GENFLOW_ENGINE__BATCH_SIZE  - Rows per batch");
    println!("  GENFLOW_LOG_LEVEL           - Log level");
    Ok(())
}
