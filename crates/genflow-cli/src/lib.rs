//! Genflow CLI Library
#![deny(clippy::unwrap_used, clippy::expect_used)]
//!
//! Command-line driver for Genflow models. Model authors build their model in
//! their own binary and hand it to [`run_model`]:
//!
//! ```no_run
//! # fn build_model() -> genflow_core::Model { unimplemented!() }
//! #[tokio::main]
//! async fn main() {
//!     genflow_cli::run_model(build_model()).await;
//! }
//! ```
//!
//! The `genflow` binary shipped with this crate has no model and serves the
//! model-independent commands (`config show`, `ping`, `init-log`, `log list`).

pub mod commands;
pub mod error;

use std::path::PathBuf;
use std::process;

use clap::{Args, Parser, Subcommand};
use genflow_common::logging::{init_logging, LogConfig, LogFormat, LogGuard, LogLevel, LogOutput};
use genflow_core::{Model, RunFilter, Settings, TestMode};
use tracing::error;

pub use error::{CliError, Result};

/// Genflow - declarative ETL into a relational store
#[derive(Parser, Debug)]
#[command(name = "genflow")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Configuration file [default: genflow.toml]
    #[arg(short, long, env = "GENFLOW_CONFIG", global = true)]
    pub config: Option<PathBuf>,

    /// Log level: trace, debug, info, warn, error
    #[arg(long, global = true)]
    pub log_level: Option<LogLevel>,

    /// Log format: text, json
    #[arg(long, global = true)]
    pub log_format: Option<LogFormat>,

    /// Log output: console, file, both
    #[arg(long, global = true)]
    pub log_output: Option<LogOutput>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run generators in dependency order
    Run(RunArgs),

    /// Run one generator without committing and print its row sets
    Test {
        /// Generator name
        generator: String,

        /// Run without touching the database (generators without an extraction only)
        #[arg(long)]
        dry_run: bool,

        /// Print the row sets as JSON
        #[arg(long)]
        json: bool,

        /// Rows shown per table
        #[arg(long, default_value = "20")]
        limit: usize,
    },

    /// Print the DDL creating the model's tables
    Ddl,

    /// Print generators in run order with their dependencies
    Graph,

    /// Inspect configuration
    Config {
        #[command(subcommand)]
        command: ConfigCommand,
    },

    /// Check database connectivity
    Ping,

    /// Create the completion log schema
    InitLog,

    /// Inspect the completion log
    Log {
        #[command(subcommand)]
        command: LogCommand,
    },
}

#[derive(Args, Debug, Default)]
pub struct RunArgs {
    /// Only run these generators or tags (repeatable, comma-separated)
    #[arg(long, value_delimiter = ',')]
    pub only: Vec<String>,

    /// Skip these generators or tags (repeatable, comma-separated)
    #[arg(long, value_delimiter = ',')]
    pub exclude: Vec<String>,

    /// Start the run order at this generator
    #[arg(long)]
    pub start: Option<String>,

    /// End the run order at this generator
    #[arg(long)]
    pub until: Option<String>,

    /// Rerun generators the completion log marks as complete
    #[arg(long)]
    pub retry: bool,

    /// Run one generator at a time
    #[arg(long)]
    pub serial: bool,

    /// Rows per batch for generators without their own batch size
    #[arg(long, value_parser = clap::value_parser!(u64).range(1..))]
    pub batch: Option<u64>,

    /// Do not count source rows before extracting
    #[arg(long)]
    pub skip_row_count: bool,

    /// Keep running independent generators after a failure
    #[arg(long)]
    pub keep_going: bool,

    /// Create the model's tables and the completion log before running
    #[arg(long)]
    pub create_schema: bool,
}

impl RunArgs {
    pub fn filter(&self) -> RunFilter {
        RunFilter {
            only: self.only.clone(),
            exclude: self.exclude.clone(),
            start: self.start.clone(),
            until: self.until.clone(),
            retry: self.retry,
            serial: self.serial,
            batch_size: self.batch.map(|b| b as usize),
            skip_row_count: self.skip_row_count,
            keep_going: self.keep_going,
        }
    }
}

#[derive(Subcommand, Debug)]
pub enum ConfigCommand {
    /// Show the effective configuration
    Show {
        /// Print passwords instead of masking them
        #[arg(long)]
        show_passwords: bool,
    },
}

#[derive(Subcommand, Debug)]
pub enum LogCommand {
    /// List the most recent generator runs
    List {
        #[arg(long, default_value = "20")]
        limit: i64,
    },
}

impl Cli {
    /// Logging configuration: CLI flags over environment over defaults
    pub fn log_config(&self) -> Result<LogConfig> {
        let base = LogConfig::builder()
            .level(LogLevel::Info)
            .output(LogOutput::Console)
            .log_file_prefix("genflow")
            .build();
        let mut config = base.merge_env().map_err(|e| CliError::Logging(e.to_string()))?;
        if let Some(level) = self.log_level {
            config.level = level;
        }
        if let Some(format) = self.log_format {
            config.format = format;
        }
        if let Some(output) = self.log_output {
            config.output = output;
        }
        Ok(config)
    }
}

/// Parse arguments and drive `model`; exits with status 1 on failure
pub async fn run_model(model: Model) {
    main_with(Some(model)).await
}

/// Process entry point shared by [`run_model`] and the `genflow` binary
pub async fn main_with(model: Option<Model>) {
    let cli = Cli::parse();

    // The CLI keeps working without logging
    let _guard: Option<LogGuard> = match cli.log_config() {
        Ok(config) => init_logging(&config).ok(),
        Err(e) => {
            eprintln!("Warning: {}", e);
            None
        },
    };

    if let Err(e) = execute(&cli, model).await {
        error!(error = %e, "Command failed");
        eprintln!("Error: {}", e);
        process::exit(1);
    }
}

/// Execute the parsed command
pub async fn execute(cli: &Cli, model: Option<Model>) -> Result<()> {
    let settings = || Settings::load(cli.config.as_deref());

    match &cli.command {
        Commands::Run(args) => {
            let model = require_model(model, "run")?;
            commands::run::run(model, &settings()?, args).await
        },
        Commands::Test {
            generator,
            dry_run,
            json,
            limit,
        } => {
            let model = require_model(model, "test")?;
            let mode = if *dry_run { TestMode::DryRun } else { TestMode::Rollback };
            let settings = match mode {
                TestMode::DryRun => Settings::default(),
                TestMode::Rollback => settings()?,
            };
            commands::test::run(model, &settings, generator, mode, *json, *limit).await
        },
        Commands::Ddl => commands::ddl::run(&require_model(model, "ddl")?),
        Commands::Graph => commands::graph::run(&require_model(model, "graph")?),
        Commands::Config { command } => match command {
            ConfigCommand::Show { show_passwords } => commands::config::show(&settings()?, *show_passwords),
        },
        Commands::Ping => commands::ping::run(&settings()?).await,
        Commands::InitLog => commands::log::init(&settings()?).await,
        Commands::Log { command } => match command {
            LogCommand::List { limit } => commands::log::list(&settings()?, *limit).await,
        },
    }
}

fn require_model(model: Option<Model>, command: &str) -> Result<Model> {
    model.ok_or_else(|| CliError::NoModel(command.to_string()))
}
