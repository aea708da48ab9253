//! Error types for the Genflow CLI
//!
//! Messages are user-facing and say what to check next.

use genflow_core::{ConfigError, DatabaseError, EngineError};
use thiserror::Error;

/// Result type alias for CLI operations
pub type Result<T> = std::result::Result<T, CliError>;

#[derive(Error, Debug)]
pub enum CliError {
    /// A model-dependent command was run from the model-independent binary
    #[error("'{0}' needs a model. Build a binary that calls genflow_cli::run_model with your model.")]
    NoModel(String),

    #[error("Configuration error: {0}. Check genflow.toml and GENFLOW_* environment variables.")]
    Config(#[from] ConfigError),

    #[error("{0}")]
    Engine(#[from] EngineError),

    #[error("Database error: {0}. Check the database url and that the server is reachable.")]
    Database(#[from] DatabaseError),

    /// The run finished but at least one generator did not complete
    #[error("Run failed: {failed} generator(s) failed, {not_run} not run. Fix the failure and rerun; completed generators are skipped.")]
    RunFailed { failed: usize, not_run: usize },

    #[error("Failed to render JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Logging setup failed: {0}")]
    Logging(String),
}
