//! Engine error types
//!
//! One type per failure family. [`EngineError`] is the umbrella carried through
//! the execution engine; failures inside a generator run are additionally
//! attributed to a [`Stage`].

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use genflow_common::CoercionError;

/// SQLSTATE codes retried by the load retry policy
pub const TRANSIENT_SQLSTATES: &[&str] = &[
    "40P01", // deadlock_detected
    "55P03", // lock_not_available
    "40001", // serialization_failure
];

/// Result type alias for engine operations
pub type Result<T> = std::result::Result<T, EngineError>;

/// Invalid schema or generator declaration, raised while building the model
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SchemaError {
    #[error("Duplicate {kind} name '{name}'")]
    DuplicateName { kind: &'static str, name: String },

    #[error("Unknown entity '{0}'")]
    UnknownEntity(String),

    #[error("Unknown relation '{0}'")]
    UnknownRelation(String),

    #[error("Entity '{entity}' has no attribute or relation named '{attribute}'")]
    UnknownAttribute { entity: String, attribute: String },

    #[error("Relation '{relation}' references unregistered entity '{entity}'")]
    UnregisteredEndpoint { relation: String, entity: String },

    #[error("Path to '{target}' is broken at relation '{relation}': {detail}")]
    BrokenPath {
        target: String,
        relation: String,
        detail: String,
    },

    #[error("Path ends at '{actual}', expected '{expected}'")]
    PathTarget { expected: String, actual: String },

    #[error("Invalid generator '{generator}': {reason}")]
    InvalidGenerator { generator: String, reason: String },
}

impl SchemaError {
    pub fn invalid_generator(generator: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidGenerator {
            generator: generator.into(),
            reason: reason.into(),
        }
    }
}

/// An expression could not be rendered to SQL given its basis and grouping
#[derive(Error, Debug, Clone, PartialEq)]
#[error("Cannot compile {context}: {reason}")]
pub struct CompilationError {
    pub context: String,
    pub reason: String,
}

impl CompilationError {
    pub fn new(context: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            context: context.into(),
            reason: reason.into(),
        }
    }
}

/// Failure reported by the relational store
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DatabaseError {
    /// Deadlock, lock timeout or serialization failure; safe to retry
    #[error("Transient database error [{code}]: {message}")]
    Transient { code: String, message: String },

    /// Anything else: constraint violation, connectivity loss, bad SQL
    #[error("Database error{}: {message}", .code.as_deref().map(|c| format!(" [{}]", c)).unwrap_or_default())]
    Fatal { code: Option<String>, message: String },
}

impl DatabaseError {
    pub fn is_transient(&self) -> bool {
        matches!(self, DatabaseError::Transient { .. })
    }

    pub fn code(&self) -> Option<&str> {
        match self {
            DatabaseError::Transient { code, .. } => Some(code),
            DatabaseError::Fatal { code, .. } => code.as_deref(),
        }
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        DatabaseError::Fatal {
            code: None,
            message: message.into(),
        }
    }

    /// Classify a SQLSTATE; transient codes become [`DatabaseError::Transient`]
    pub fn from_sqlstate(code: impl Into<String>, message: impl Into<String>) -> Self {
        let code = code.into();
        if TRANSIENT_SQLSTATES.contains(&code.as_str()) {
            DatabaseError::Transient {
                code,
                message: message.into(),
            }
        } else {
            DatabaseError::Fatal {
                code: Some(code),
                message: message.into(),
            }
        }
    }
}

impl From<sqlx::Error> for DatabaseError {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::Database(db) => match db.code() {
                Some(code) => DatabaseError::from_sqlstate(code.into_owned(), db.message()),
                None => DatabaseError::fatal(db.message()),
            },
            _ => DatabaseError::fatal(err.to_string()),
        }
    }
}

/// A transform block received or produced misaligned columns
#[derive(Error, Debug, Clone, PartialEq)]
#[error("Arity mismatch in generator '{generator}', node '{node}': {detail}")]
pub struct ArityError {
    pub generator: String,
    pub node: String,
    pub detail: String,
}

/// Dependency graph or run filter could not produce a schedule
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SchedulerError {
    #[error("Dependency cycle among generators: {}", .0.join(", "))]
    Cycle(Vec<String>),

    #[error("Unknown generator or tag '{0}'")]
    UnknownGenerator(String),

    #[error("Start generator '{start}' comes after until generator '{until}'")]
    EmptyRange { start: String, until: String },
}

/// Configuration could not be loaded or is invalid
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// A transform block's function returned an error
#[derive(Error, Debug, Clone, PartialEq)]
#[error("Transform block '{block}' in generator '{generator}' failed: {message}")]
pub struct TransformError {
    pub generator: String,
    pub block: String,
    pub message: String,
}

/// Pipeline stage of a generator run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Extract,
    Transform,
    Load,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Extract => "extract",
            Stage::Transform => "transform",
            Stage::Load => "load",
        }
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Stage {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "extract" => Ok(Stage::Extract),
            "transform" => Ok(Stage::Transform),
            "load" => Ok(Stage::Load),
            other => Err(format!("unknown stage '{}'", other)),
        }
    }
}

/// Umbrella error for model building and execution
#[derive(Error, Debug)]
pub enum EngineError {
    #[error(transparent)]
    Schema(#[from] SchemaError),

    #[error(transparent)]
    Compilation(#[from] CompilationError),

    #[error(transparent)]
    Coercion(#[from] CoercionError),

    #[error(transparent)]
    Database(#[from] DatabaseError),

    #[error("Load gave up after {attempts} attempts: {last}")]
    RetriesExhausted { attempts: u32, last: DatabaseError },

    #[error(transparent)]
    Arity(#[from] ArityError),

    #[error(transparent)]
    Scheduler(#[from] SchedulerError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Transform(#[from] TransformError),

    #[error("Generator task aborted: {0}")]
    Aborted(String),

    #[error("{0}")]
    Usage(String),
}

/// An engine error attributed to the stage it happened in
#[derive(Error, Debug)]
#[error("{stage} stage failed: {error}")]
pub struct StageError {
    pub stage: Stage,
    #[source]
    pub error: EngineError,
}

impl StageError {
    pub fn new(stage: Stage, error: impl Into<EngineError>) -> Self {
        Self {
            stage,
            error: error.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sqlstate_classification() {
        assert!(DatabaseError::from_sqlstate("40P01", "deadlock detected").is_transient());
        assert!(DatabaseError::from_sqlstate("55P03", "lock timeout").is_transient());
        assert!(DatabaseError::from_sqlstate("40001", "could not serialize").is_transient());

        let unique = DatabaseError::from_sqlstate("23505", "duplicate key");
        assert!(!unique.is_transient());
        assert_eq!(unique.code(), Some("23505"));
        assert_eq!(unique.to_string(), "Database error [23505]: duplicate key");
    }

    #[test]
    fn test_cycle_message_names_members() {
        let err = SchedulerError::Cycle(vec!["a".into(), "b".into()]);
        assert_eq!(err.to_string(), "Dependency cycle among generators: a, b");
    }

    #[test]
    fn test_stage_round_trip() {
        for stage in [Stage::Extract, Stage::Transform, Stage::Load] {
            assert_eq!(stage.as_str().parse::<Stage>(), Ok(stage));
        }
    }
}
