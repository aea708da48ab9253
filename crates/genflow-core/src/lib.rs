//! Genflow Core Library
#![deny(clippy::unwrap_used, clippy::expect_used)]
//!
//! Declarative ETL into a relational store: a schema of entities and
//! relations, generators that extract, transform and load rows, and an engine
//! that runs them in dependency order.
//!
//! # Overview
//!
//! - **Schema**: entities, attributes, relations and join paths, plus DDL
//! - **Expressions**: a typed expression tree compiled to parameterized SQL
//! - **Nodes**: constants, argument references and pure transform blocks
//! - **Hashing**: content-addressable surrogate keys from identifying values
//! - **Generators**: one extraction, ordered transform blocks and loads
//! - **Model**: the validated registry and its generator dependency graph
//! - **Engine**: streaming extraction, batched or bulk loads, bounded retry
//!
//! # Example
//!
//! ```no_run
//! use genflow_common::SqlType;
//! use genflow_core::expr::col;
//! use genflow_core::{Arg, Attribute, Entity, Generator, Load, ModelBuilder, Query};
//!
//! fn build() -> genflow_core::Result<genflow_core::Model> {
//!     let mut builder = ModelBuilder::new("samples");
//!     builder.add_entity(Entity::new("raw_sample").attr(Attribute::new("code", SqlType::Text)))?;
//!     builder.add_entity(Entity::new("sample").attr(Attribute::new("code", SqlType::Text).identifying()))?;
//!
//!     let raw = builder.make_path("raw_sample", &[])?;
//!     let query = Query::new(["raw_sample"]).select("code", col(&raw, "code"));
//!     builder.add_generator(
//!         Generator::new("samples")
//!             .query(query)
//!             .load(Load::insert("sample").value("code", Arg::query("code"))),
//!     )?;
//!     builder.build()
//! }
//! ```

pub mod config;
pub mod db;
pub mod engine;
pub mod error;
pub mod expr;
pub mod generator;
pub mod hashing;
pub mod log;
pub mod model;
pub mod nodes;
pub mod query;
pub mod scheduler;
pub mod schema;
pub mod sql;

// Re-export commonly used types
pub use config::{DatabaseConfig, EngineConfig, Settings};
pub use engine::{Engine, GeneratorOutcome, RunReport, TestMode, TestReport};
pub use error::{
    ArityError, CompilationError, ConfigError, DatabaseError, EngineError, Result, SchedulerError, SchemaError, Stage,
    StageError,
};
pub use expr::Expr;
pub use generator::{Generator, Load, LoadMode};
pub use hashing::compute_key;
pub use model::{Model, ModelBuilder};
pub use nodes::{Arg, TransformBlock};
pub use query::{Query, RawQuery};
pub use scheduler::RunFilter;
pub use schema::{Attribute, Entity, Path, Relation, Schema};
