//! Genflow Common Library
#![deny(clippy::unwrap_used, clippy::expect_used)]
//!
//! Shared value vocabulary, coercion errors and logging for the Genflow workspace.
//!
//! # Overview
//!
//! - **Types**: the declared semantic types ([`SqlType`]) and runtime values ([`Value`])
//! - **Coercion**: canonicalization of values to their declared type, the only
//!   implicit conversion performed anywhere in the pipeline
//! - **Logging**: tracing subscriber setup shared by the engine and the CLI
//!
//! # Example
//!
//! ```
//! use genflow_common::{SqlType, Value};
//!
//! let canonical = SqlType::Int.coerce(&Value::Text(" 42 ".into()), false).unwrap();
//! assert_eq!(canonical, Value::Int(42));
//! ```

pub mod error;
pub mod logging;
pub mod types;

// Re-export commonly used types
pub use error::{CoercionError, Result};
pub use types::{SqlType, Value};
