//! Store abstraction used by the execution engine
//!
//! A [`Session`] is one transaction on one connection. The engine opens one
//! per running generator, streams the extraction through a cursor on it and
//! writes every load inside it, then commits once.

use async_trait::async_trait;
use genflow_common::{SqlType, Value};

use crate::config::DatabaseConfig;
use crate::error::DatabaseError;
use crate::generator::LoadMode;

/// SQL ready to run as an extraction
#[derive(Debug, Clone, PartialEq)]
pub struct ExtractPlan {
    pub sql: String,
    pub binds: Vec<Value>,
    pub outputs: Vec<String>,
}

/// Rows for one load, key column first
#[derive(Debug, Clone, PartialEq)]
pub struct LoadBatch {
    pub table: String,
    pub mode: LoadMode,
    /// Key column followed by the assigned columns
    pub columns: Vec<String>,
    pub types: Vec<SqlType>,
    pub rows: Vec<Vec<Value>>,
}

impl LoadBatch {
    pub fn key_column(&self) -> &str {
        &self.columns[0]
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

#[async_trait]
pub trait Store: Send + Sync {
    /// Open a transaction on the target database
    async fn begin(&self) -> Result<Box<dyn Session>, DatabaseError>;

    /// Open a read transaction on another database
    async fn begin_external(&self, config: &DatabaseConfig) -> Result<Box<dyn Session>, DatabaseError>;

    /// Run statements in order inside one transaction
    async fn execute_batch(&self, statements: &[String]) -> Result<(), DatabaseError>;
}

#[async_trait]
pub trait Session: Send {
    /// Number of rows the extraction would return
    async fn count(&mut self, plan: &ExtractPlan) -> Result<u64, DatabaseError>;

    async fn open_cursor(&mut self, plan: &ExtractPlan) -> Result<(), DatabaseError>;

    /// Next `n` rows from the cursor; fewer (or none) at the end
    async fn fetch(&mut self, n: usize) -> Result<Vec<Vec<Value>>, DatabaseError>;

    async fn close_cursor(&mut self) -> Result<(), DatabaseError>;

    async fn savepoint(&mut self) -> Result<(), DatabaseError>;

    async fn rollback_to_savepoint(&mut self) -> Result<(), DatabaseError>;

    async fn release_savepoint(&mut self) -> Result<(), DatabaseError>;

    /// Write the batch; `bulk` selects the COPY path. Returns rows affected.
    async fn write(&mut self, batch: &LoadBatch, bulk: bool) -> Result<u64, DatabaseError>;

    async fn commit(self: Box<Self>) -> Result<(), DatabaseError>;

    async fn rollback(self: Box<Self>) -> Result<(), DatabaseError>;
}
