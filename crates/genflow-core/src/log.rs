//! Completion log
//!
//! Append-only record of generator runs. A generator whose latest entry for
//! its current fingerprint is `completed` is skipped by later runs unless the
//! run filter asks for a retry.

use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::{DatabaseError, Stage};
use crate::sql::quote_ident;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Completed,
    Failed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
        }
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for RunStatus {
    type Err = DatabaseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "completed" => Ok(RunStatus::Completed),
            "failed" => Ok(RunStatus::Failed),
            other => Err(DatabaseError::fatal(format!("unknown run status '{}'", other))),
        }
    }
}

/// Outcome of one generator within one run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeneratorRunRecord {
    pub run_id: Uuid,
    pub generator: String,
    pub fingerprint: String,
    pub status: RunStatus,
    pub stage: Option<Stage>,
    pub error: Option<String>,
    pub rows_extracted: u64,
    pub rows_loaded: u64,
    pub finished_at: DateTime<Utc>,
}

#[async_trait]
pub trait CompletionLog: Send + Sync {
    /// Create the log schema and tables if missing
    async fn ensure_schema(&self) -> Result<(), DatabaseError>;

    /// Register a new run and return its id
    async fn start_run(&self, generators: &[String]) -> Result<Uuid, DatabaseError>;

    async fn record(&self, record: &GeneratorRunRecord) -> Result<(), DatabaseError>;

    /// Whether the latest entry for `generator` with `fingerprint` is completed
    async fn is_complete(&self, generator: &str, fingerprint: &str) -> Result<bool, DatabaseError>;

    /// Most recent entries, newest first
    async fn recent(&self, limit: i64) -> Result<Vec<GeneratorRunRecord>, DatabaseError>;
}

#[derive(Debug, sqlx::FromRow)]
struct GeneratorRunRow {
    run_id: Uuid,
    generator: String,
    fingerprint: String,
    status: String,
    stage: Option<String>,
    error: Option<String>,
    rows_extracted: i64,
    rows_loaded: i64,
    finished_at: DateTime<Utc>,
}

impl TryFrom<GeneratorRunRow> for GeneratorRunRecord {
    type Error = DatabaseError;

    fn try_from(row: GeneratorRunRow) -> Result<Self, Self::Error> {
        Ok(Self {
            run_id: row.run_id,
            generator: row.generator,
            fingerprint: row.fingerprint,
            status: row.status.parse()?,
            stage: row
                .stage
                .map(|s| s.parse::<Stage>().map_err(DatabaseError::fatal))
                .transpose()?,
            error: row.error,
            rows_extracted: row.rows_extracted.max(0) as u64,
            rows_loaded: row.rows_loaded.max(0) as u64,
            finished_at: row.finished_at,
        })
    }
}

/// Completion log stored in its own Postgres schema
#[derive(Debug, Clone)]
pub struct PgCompletionLog {
    pool: PgPool,
    schema: String,
}

impl PgCompletionLog {
    pub fn new(pool: PgPool, schema: impl Into<String>) -> Self {
        Self {
            pool,
            schema: schema.into(),
        }
    }

    fn table(&self, name: &str) -> String {
        qualified(&self.schema, name)
    }
}

fn qualified(schema: &str, table: &str) -> String {
    format!("{}.{}", quote_ident(schema), quote_ident(table))
}

/// Statements creating the log schema, in order
pub fn schema_statements(schema: &str) -> Vec<String> {
    let runs = qualified(schema, "runs");
    let generator_runs = qualified(schema, "generator_runs");
    vec![
        format!("CREATE SCHEMA IF NOT EXISTS {}", quote_ident(schema)),
        format!(
            "CREATE TABLE IF NOT EXISTS {} (\n    \
             run_id UUID PRIMARY KEY,\n    \
             generators TEXT[] NOT NULL,\n    \
             started_at TIMESTAMPTZ NOT NULL DEFAULT now()\n)",
            runs
        ),
        format!(
            "CREATE TABLE IF NOT EXISTS {} (\n    \
             id BIGSERIAL PRIMARY KEY,\n    \
             run_id UUID NOT NULL REFERENCES {} (run_id),\n    \
             generator TEXT NOT NULL,\n    \
             fingerprint TEXT NOT NULL,\n    \
             status TEXT NOT NULL CHECK (status IN ('completed', 'failed')),\n    \
             stage TEXT,\n    \
             error TEXT,\n    \
             rows_extracted BIGINT NOT NULL DEFAULT 0,\n    \
             rows_loaded BIGINT NOT NULL DEFAULT 0,\n    \
             finished_at TIMESTAMPTZ NOT NULL\n)",
            generator_runs, runs
        ),
        format!(
            "CREATE INDEX IF NOT EXISTS generator_runs_lookup ON {} (generator, fingerprint, id DESC)",
            generator_runs
        ),
    ]
}

#[async_trait]
impl CompletionLog for PgCompletionLog {
    async fn ensure_schema(&self) -> Result<(), DatabaseError> {
        let mut tx = self.pool.begin().await?;
        for statement in schema_statements(&self.schema) {
            sqlx::query(&statement).execute(&mut *tx).await?;
        }
        tx.commit().await?;
        info!(schema = %self.schema, "Completion log schema ready");
        Ok(())
    }

    async fn start_run(&self, generators: &[String]) -> Result<Uuid, DatabaseError> {
        let run_id = Uuid::new_v4();
        sqlx::query(&format!("INSERT INTO {} (run_id, generators) VALUES ($1, $2)", self.table("runs")))
            .bind(run_id)
            .bind(generators)
            .execute(&self.pool)
            .await?;
        debug!(%run_id, generators = generators.len(), "Started run");
        Ok(run_id)
    }

    async fn record(&self, record: &GeneratorRunRecord) -> Result<(), DatabaseError> {
        sqlx::query(&format!(
            r#"
            INSERT INTO {} (
                run_id, generator, fingerprint, status, stage, error,
                rows_extracted, rows_loaded, finished_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
            self.table("generator_runs")
        ))
        .bind(record.run_id)
        .bind(&record.generator)
        .bind(&record.fingerprint)
        .bind(record.status.as_str())
        .bind(record.stage.map(|s| s.as_str()))
        .bind(&record.error)
        .bind(i64::try_from(record.rows_extracted).unwrap_or(i64::MAX))
        .bind(i64::try_from(record.rows_loaded).unwrap_or(i64::MAX))
        .bind(record.finished_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn is_complete(&self, generator: &str, fingerprint: &str) -> Result<bool, DatabaseError> {
        let status: Option<String> = sqlx::query_scalar(&format!(
            "SELECT status FROM {} WHERE generator = $1 AND fingerprint = $2 ORDER BY id DESC LIMIT 1",
            self.table("generator_runs")
        ))
        .bind(generator)
        .bind(fingerprint)
        .fetch_optional(&self.pool)
        .await?;
        Ok(status.as_deref() == Some(RunStatus::Completed.as_str()))
    }

    async fn recent(&self, limit: i64) -> Result<Vec<GeneratorRunRecord>, DatabaseError> {
        let rows = sqlx::query_as::<_, GeneratorRunRow>(&format!(
            r#"
            SELECT run_id, generator, fingerprint, status, stage, error,
                   rows_extracted, rows_loaded, finished_at
            FROM {}
            ORDER BY id DESC
            LIMIT $1
            "#,
            self.table("generator_runs")
        ))
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(GeneratorRunRecord::try_from).collect()
    }
}

/// In-process completion log
#[derive(Debug, Default)]
pub struct MemoryCompletionLog {
    runs: Mutex<Vec<(Uuid, Vec<String>)>>,
    records: Mutex<Vec<GeneratorRunRecord>>,
}

impl MemoryCompletionLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<GeneratorRunRecord> {
        self.records.lock().map(|r| r.clone()).unwrap_or_default()
    }

    pub fn run_count(&self) -> usize {
        self.runs.lock().map(|r| r.len()).unwrap_or_default()
    }
}

fn poisoned<T>(_: T) -> DatabaseError {
    DatabaseError::fatal("completion log lock poisoned")
}

#[async_trait]
impl CompletionLog for MemoryCompletionLog {
    async fn ensure_schema(&self) -> Result<(), DatabaseError> {
        Ok(())
    }

    async fn start_run(&self, generators: &[String]) -> Result<Uuid, DatabaseError> {
        let run_id = Uuid::new_v4();
        self.runs.lock().map_err(poisoned)?.push((run_id, generators.to_vec()));
        Ok(run_id)
    }

    async fn record(&self, record: &GeneratorRunRecord) -> Result<(), DatabaseError> {
        self.records.lock().map_err(poisoned)?.push(record.clone());
        Ok(())
    }

    async fn is_complete(&self, generator: &str, fingerprint: &str) -> Result<bool, DatabaseError> {
        let records = self.records.lock().map_err(poisoned)?;
        Ok(records
            .iter()
            .rev()
            .find(|r| r.generator == generator && r.fingerprint == fingerprint)
            .is_some_and(|r| r.status == RunStatus::Completed))
    }

    async fn recent(&self, limit: i64) -> Result<Vec<GeneratorRunRecord>, DatabaseError> {
        let records = self.records.lock().map_err(poisoned)?;
        Ok(records
            .iter()
            .rev()
            .take(usize::try_from(limit).unwrap_or(0))
            .cloned()
            .collect())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn record(run_id: Uuid, status: RunStatus, fingerprint: &str) -> GeneratorRunRecord {
        GeneratorRunRecord {
            run_id,
            generator: "parents".into(),
            fingerprint: fingerprint.into(),
            status,
            stage: (status == RunStatus::Failed).then_some(Stage::Load),
            error: None,
            rows_extracted: 0,
            rows_loaded: 2,
            finished_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_latest_entry_decides_completion() {
        let log = MemoryCompletionLog::new();
        let run = log.start_run(&["parents".into()]).await.unwrap();
        assert!(!log.is_complete("parents", "fp").await.unwrap());

        log.record(&record(run, RunStatus::Completed, "fp")).await.unwrap();
        assert!(log.is_complete("parents", "fp").await.unwrap());
        assert!(!log.is_complete("parents", "other").await.unwrap());

        log.record(&record(run, RunStatus::Failed, "fp")).await.unwrap();
        assert!(!log.is_complete("parents", "fp").await.unwrap());

        let recent = log.recent(1).await.unwrap();
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].status, RunStatus::Failed);
    }

    #[test]
    fn test_schema_statements_are_qualified() {
        let statements = schema_statements("genflow_log");
        assert_eq!(statements[0], "CREATE SCHEMA IF NOT EXISTS \"genflow_log\"");
        assert!(statements[2].contains("REFERENCES \"genflow_log\".\"runs\" (run_id)"));
    }

    #[test]
    fn test_status_parse() {
        assert_eq!("completed".parse::<RunStatus>().unwrap(), RunStatus::Completed);
        assert!("done".parse::<RunStatus>().is_err());
    }
}
