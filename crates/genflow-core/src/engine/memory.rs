//! In-process store
//!
//! Extraction results are registered per SQL text; loads are buffered per
//! session and applied to the shared tables on commit. Write failures can be
//! queued to exercise retry and abort paths without a database.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use genflow_common::Value;

use super::store::{ExtractPlan, LoadBatch, Session, Store};
use crate::config::DatabaseConfig;
use crate::error::DatabaseError;
use crate::generator::LoadMode;

/// Rows of one table keyed by surrogate key
pub type TableRows = BTreeMap<i64, BTreeMap<String, Value>>;

#[derive(Debug, Default)]
struct State {
    results: HashMap<String, Vec<Vec<Value>>>,
    tables: BTreeMap<String, TableRows>,
    write_failures: VecDeque<DatabaseError>,
    write_attempts: usize,
    bulk_writes: usize,
    fetch_sizes: Vec<usize>,
    external: Vec<String>,
    executed: Vec<String>,
    commits: usize,
}

#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    state: Arc<Mutex<State>>,
}

fn lock(state: &Mutex<State>) -> Result<MutexGuard<'_, State>, DatabaseError> {
    state
        .lock()
        .map_err(|_| DatabaseError::fatal("memory store lock poisoned"))
}

/// Apply `batch` to `rows`, returning the number of rows inserted or updated
fn apply(rows: &mut TableRows, batch: &LoadBatch) -> u64 {
    let mut affected = 0;
    for row in &batch.rows {
        let Some(key) = row.first().and_then(Value::as_i64) else {
            continue;
        };
        let values = batch.columns.iter().skip(1).cloned().zip(row.iter().skip(1).cloned());
        match batch.mode {
            LoadMode::Insert => {
                if !rows.contains_key(&key) {
                    rows.insert(key, values.collect());
                    affected += 1;
                }
            },
            LoadMode::Update => {
                if let Some(existing) = rows.get_mut(&key) {
                    existing.extend(values);
                    affected += 1;
                }
            },
        }
    }
    affected
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rows returned for an extraction whose SQL equals `sql`
    pub fn register_rows(&self, sql: impl Into<String>, rows: Vec<Vec<Value>>) {
        if let Ok(mut state) = self.state.lock() {
            state.results.insert(sql.into(), rows);
        }
    }

    /// Fail the next write attempts with `errors`, in order
    pub fn fail_writes(&self, errors: impl IntoIterator<Item = DatabaseError>) {
        if let Ok(mut state) = self.state.lock() {
            state.write_failures.extend(errors);
        }
    }

    /// Committed rows of `table`
    pub fn table(&self, table: &str) -> TableRows {
        self.state
            .lock()
            .ok()
            .and_then(|s| s.tables.get(table).cloned())
            .unwrap_or_default()
    }

    pub fn row_count(&self, table: &str) -> usize {
        self.table(table).len()
    }

    pub fn write_attempts(&self) -> usize {
        self.state.lock().map(|s| s.write_attempts).unwrap_or_default()
    }

    pub fn bulk_writes(&self) -> usize {
        self.state.lock().map(|s| s.bulk_writes).unwrap_or_default()
    }

    /// Sizes requested by every cursor fetch, in order
    pub fn fetch_sizes(&self) -> Vec<usize> {
        self.state.lock().map(|s| s.fetch_sizes.clone()).unwrap_or_default()
    }

    /// URLs of external databases sessions were opened on
    pub fn external_connections(&self) -> Vec<String> {
        self.state.lock().map(|s| s.external.clone()).unwrap_or_default()
    }

    pub fn executed(&self) -> Vec<String> {
        self.state.lock().map(|s| s.executed.clone()).unwrap_or_default()
    }

    pub fn commits(&self) -> usize {
        self.state.lock().map(|s| s.commits).unwrap_or_default()
    }

    fn session(&self) -> Box<dyn Session> {
        Box::new(MemorySession {
            state: Arc::clone(&self.state),
            cursor: None,
            pending: Vec::new(),
            savepoint: None,
        })
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn begin(&self) -> Result<Box<dyn Session>, DatabaseError> {
        Ok(self.session())
    }

    async fn begin_external(&self, config: &DatabaseConfig) -> Result<Box<dyn Session>, DatabaseError> {
        lock(&self.state)?.external.push(config.url.clone());
        Ok(self.session())
    }

    async fn execute_batch(&self, statements: &[String]) -> Result<(), DatabaseError> {
        lock(&self.state)?.executed.extend(statements.iter().cloned());
        Ok(())
    }
}

struct MemorySession {
    state: Arc<Mutex<State>>,
    cursor: Option<VecDeque<Vec<Value>>>,
    pending: Vec<LoadBatch>,
    savepoint: Option<usize>,
}

impl MemorySession {
    fn result(&self, plan: &ExtractPlan) -> Result<Vec<Vec<Value>>, DatabaseError> {
        lock(&self.state)?
            .results
            .get(&plan.sql)
            .cloned()
            .ok_or_else(|| DatabaseError::fatal(format!("no rows registered for query: {}", plan.sql)))
    }
}

#[async_trait]
impl Session for MemorySession {
    async fn count(&mut self, plan: &ExtractPlan) -> Result<u64, DatabaseError> {
        Ok(self.result(plan)?.len() as u64)
    }

    async fn open_cursor(&mut self, plan: &ExtractPlan) -> Result<(), DatabaseError> {
        self.cursor = Some(self.result(plan)?.into());
        Ok(())
    }

    async fn fetch(&mut self, n: usize) -> Result<Vec<Vec<Value>>, DatabaseError> {
        lock(&self.state)?.fetch_sizes.push(n);
        let cursor = self
            .cursor
            .as_mut()
            .ok_or_else(|| DatabaseError::fatal("no open cursor"))?;
        let take = n.min(cursor.len());
        Ok(cursor.drain(..take).collect())
    }

    async fn close_cursor(&mut self) -> Result<(), DatabaseError> {
        self.cursor = None;
        Ok(())
    }

    async fn savepoint(&mut self) -> Result<(), DatabaseError> {
        self.savepoint = Some(self.pending.len());
        Ok(())
    }

    async fn rollback_to_savepoint(&mut self) -> Result<(), DatabaseError> {
        let mark = self
            .savepoint
            .ok_or_else(|| DatabaseError::fatal("no active savepoint"))?;
        self.pending.truncate(mark);
        Ok(())
    }

    async fn release_savepoint(&mut self) -> Result<(), DatabaseError> {
        self.savepoint = None;
        Ok(())
    }

    async fn write(&mut self, batch: &LoadBatch, bulk: bool) -> Result<u64, DatabaseError> {
        let mut state = lock(&self.state)?;
        state.write_attempts += 1;
        if let Some(err) = state.write_failures.pop_front() {
            return Err(err);
        }
        if bulk {
            state.bulk_writes += 1;
        }
        // affected rows as seen from inside this transaction
        let mut view = state.tables.get(&batch.table).cloned().unwrap_or_default();
        for earlier in self.pending.iter().filter(|b| b.table == batch.table) {
            apply(&mut view, earlier);
        }
        let affected = apply(&mut view, batch);
        drop(state);
        self.pending.push(batch.clone());
        Ok(affected)
    }

    async fn commit(self: Box<Self>) -> Result<(), DatabaseError> {
        let mut state = lock(&self.state)?;
        for batch in &self.pending {
            apply(state.tables.entry(batch.table.clone()).or_default(), batch);
        }
        state.commits += 1;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<(), DatabaseError> {
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use genflow_common::SqlType;

    use super::*;

    fn batch(mode: LoadMode, rows: Vec<(i64, i64)>) -> LoadBatch {
        LoadBatch {
            table: "parent".into(),
            mode,
            columns: vec!["parent_id".into(), "col_int".into()],
            types: vec![SqlType::Int, SqlType::Int],
            rows: rows
                .into_iter()
                .map(|(k, v)| vec![Value::Int(k), Value::Int(v)])
                .collect(),
        }
    }

    #[tokio::test]
    async fn test_writes_apply_on_commit_only() {
        let store = MemoryStore::new();
        let mut session = store.begin().await.unwrap();
        assert_eq!(session.write(&batch(LoadMode::Insert, vec![(1, 1), (2, 2)]), false).await.unwrap(), 2);
        assert_eq!(store.row_count("parent"), 0);
        session.commit().await.unwrap();
        assert_eq!(store.row_count("parent"), 2);

        let mut again = store.begin().await.unwrap();
        assert_eq!(again.write(&batch(LoadMode::Insert, vec![(1, 9)]), false).await.unwrap(), 0);
        assert_eq!(again.write(&batch(LoadMode::Update, vec![(1, 9)]), false).await.unwrap(), 1);
        again.rollback().await.unwrap();
        assert_eq!(store.table("parent")[&1]["col_int"], Value::Int(1));
    }

    #[tokio::test]
    async fn test_savepoint_discards_later_writes() {
        let store = MemoryStore::new();
        let mut session = store.begin().await.unwrap();
        session.write(&batch(LoadMode::Insert, vec![(1, 1)]), false).await.unwrap();
        session.savepoint().await.unwrap();
        session.write(&batch(LoadMode::Insert, vec![(2, 2)]), false).await.unwrap();
        session.rollback_to_savepoint().await.unwrap();
        session.commit().await.unwrap();
        assert_eq!(store.table("parent").keys().copied().collect::<Vec<_>>(), vec![1]);
    }

    #[tokio::test]
    async fn test_cursor_fetches_in_chunks() {
        let store = MemoryStore::new();
        store.register_rows("SELECT x", (0..5).map(|i| vec![Value::Int(i)]).collect());
        let plan = ExtractPlan {
            sql: "SELECT x".into(),
            binds: vec![],
            outputs: vec!["x".into()],
        };
        let mut session = store.begin().await.unwrap();
        session.open_cursor(&plan).await.unwrap();
        assert_eq!(session.fetch(3).await.unwrap().len(), 3);
        assert_eq!(session.fetch(3).await.unwrap().len(), 2);
        assert!(session.fetch(3).await.unwrap().is_empty());
        assert_eq!(store.fetch_sizes(), vec![3, 3, 3]);
    }
}
