//! One generator run: extract, transform, load
//!
//! Rows stream through a cursor in batches. Each batch is transformed once,
//! turned into load batches (values canonicalized, keys computed), and then
//! written load by load under a savepoint. Only the write is retried.

use std::collections::HashMap;
use std::iter;

use genflow_common::{SqlType, Value};
use tracing::{debug, info, warn};

use super::retry::{RetryDecision, RetryPolicy};
use super::store::{ExtractPlan, LoadBatch, Session, Store};
use crate::error::{ArityError, EngineError, SchemaError, Stage, StageError};
use crate::expr::Compiler;
use crate::generator::{Generator, Load, LoadMode};
use crate::hashing::KeyLayout;
use crate::nodes::{constant_batch_len, Frame};
use crate::query::Extract;
use crate::schema::Schema;

type StageResult<T> = Result<T, StageError>;

fn at<E: Into<EngineError>>(stage: Stage) -> impl Fn(E) -> StageError {
    move |e| StageError::new(stage, e)
}

/// Compile the generator's extraction
pub(crate) fn extract_plan(schema: &Schema, generator: &Generator) -> StageResult<Option<ExtractPlan>> {
    match &generator.extract {
        None => Ok(None),
        Some(Extract::Query(query)) => {
            let compiled = Compiler::compile(schema, query).map_err(at(Stage::Extract))?;
            Ok(Some(ExtractPlan {
                sql: compiled.sql,
                binds: compiled.binds,
                outputs: compiled.outputs,
            }))
        },
        Some(Extract::Raw(raw)) => Ok(Some(ExtractPlan {
            sql: raw.sql.clone(),
            binds: raw.binds.clone(),
            outputs: raw.outputs.clone(),
        })),
    }
}

/// Column names and rows
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RowSet {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Value>>,
}

impl RowSet {
    fn new(columns: Vec<String>) -> Self {
        Self {
            columns,
            rows: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Rows as JSON objects keyed by column name
    pub fn to_json(&self) -> serde_json::Value {
        self.rows
            .iter()
            .map(|row| {
                self.columns
                    .iter()
                    .cloned()
                    .zip(row.iter().map(Value::to_json))
                    .collect::<serde_json::Map<_, _>>()
            })
            .collect()
    }
}

/// Rows one load produced, key column first
#[derive(Debug, Clone, PartialEq)]
pub struct LoadRecord {
    pub load: String,
    pub entity: String,
    pub mode: LoadMode,
    pub rows: RowSet,
}

/// Intermediate row sets of a test run
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TestReport {
    pub generator: String,
    pub extracted: RowSet,
    /// Block outputs, columns named `block.output`
    pub transformed: RowSet,
    pub loads: Vec<LoadRecord>,
}

impl TestReport {
    pub fn load(&self, name: &str) -> Option<&LoadRecord> {
        self.loads.iter().find(|l| l.load == name)
    }

    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "generator": self.generator,
            "extracted": self.extracted.to_json(),
            "transformed": self.transformed.to_json(),
            "loads": self.loads.iter().map(|l| serde_json::json!({
                "load": l.load,
                "entity": l.entity,
                "mode": l.mode,
                "rows": l.rows.to_json(),
            })).collect::<Vec<_>>(),
        })
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunCounts {
    pub rows_extracted: u64,
    pub rows_loaded: u64,
}

/// Column layout of one load
struct LoadLayout {
    table: String,
    key_column: String,
    keys: KeyLayout,
    /// Assigned columns with declared type and strictness
    columns: Vec<(String, SqlType, bool)>,
    /// Position in `columns` of each key part
    key_positions: Vec<Option<usize>>,
}

impl LoadLayout {
    fn new(schema: &Schema, load: &Load) -> Result<Self, EngineError> {
        let entity = schema.require_entity(&load.entity)?;
        let keys = KeyLayout::new(schema, &load.entity)?;
        let mut columns = Vec::with_capacity(load.values.len());
        for (name, _) in &load.values {
            let (ty, strict) = schema
                .column(&load.entity, name)
                .map(|c| c.sql_type())
                .ok_or_else(|| SchemaError::UnknownAttribute {
                    entity: load.entity.clone(),
                    attribute: name.clone(),
                })?;
            columns.push((name.clone(), ty, strict));
        }
        let key_positions = keys
            .parts()
            .iter()
            .map(|p| columns.iter().position(|(c, _, _)| c == &p.name))
            .collect();
        Ok(Self {
            table: load.entity.clone(),
            key_column: entity.id_column(),
            keys,
            columns,
            key_positions,
        })
    }

    fn column_names(&self) -> Vec<String> {
        iter::once(self.key_column.clone())
            .chain(self.columns.iter().map(|(c, _, _)| c.clone()))
            .collect()
    }

    fn types(&self) -> Vec<SqlType> {
        iter::once(SqlType::Int)
            .chain(self.columns.iter().map(|(_, t, _)| *t))
            .collect()
    }
}

/// Keep one row per key: the first for inserts, the last for updates
pub(crate) fn dedup_rows(mode: LoadMode, rows: Vec<Vec<Value>>) -> Vec<Vec<Value>> {
    let mut position: HashMap<i64, usize> = HashMap::with_capacity(rows.len());
    let mut out: Vec<Vec<Value>> = Vec::with_capacity(rows.len());
    for row in rows {
        let Some(key) = row.first().and_then(Value::as_i64) else {
            out.push(row);
            continue;
        };
        match position.get(&key) {
            Some(&i) if mode == LoadMode::Update => out[i] = row,
            Some(_) => {},
            None => {
                position.insert(key, out.len());
                out.push(row);
            },
        }
    }
    out
}

/// Where the extraction is read and where loads are written
struct Sessions<'s> {
    external: Option<&'s mut (dyn Session + 'static)>,
    target: Option<&'s mut (dyn Session + 'static)>,
}

impl Sessions<'_> {
    fn source(&mut self) -> Option<&mut (dyn Session + 'static)> {
        match self.external.as_deref_mut() {
            Some(external) => Some(external),
            None => self.target.as_deref_mut(),
        }
    }
}

/// Executes one generator against an optional target session
pub(crate) struct Pipeline<'a> {
    pub schema: &'a Schema,
    pub generator: &'a Generator,
    pub batch_size: usize,
    pub bulk_threshold: usize,
    pub retry: RetryPolicy,
    pub skip_row_count: bool,
}

impl Pipeline<'_> {
    /// Run every stage. Writes go to `target` when present; `capture`
    /// receives the intermediate row sets.
    pub async fn execute(
        &self,
        store: Option<&dyn Store>,
        plan: Option<&ExtractPlan>,
        mut target: Option<&mut (dyn Session + 'static)>,
        mut capture: Option<&mut TestReport>,
    ) -> StageResult<RunCounts> {
        let name = self.generator.name.as_str();
        let layouts = self
            .generator
            .loads
            .iter()
            .map(|l| LoadLayout::new(self.schema, l))
            .collect::<Result<Vec<_>, _>>()
            .map_err(at(Stage::Load))?;
        if let Some(report) = capture.as_deref_mut() {
            self.prepare_report(report, plan, &layouts);
        }
        let mut counts = RunCounts::default();

        let Some(plan) = plan else {
            let len = constant_batch_len(name, self.generator.args()).map_err(at(Stage::Transform))?;
            counts.rows_extracted = len as u64;
            counts.rows_loaded = self
                .process(Frame::empty(len), &layouts, target.as_deref_mut(), capture)
                .await?;
            return Ok(counts);
        };

        // extraction reads from an external database or from the target session
        let connection = match &self.generator.extract {
            Some(Extract::Raw(raw)) => raw.connection.as_ref(),
            _ => None,
        };
        let mut external = match (connection, store) {
            (Some(config), Some(store)) => Some(store.begin_external(config).await.map_err(at(Stage::Extract))?),
            (Some(_), None) => {
                return Err(StageError::new(
                    Stage::Extract,
                    EngineError::Usage(format!("generator '{}' needs a store to extract", name)),
                ))
            },
            (None, _) => None,
        };
        let mut sessions = Sessions {
            external: external.as_deref_mut(),
            target,
        };
        let result = self
            .stream(plan, &mut sessions, capture, &layouts, &mut counts)
            .await;
        drop(sessions);
        if let Some(session) = external {
            if let Err(e) = session.rollback().await {
                warn!(generator = name, error = %e, "Failed to close external extraction session");
            }
        }
        result.map(|_| counts)
    }

    fn prepare_report(&self, report: &mut TestReport, plan: Option<&ExtractPlan>, layouts: &[LoadLayout]) {
        report.generator = self.generator.name.clone();
        report.extracted = RowSet::new(plan.map(|p| p.outputs.clone()).unwrap_or_default());
        report.transformed = RowSet::new(
            self.generator
                .transforms
                .iter()
                .flat_map(|b| b.outputs.iter().map(move |o| format!("{}.{}", b.name, o)))
                .collect(),
        );
        report.loads = self
            .generator
            .loads
            .iter()
            .zip(layouts)
            .map(|(load, layout)| LoadRecord {
                load: load.name.clone(),
                entity: load.entity.clone(),
                mode: load.mode,
                rows: RowSet::new(layout.column_names()),
            })
            .collect();
    }

    async fn stream(
        &self,
        plan: &ExtractPlan,
        sessions: &mut Sessions<'_>,
        mut capture: Option<&mut TestReport>,
        layouts: &[LoadLayout],
        counts: &mut RunCounts,
    ) -> StageResult<()> {
        let name = self.generator.name.as_str();
        let no_source = || {
            StageError::new(
                Stage::Extract,
                EngineError::Usage(format!(
                    "generator '{}' has an extraction and cannot run without a store",
                    name
                )),
            )
        };

        let source = sessions.source().ok_or_else(no_source)?;
        if self.skip_row_count {
            info!(generator = name, batch_size = self.batch_size, "Extracting");
        } else {
            let total = source.count(plan).await.map_err(at(Stage::Extract))?;
            info!(generator = name, rows = total, batch_size = self.batch_size, "Extracting");
        }
        source.open_cursor(plan).await.map_err(at(Stage::Extract))?;

        let mut batch = 0usize;
        loop {
            let source = sessions.source().ok_or_else(no_source)?;
            let rows = source.fetch(self.batch_size).await.map_err(at(Stage::Extract))?;
            if rows.is_empty() {
                break;
            }
            if let Some(width) = rows.iter().map(Vec::len).find(|w| *w != plan.outputs.len()) {
                return Err(StageError::new(
                    Stage::Extract,
                    ArityError {
                        generator: name.to_string(),
                        node: "extract".into(),
                        detail: format!(
                            "query returned {} columns, {} outputs are declared",
                            width,
                            plan.outputs.len()
                        ),
                    },
                ));
            }
            let fetched = rows.len();
            counts.rows_extracted += fetched as u64;
            if let Some(report) = capture.as_deref_mut() {
                report.extracted.rows.extend(rows.iter().cloned());
            }

            let frame = Frame::from_rows(&plan.outputs, rows);
            let loaded = self
                .process(frame, layouts, sessions.target.as_deref_mut(), capture.as_deref_mut())
                .await?;
            counts.rows_loaded += loaded;
            batch += 1;
            debug!(generator = name, batch, rows = fetched, loaded, "Batch done");
        }

        if let Some(source) = sessions.source() {
            source.close_cursor().await.map_err(at(Stage::Extract))?;
        }
        Ok(())
    }

    /// Transform one batch and write its loads; returns rows affected
    async fn process(
        &self,
        mut frame: Frame,
        layouts: &[LoadLayout],
        target: Option<&mut (dyn Session + 'static)>,
        capture: Option<&mut TestReport>,
    ) -> StageResult<u64> {
        let name = self.generator.name.as_str();
        for block in &self.generator.transforms {
            frame.apply(block, name).map_err(at(Stage::Transform))?;
        }
        let batches = self.load_batches(&mut frame, layouts).map_err(at(Stage::Load))?;

        if let Some(report) = capture {
            let computed = &frame;
            for i in 0..frame.len() {
                let row = self
                    .generator
                    .transforms
                    .iter()
                    .flat_map(|b| {
                        b.outputs.iter().map(move |o| {
                            computed
                                .block_column(&b.name, o)
                                .map(|c| c[i].clone())
                                .unwrap_or_default()
                        })
                    })
                    .collect();
                report.transformed.rows.push(row);
            }
            for (record, batch) in report.loads.iter_mut().zip(&batches) {
                record.rows.rows.extend(batch.rows.iter().cloned());
            }
        }

        let Some(session) = target else {
            return Ok(0);
        };
        let mut loaded = 0;
        for batch in &batches {
            loaded += self.write(&mut *session, batch).await.map_err(at(Stage::Load))?;
        }
        Ok(loaded)
    }

    /// Canonicalize values and compute keys for every load of the batch
    fn load_batches(&self, frame: &mut Frame, layouts: &[LoadLayout]) -> Result<Vec<LoadBatch>, EngineError> {
        let name = self.generator.name.as_str();
        let mut batches = Vec::with_capacity(layouts.len());
        for (load, layout) in self.generator.loads.iter().zip(layouts) {
            let mut columns: Vec<Vec<Value>> = Vec::with_capacity(layout.columns.len());
            for ((_, arg), (_, ty, strict)) in load.values.iter().zip(&layout.columns) {
                let column = frame
                    .resolve(arg, name, &load.name)?
                    .iter()
                    .map(|v| ty.coerce(v, *strict))
                    .collect::<Result<Vec<_>, _>>()?;
                columns.push(column);
            }

            let keys = match &load.key {
                Some(arg) => frame
                    .resolve(arg, name, &load.name)?
                    .iter()
                    .map(|v| SqlType::Int.coerce(v, true))
                    .collect::<Result<Vec<_>, _>>()?,
                None => {
                    let mut parts = Vec::with_capacity(layout.key_positions.len());
                    for (part, position) in layout.keys.parts().iter().zip(&layout.key_positions) {
                        let column = position.and_then(|p| columns.get(p)).ok_or_else(|| {
                            SchemaError::invalid_generator(
                                name,
                                format!("load '{}' does not supply '{}'", load.name, part.name),
                            )
                        })?;
                        parts.push(column.clone());
                    }
                    layout.keys.keys(&parts, frame.len())?
                },
            };

            let rows: Vec<Vec<Value>> = keys
                .iter()
                .enumerate()
                .filter(|(_, key)| !key.is_null())
                .map(|(i, key)| {
                    iter::once(key.clone())
                        .chain(columns.iter().map(|c| c[i].clone()))
                        .collect()
                })
                .collect();
            let dropped = keys.len() - rows.len();
            if dropped > 0 {
                debug!(generator = name, load = %load.name, dropped, "Rows without a key skipped");
            }
            frame.set_keys(&load.name, keys);

            batches.push(LoadBatch {
                table: layout.table.clone(),
                mode: load.mode,
                columns: layout.column_names(),
                types: layout.types(),
                rows: dedup_rows(load.mode, rows),
            });
        }
        Ok(batches)
    }

    /// Write one batch under a savepoint, retrying transient failures
    async fn write(&self, session: &mut (dyn Session + 'static), batch: &LoadBatch) -> Result<u64, EngineError> {
        if batch.is_empty() {
            return Ok(0);
        }
        let bulk = batch.len() >= self.bulk_threshold;
        let mut attempt = 1;
        loop {
            session.savepoint().await?;
            match session.write(batch, bulk).await {
                Ok(affected) => {
                    session.release_savepoint().await?;
                    debug!(
                        generator = %self.generator.name,
                        table = %batch.table,
                        rows = batch.len(),
                        affected,
                        bulk,
                        "Load written"
                    );
                    return Ok(affected);
                },
                Err(err) => match self.retry.decide(&err, attempt) {
                    RetryDecision::Retry(wait) => {
                        warn!(
                            generator = %self.generator.name,
                            table = %batch.table,
                            attempt,
                            max_attempts = self.retry.max_attempts,
                            code = err.code().unwrap_or(""),
                            "Transient error during load, retrying: {}",
                            err
                        );
                        session.rollback_to_savepoint().await?;
                        tokio::time::sleep(wait).await;
                        attempt += 1;
                    },
                    RetryDecision::Exhausted => {
                        return Err(EngineError::RetriesExhausted {
                            attempts: attempt,
                            last: err,
                        })
                    },
                    RetryDecision::Fatal => return Err(err.into()),
                },
            }
        }
    }
}
