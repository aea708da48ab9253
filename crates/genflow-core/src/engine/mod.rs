//! Execution engine
//!
//! [`Engine::run`] executes the selected generators in dependency order. Each
//! generator owns one store session (one connection, one transaction) for its
//! whole extract/transform/load cycle and commits once at the end; the
//! completion log is written only after that commit. Generators without an
//! edge between them may run concurrently, up to `engine.max_parallel`.
//!
//! A failure stops the launch of further generators unless the run keeps
//! going, in which case only the failed generator's dependents are held back.
//! Generators already in flight always finish and are recorded.

mod execute;
pub mod memory;
pub mod pg;
pub mod retry;
pub mod statements;
pub mod store;

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use chrono::Utc;
use futures::stream::{FuturesUnordered, StreamExt};
use futures::FutureExt;
use serde::Serialize;
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

pub use execute::{LoadRecord, RowSet, RunCounts, TestReport};
pub use memory::MemoryStore;
pub use pg::PgStore;
pub use retry::{RetryDecision, RetryOutcome, RetryPolicy};
pub use store::{ExtractPlan, LoadBatch, Session, Store};

use crate::config::{EngineConfig, Settings};
use crate::db::create_pool;
use crate::error::{EngineError, Result, SchedulerError, Stage, StageError};
use crate::generator::Generator;
use crate::log::{CompletionLog, GeneratorRunRecord, PgCompletionLog, RunStatus};
use crate::model::Model;
use crate::scheduler::RunFilter;
use execute::{extract_plan, Pipeline};

/// What happened to one generator in a run
#[derive(Debug)]
pub enum GeneratorOutcome {
    Completed { rows_extracted: u64, rows_loaded: u64 },
    /// Already complete with the same fingerprint
    Skipped,
    Failed(StageError),
    /// Blocked by an upstream failure, or the run halted first
    NotRun { reason: String },
}

impl GeneratorOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            GeneratorOutcome::Completed { .. } => "completed",
            GeneratorOutcome::Skipped => "skipped",
            GeneratorOutcome::Failed(_) => "failed",
            GeneratorOutcome::NotRun { .. } => "not run",
        }
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, GeneratorOutcome::Failed(_))
    }

    /// Completed or skipped; dependents may run
    fn unblocks(&self) -> bool {
        matches!(self, GeneratorOutcome::Completed { .. } | GeneratorOutcome::Skipped)
    }
}

#[derive(Debug)]
pub struct GeneratorReport {
    pub name: String,
    pub outcome: GeneratorOutcome,
}

/// Outcome of every selected generator, in run order
#[derive(Debug)]
pub struct RunReport {
    pub run_id: Uuid,
    pub generators: Vec<GeneratorReport>,
}

/// Outcome tallies of a run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RunSummary {
    pub completed: usize,
    pub skipped: usize,
    pub failed: usize,
    pub not_run: usize,
    pub rows_loaded: u64,
}

impl RunReport {
    /// No generator failed or was held back
    pub fn is_success(&self) -> bool {
        self.generators
            .iter()
            .all(|g| !matches!(g.outcome, GeneratorOutcome::Failed(_) | GeneratorOutcome::NotRun { .. }))
    }

    pub fn outcome(&self, name: &str) -> Option<&GeneratorOutcome> {
        self.generators.iter().find(|g| g.name == name).map(|g| &g.outcome)
    }

    pub fn failures(&self) -> impl Iterator<Item = (&str, &StageError)> {
        self.generators.iter().filter_map(|g| match &g.outcome {
            GeneratorOutcome::Failed(err) => Some((g.name.as_str(), err)),
            _ => None,
        })
    }

    pub fn summary(&self) -> RunSummary {
        let mut summary = RunSummary::default();
        for g in &self.generators {
            match &g.outcome {
                GeneratorOutcome::Completed { rows_loaded, .. } => {
                    summary.completed += 1;
                    summary.rows_loaded += rows_loaded;
                },
                GeneratorOutcome::Skipped => summary.skipped += 1,
                GeneratorOutcome::Failed(_) => summary.failed += 1,
                GeneratorOutcome::NotRun { .. } => summary.not_run += 1,
            }
        }
        summary
    }
}

/// How [`Engine::test_generator`] isolates its writes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TestMode {
    /// Run against the store inside a transaction that is rolled back
    Rollback,
    /// Run without any store; only for generators without an extraction
    DryRun,
}

enum Readiness {
    Ready,
    Waiting,
    Blocked(usize),
}

/// Runs a model's generators against a store
#[derive(Clone)]
pub struct Engine {
    model: Arc<Model>,
    store: Arc<dyn Store>,
    log: Arc<dyn CompletionLog>,
    config: EngineConfig,
    retry: RetryPolicy,
}

impl Engine {
    pub fn new(model: Model, store: Arc<dyn Store>, log: Arc<dyn CompletionLog>, config: EngineConfig) -> Self {
        let retry = RetryPolicy::from_config(&config);
        Self {
            model: Arc::new(model),
            store,
            log,
            config,
            retry,
        }
    }

    /// Engine on Postgres, with the completion log on `log_database` when set
    pub async fn connect(model: Model, settings: &Settings) -> Result<Self> {
        let pool = create_pool(&settings.database).await?;
        let log_pool = match &settings.log_database {
            Some(config) => create_pool(config).await?,
            None => pool.clone(),
        };
        Ok(Self::new(
            model,
            Arc::new(PgStore::new(pool)),
            Arc::new(PgCompletionLog::new(log_pool, settings.log_schema.clone())),
            settings.engine.clone(),
        ))
    }

    pub fn model(&self) -> &Model {
        &self.model
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Create the model's tables and the completion log tables
    pub async fn create_schema(&self) -> Result<()> {
        let statements = self.model.ddl();
        self.store.execute_batch(&statements).await?;
        self.log.ensure_schema().await?;
        info!(model = %self.model.name(), statements = statements.len(), "Schema created");
        Ok(())
    }

    /// Run the generators selected by `filter`
    pub async fn run(&self, filter: &RunFilter) -> Result<RunReport> {
        let graph = self.model.graph();
        let generators = self.model.generators();
        let selected = filter.select(graph, generators)?;
        let names: Vec<String> = selected.iter().map(|&i| graph.name(i).to_string()).collect();
        let run_id = self
            .retry
            .run("start run", |_| self.log.start_run(&names))
            .await
            .into_result()?;

        let limit = if filter.serial { 1 } else { self.config.max_parallel.max(1) };
        let keep_going = filter.keep_going || self.config.keep_going;
        info!(
            run_id = %run_id,
            generators = selected.len(),
            parallel = limit,
            keep_going,
            "Starting run"
        );

        let in_run: HashSet<usize> = selected.iter().copied().collect();
        let mut pending: VecDeque<usize> = selected.iter().copied().collect();
        let mut outcomes: HashMap<usize, GeneratorOutcome> = HashMap::new();
        let mut running = FuturesUnordered::new();
        let mut halted = false;

        loop {
            if !halted {
                let mut i = 0;
                while i < pending.len() && running.len() < limit {
                    let index = pending[i];
                    match readiness(graph.upstream(index), &in_run, &outcomes) {
                        Readiness::Ready => {
                            pending.remove(i);
                            let engine = self.clone();
                            let filter = filter.clone();
                            let span = info_span!("generator", name = %graph.name(index), run_id = %run_id);
                            let handle = tokio::spawn(
                                async move { engine.run_generator(index, run_id, &filter).await }.instrument(span),
                            );
                            running.push(handle.map(move |joined| (index, joined)));
                        },
                        Readiness::Blocked(upstream) => {
                            pending.remove(i);
                            let reason = format!("upstream generator '{}' did not complete", graph.name(upstream));
                            warn!(generator = %graph.name(index), "{}", reason);
                            outcomes.insert(index, GeneratorOutcome::NotRun { reason });
                        },
                        Readiness::Waiting => i += 1,
                    }
                }
            }

            let Some((index, joined)) = running.next().await else {
                break;
            };
            let outcome = joined.unwrap_or_else(|e| {
                // only transform callables run user code
                GeneratorOutcome::Failed(StageError::new(Stage::Transform, EngineError::Aborted(e.to_string())))
            });
            if outcome.is_failed() && !keep_going && !halted {
                warn!(generator = %graph.name(index), "Halting run after failure");
                halted = true;
            }
            outcomes.insert(index, outcome);
        }

        for index in pending {
            outcomes.insert(
                index,
                GeneratorOutcome::NotRun {
                    reason: "run halted after a failure".into(),
                },
            );
        }

        let report = RunReport {
            run_id,
            generators: selected
                .iter()
                .map(|&i| GeneratorReport {
                    name: graph.name(i).to_string(),
                    outcome: outcomes.remove(&i).unwrap_or(GeneratorOutcome::NotRun {
                        reason: "not scheduled".into(),
                    }),
                })
                .collect(),
        };
        let summary = report.summary();
        info!(
            run_id = %run_id,
            completed = summary.completed,
            skipped = summary.skipped,
            failed = summary.failed,
            not_run = summary.not_run,
            rows_loaded = summary.rows_loaded,
            "Run finished"
        );
        Ok(report)
    }

    /// Run one generator's stages against an isolated target and return the
    /// intermediate row sets instead of committing
    pub async fn test_generator(&self, name: &str, mode: TestMode) -> Result<TestReport> {
        let generator = self
            .model
            .generator(name)
            .ok_or_else(|| SchedulerError::UnknownGenerator(name.to_string()))?;
        let plan = extract_plan(self.model.schema(), generator).map_err(|e| e.error)?;
        let pipeline = self.pipeline(generator, &RunFilter::default());
        let mut report = TestReport::default();

        let result = match mode {
            TestMode::Rollback => {
                let mut session = self.store.begin().await?;
                let result = pipeline
                    .execute(
                        Some(self.store.as_ref()),
                        plan.as_ref(),
                        Some(session.as_mut()),
                        Some(&mut report),
                    )
                    .await;
                session.rollback().await?;
                result
            },
            TestMode::DryRun => {
                if plan.is_some() {
                    return Err(EngineError::Usage(format!(
                        "generator '{}' has an extraction; a dry run needs no store, use rollback mode",
                        name
                    )));
                }
                pipeline.execute(None, None, None, Some(&mut report)).await
            },
        };
        let counts = result.map_err(|e| {
            warn!(generator = name, stage = %e.stage, "Test run failed");
            e.error
        })?;
        info!(
            generator = name,
            rows_extracted = counts.rows_extracted,
            loads = report.loads.len(),
            "Test run finished"
        );
        Ok(report)
    }

    fn pipeline<'a>(&'a self, generator: &'a Generator, filter: &RunFilter) -> Pipeline<'a> {
        Pipeline {
            schema: self.model.schema(),
            generator,
            batch_size: generator
                .batch_size
                .or(filter.batch_size)
                .unwrap_or(self.config.batch_size)
                .max(1),
            bulk_threshold: self.config.bulk_threshold,
            retry: self.retry,
            skip_row_count: filter.skip_row_count,
        }
    }

    async fn run_generator(&self, index: usize, run_id: Uuid, filter: &RunFilter) -> GeneratorOutcome {
        let generator = &self.model.generators()[index];
        let plan = extract_plan(self.model.schema(), generator);
        let fingerprint = match &plan {
            Ok(Some(plan)) => generator.fingerprint(Some(&plan.sql), &plan.binds),
            _ => generator.fingerprint(None, &[]),
        };

        let plan = match plan {
            Ok(plan) => plan,
            Err(err) => return self.finish(run_id, generator, &fingerprint, Err(err)).await,
        };

        if !filter.retry {
            match self.log.is_complete(&generator.name, &fingerprint).await {
                Ok(true) => {
                    info!("Already complete, skipping");
                    return GeneratorOutcome::Skipped;
                },
                Ok(false) => {},
                Err(e) => {
                    return self
                        .finish(run_id, generator, &fingerprint, Err(StageError::new(Stage::Extract, e)))
                        .await
                },
            }
        }

        info!(description = generator.description.as_deref().unwrap_or(""), "Starting generator");
        let result = self.execute(generator, plan.as_ref(), filter).await;
        self.finish(run_id, generator, &fingerprint, result).await
    }

    async fn execute(
        &self,
        generator: &Generator,
        plan: Option<&ExtractPlan>,
        filter: &RunFilter,
    ) -> std::result::Result<RunCounts, StageError> {
        let mut session = self
            .retry
            .run("begin transaction", |_| self.store.begin())
            .await
            .into_result()
            .map_err(|e| StageError::new(Stage::Extract, e))?;

        let result = self
            .pipeline(generator, filter)
            .execute(Some(self.store.as_ref()), plan, Some(session.as_mut()), None)
            .await;
        match result {
            Ok(counts) => {
                session.commit().await.map_err(|e| StageError::new(Stage::Load, e))?;
                Ok(counts)
            },
            Err(err) => {
                if let Err(e) = session.rollback().await {
                    warn!(error = %e, "Rollback failed");
                }
                Err(err)
            },
        }
    }

    /// Record the outcome in the completion log
    async fn finish(
        &self,
        run_id: Uuid,
        generator: &Generator,
        fingerprint: &str,
        result: std::result::Result<RunCounts, StageError>,
    ) -> GeneratorOutcome {
        let (status, stage, message, counts) = match &result {
            Ok(counts) => (RunStatus::Completed, None, None, *counts),
            Err(err) => (
                RunStatus::Failed,
                Some(err.stage),
                Some(err.error.to_string()),
                RunCounts::default(),
            ),
        };
        let record = GeneratorRunRecord {
            run_id,
            generator: generator.name.clone(),
            fingerprint: fingerprint.to_string(),
            status,
            stage,
            error: message,
            rows_extracted: counts.rows_extracted,
            rows_loaded: counts.rows_loaded,
            finished_at: Utc::now(),
        };
        let logged = self
            .retry
            .run("record completion", |_| self.log.record(&record))
            .await
            .into_result();

        match (result, logged) {
            (Ok(counts), Ok(())) => {
                info!(
                    rows_extracted = counts.rows_extracted,
                    rows_loaded = counts.rows_loaded,
                    "Generator completed"
                );
                GeneratorOutcome::Completed {
                    rows_extracted: counts.rows_extracted,
                    rows_loaded: counts.rows_loaded,
                }
            },
            (Ok(_), Err(e)) => {
                error!(error = %e, "Generator committed but its completion could not be recorded");
                GeneratorOutcome::Failed(StageError::new(Stage::Load, e))
            },
            (Err(err), logged) => {
                error!(stage = %err.stage, error = %err.error, "Generator failed");
                if let Err(e) = logged {
                    warn!(error = %e, "Failed to record generator failure");
                }
                GeneratorOutcome::Failed(err)
            },
        }
    }
}

fn readiness(
    upstream: &std::collections::BTreeSet<usize>,
    in_run: &HashSet<usize>,
    outcomes: &HashMap<usize, GeneratorOutcome>,
) -> Readiness {
    let mut ready = true;
    for &u in upstream.iter().filter(|u| in_run.contains(u)) {
        match outcomes.get(&u) {
            Some(outcome) if outcome.unblocks() => {},
            Some(_) => return Readiness::Blocked(u),
            None => ready = false,
        }
    }
    if ready {
        Readiness::Ready
    } else {
        Readiness::Waiting
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use genflow_common::{SqlType, Value};

    use super::*;
    use crate::error::DatabaseError;
    use crate::generator::Load;
    use crate::log::MemoryCompletionLog;
    use crate::model::ModelBuilder;
    use crate::nodes::{Arg, TransformBlock};
    use crate::query::RawQuery;
    use crate::schema::{Attribute, Entity, Relation};

    const PARENT_ONE: i64 = -5220010288091357104;
    const SOURCE_SQL: &str = "SELECT n FROM source ORDER BY n";

    fn builder(strict: bool) -> ModelBuilder {
        let mut col_int = Attribute::new("col_int", SqlType::Int).identifying();
        if strict {
            col_int = col_int.strict();
        }
        let mut b = ModelBuilder::new("test");
        b.add_entity(Entity::new("parent").attr(col_int))
            .unwrap()
            .add_entity(Entity::new("child").attr(Attribute::new("name", SqlType::Text).identifying()))
            .unwrap()
            .add_relation(Relation::new("parent", "child", "parent"))
            .unwrap();
        b
    }

    fn copy_parents() -> Generator {
        Generator::new("parents")
            .raw(RawQuery::new(SOURCE_SQL, ["n"]))
            .load(Load::insert("parent").value("col_int", Arg::query("n")))
    }

    fn engine_with(model: Model, config: EngineConfig) -> (Engine, MemoryStore, Arc<MemoryCompletionLog>) {
        let store = MemoryStore::new();
        let log = Arc::new(MemoryCompletionLog::new());
        let engine = Engine::new(model, Arc::new(store.clone()), log.clone(), config);
        (engine, store, log)
    }

    fn source_rows(n: i64) -> Vec<Vec<Value>> {
        (1..=n).map(|i| vec![Value::Int(i)]).collect()
    }

    fn completed(report: &RunReport, name: &str) -> (u64, u64) {
        match report.outcome(name) {
            Some(GeneratorOutcome::Completed {
                rows_extracted,
                rows_loaded,
            }) => (*rows_extracted, *rows_loaded),
            other => panic!("{} did not complete: {:?}", name, other),
        }
    }

    #[tokio::test]
    async fn test_streams_source_in_batches() {
        let mut b = builder(false);
        b.add_generator(copy_parents().batch_size(10)).unwrap();
        let (engine, store, _) = engine_with(b.build().unwrap(), EngineConfig::default());
        store.register_rows(SOURCE_SQL, source_rows(100));

        let report = engine.run(&RunFilter::new()).await.unwrap();
        assert!(report.is_success());
        assert_eq!(completed(&report, "parents"), (100, 100));
        assert_eq!(store.row_count("parent"), 100);
        assert!(store.fetch_sizes().iter().all(|&n| n == 10));
        assert_eq!(store.table("parent")[&PARENT_ONE]["col_int"], Value::Int(1));

        let test = engine.test_generator("parents", TestMode::Rollback).await.unwrap();
        assert_eq!(test.extracted.len(), 100);
        assert_eq!(test.extracted.rows[0], vec![Value::Int(1)]);
        assert_eq!(test.extracted.rows, source_rows(100));
    }

    #[tokio::test]
    async fn test_rerun_inserts_nothing_and_keeps_keys() {
        let mut b = builder(false);
        b.add_generator(copy_parents()).unwrap();
        let (engine, store, _) = engine_with(b.build().unwrap(), EngineConfig::default());
        store.register_rows(SOURCE_SQL, source_rows(20));

        engine.run(&RunFilter::new()).await.unwrap();
        let first: Vec<i64> = store.table("parent").keys().copied().collect();

        let skipped = engine.run(&RunFilter::new()).await.unwrap();
        assert!(matches!(skipped.outcome("parents"), Some(GeneratorOutcome::Skipped)));

        let again = engine.run(&RunFilter::new().retry(true)).await.unwrap();
        assert_eq!(completed(&again, "parents"), (20, 0));
        assert_eq!(store.table("parent").keys().copied().collect::<Vec<_>>(), first);
    }

    #[tokio::test]
    async fn test_changed_constant_is_not_skipped() {
        let model = |n: i64| {
            let mut b = builder(false);
            b.add_generator(Generator::new("constants").load(Load::insert("parent").value("col_int", Arg::value(n))))
                .unwrap();
            b.build().unwrap()
        };
        let store = MemoryStore::new();
        let log = Arc::new(MemoryCompletionLog::new());

        let first = Engine::new(model(1), Arc::new(store.clone()), log.clone(), EngineConfig::default());
        completed(&first.run(&RunFilter::new()).await.unwrap(), "constants");
        assert!(matches!(
            first.run(&RunFilter::new()).await.unwrap().outcome("constants"),
            Some(GeneratorOutcome::Skipped)
        ));

        let second = Engine::new(model(2), Arc::new(store.clone()), log.clone(), EngineConfig::default());
        let report = second.run(&RunFilter::new()).await.unwrap();
        assert_eq!(completed(&report, "constants"), (1, 1));
        assert_eq!(store.row_count("parent"), 2);
    }

    #[tokio::test]
    async fn test_changed_bind_is_not_skipped() {
        let sql = "SELECT n FROM source WHERE n > $1 ORDER BY n";
        let model = |min: i64| {
            let mut b = builder(false);
            b.add_generator(
                Generator::new("parents")
                    .raw(RawQuery::new(sql, ["n"]).bind(min))
                    .load(Load::insert("parent").value("col_int", Arg::query("n"))),
            )
            .unwrap();
            b.build().unwrap()
        };
        let store = MemoryStore::new();
        store.register_rows(sql, source_rows(3));
        let log = Arc::new(MemoryCompletionLog::new());

        let first = Engine::new(model(5), Arc::new(store.clone()), log.clone(), EngineConfig::default());
        completed(&first.run(&RunFilter::new()).await.unwrap(), "parents");

        let second = Engine::new(model(10), Arc::new(store.clone()), log.clone(), EngineConfig::default());
        let report = second.run(&RunFilter::new()).await.unwrap();
        assert!(matches!(report.outcome("parents"), Some(GeneratorOutcome::Completed { .. })));
        assert_eq!(log.records().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_load_failures_do_not_rerun_transform() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let double = TransformBlock::new("double", vec![Arg::query("n")], ["n2"], move |columns| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(vec![columns[0]
                .iter()
                .map(|v| Value::Int(v.as_i64().unwrap_or(0) * 2))
                .collect()])
        });
        let generator = Generator::new("doubles")
            .raw(RawQuery::new(SOURCE_SQL, ["n"]))
            .transform(double.clone())
            .load(Load::insert("parent").value("col_int", double.output("n2")));
        let mut b = builder(false);
        b.add_generator(generator).unwrap();
        let (engine, store, log) = engine_with(b.build().unwrap(), EngineConfig::default());
        store.register_rows(SOURCE_SQL, source_rows(5));
        store.fail_writes([
            DatabaseError::from_sqlstate("40P01", "deadlock detected"),
            DatabaseError::from_sqlstate("40P01", "deadlock detected"),
        ]);

        let report = engine.run(&RunFilter::new()).await.unwrap();
        assert_eq!(completed(&report, "doubles"), (5, 5));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(store.write_attempts(), 3);
        assert_eq!(log.records()[0].status, RunStatus::Completed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_retries_fail_the_load_stage() {
        let mut b = builder(false);
        b.add_generator(copy_parents()).unwrap();
        let config = EngineConfig {
            retry_attempts: 3,
            ..EngineConfig::default()
        };
        let (engine, store, log) = engine_with(b.build().unwrap(), config);
        store.register_rows(SOURCE_SQL, source_rows(3));
        store.fail_writes((0..3).map(|_| DatabaseError::from_sqlstate("55P03", "lock not available")));

        let report = engine.run(&RunFilter::new()).await.unwrap();
        assert!(!report.is_success());
        let (_, err) = report.failures().next().unwrap();
        assert_eq!(err.stage, Stage::Load);
        assert!(matches!(err.error, EngineError::RetriesExhausted { attempts: 3, .. }));
        assert_eq!(store.row_count("parent"), 0);

        let records = log.records();
        assert_eq!(records[0].status, RunStatus::Failed);
        assert_eq!(records[0].stage, Some(Stage::Load));
    }

    #[tokio::test]
    async fn test_strict_integer_rejects_bool_and_commits_nothing() {
        let mut b = builder(true);
        b.add_generator(
            Generator::new("parents")
                .load(Load::insert("parent").value("col_int", Arg::values([Value::Int(1), Value::Bool(true)]))),
        )
        .unwrap();
        let (engine, store, _) = engine_with(b.build().unwrap(), EngineConfig::default());

        let report = engine.run(&RunFilter::new()).await.unwrap();
        let (_, err) = report.failures().next().unwrap();
        assert_eq!(err.stage, Stage::Load);
        assert!(matches!(err.error, EngineError::Coercion(_)));
        assert_eq!(store.row_count("parent"), 0);
        assert_eq!(store.commits(), 0);
    }

    fn failure_model() -> Model {
        let mut b = builder(false);
        b.add_generator(Generator::new("a").load(Load::insert("parent").value("col_int", Arg::values([1, 2]))))
            .unwrap()
            .add_generator(
                Generator::new("b")
                    .raw(RawQuery::new("SELECT col_int FROM parent", ["n"]).depends_on("parent"))
                    .load(Load::insert("child").value("name", Arg::query("n"))),
            )
            .unwrap()
            .add_generator(Generator::new("c").load(Load::insert("child").value("name", Arg::value("c"))))
            .unwrap();
        b.build().unwrap()
    }

    #[tokio::test]
    async fn test_fatal_failure_halts_run() {
        let (engine, store, _) = engine_with(failure_model(), EngineConfig::default());
        store.fail_writes([DatabaseError::from_sqlstate("23505", "duplicate key")]);

        let report = engine.run(&RunFilter::new().serial(true)).await.unwrap();
        assert!(report.outcome("a").unwrap().is_failed());
        assert!(matches!(report.outcome("b"), Some(GeneratorOutcome::NotRun { .. })));
        assert!(matches!(report.outcome("c"), Some(GeneratorOutcome::NotRun { .. })));
        assert_eq!(store.write_attempts(), 1);
    }

    #[tokio::test]
    async fn test_keep_going_runs_independent_generators() {
        let (engine, store, _) = engine_with(failure_model(), EngineConfig::default());
        store.fail_writes([DatabaseError::from_sqlstate("23505", "duplicate key")]);

        let report = engine
            .run(&RunFilter::new().serial(true).keep_going(true))
            .await
            .unwrap();
        assert!(report.outcome("a").unwrap().is_failed());
        assert!(matches!(report.outcome("b"), Some(GeneratorOutcome::NotRun { .. })));
        assert_eq!(completed(&report, "c"), (1, 1));
        let summary = report.summary();
        assert_eq!((summary.completed, summary.failed, summary.not_run), (1, 1, 1));
    }

    #[tokio::test]
    async fn test_parallel_run_completes_everything() {
        let (engine, store, log) = engine_with(failure_model(), EngineConfig::default());
        store.register_rows("SELECT col_int FROM parent", vec![vec![Value::Int(1)], vec![Value::Int(2)]]);

        let report = engine.run(&RunFilter::new()).await.unwrap();
        assert!(report.is_success());
        assert_eq!(store.row_count("child"), 3);
        assert_eq!(log.records().len(), 3);
        assert_eq!(log.run_count(), 1);
    }

    #[tokio::test]
    async fn test_key_argument_links_child_to_parent() {
        let mut b = builder(false);
        b.add_generator(
            Generator::new("family")
                .load(Load::insert("parent").value("col_int", Arg::values([1, 2])))
                .load(
                    Load::insert("child")
                        .value("name", Arg::values(["a", "b"]))
                        .value("parent", Arg::key("parent_insert")),
                ),
        )
        .unwrap();
        let (engine, store, _) = engine_with(b.build().unwrap(), EngineConfig::default());

        let report = engine.run(&RunFilter::new()).await.unwrap();
        assert_eq!(completed(&report, "family"), (2, 4));
        let children = store.table("child");
        let parents: Vec<Value> = children.values().map(|row| row["parent"].clone()).collect();
        assert!(parents.contains(&Value::Int(PARENT_ONE)));
        for parent in parents {
            assert!(store.table("parent").contains_key(&parent.as_i64().unwrap()));
        }
    }

    #[tokio::test]
    async fn test_bulk_path_at_threshold() {
        let mut b = builder(false);
        b.add_generator(copy_parents()).unwrap();
        let config = EngineConfig {
            bulk_threshold: 50,
            batch_size: 100,
            ..EngineConfig::default()
        };
        let (engine, store, _) = engine_with(b.build().unwrap(), config);
        store.register_rows(SOURCE_SQL, source_rows(120));

        engine.run(&RunFilter::new()).await.unwrap();
        // 100-row batch goes bulk, the 20-row tail does not
        assert_eq!(store.bulk_writes(), 1);
        assert_eq!(store.row_count("parent"), 120);
    }

    #[tokio::test]
    async fn test_filter_batch_size_applies_without_override() {
        let mut b = builder(false);
        b.add_generator(copy_parents()).unwrap();
        let (engine, store, _) = engine_with(b.build().unwrap(), EngineConfig::default());
        store.register_rows(SOURCE_SQL, source_rows(9));

        engine
            .run(&RunFilter::new().batch_size(4).skip_row_count(true))
            .await
            .unwrap();
        assert_eq!(store.fetch_sizes(), vec![4, 4, 4, 4]);
    }

    #[tokio::test]
    async fn test_dry_run_reports_keys_without_store() {
        let mut b = builder(false);
        b.add_generator(
            Generator::new("parents").load(Load::insert("parent").value("col_int", Arg::values(["1", " 2 "]))),
        )
        .unwrap();
        let (engine, store, _) = engine_with(b.build().unwrap(), EngineConfig::default());

        let report = engine.test_generator("parents", TestMode::DryRun).await.unwrap();
        let load = report.load("parent_insert").unwrap();
        assert_eq!(load.rows.rows[0], vec![Value::Int(PARENT_ONE), Value::Int(1)]);
        assert_eq!(load.rows.rows[1][1], Value::Int(2));
        assert_eq!(store.write_attempts(), 0);
        assert_eq!(report.to_json()["loads"][0]["rows"][0]["col_int"], 1);
    }

    #[tokio::test]
    async fn test_dry_run_rejects_extraction() {
        let mut b = builder(false);
        b.add_generator(copy_parents()).unwrap();
        let (engine, _, _) = engine_with(b.build().unwrap(), EngineConfig::default());
        assert!(matches!(
            engine.test_generator("parents", TestMode::DryRun).await,
            Err(EngineError::Usage(_))
        ));
        assert!(matches!(
            engine.test_generator("missing", TestMode::Rollback).await,
            Err(EngineError::Scheduler(SchedulerError::UnknownGenerator(_)))
        ));
    }

    #[tokio::test]
    async fn test_create_schema_runs_ddl() {
        let (engine, store, _) = engine_with(failure_model(), EngineConfig::default());
        engine.create_schema().await.unwrap();
        let executed = store.executed();
        assert!(executed.iter().any(|s| s.contains("CREATE TABLE IF NOT EXISTS \"parent\"")));
        assert!(executed.iter().any(|s| s.contains("FOREIGN KEY")));
    }
}
