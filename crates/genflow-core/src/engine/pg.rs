//! Postgres store

use async_trait::async_trait;
use chrono::NaiveDate;
use genflow_common::Value;
use sqlx::postgres::{PgArguments, PgRow};
use sqlx::types::BigDecimal;
use sqlx::{Column, PgPool, Postgres, Row, Transaction, TypeInfo};
use tracing::debug;

use super::statements::{
    copy_statement, create_temp_table, drop_temp_table, encode_copy_rows, insert_statement, merge_statement,
    rows_per_statement, temp_table_name, update_statement,
};
use super::store::{ExtractPlan, LoadBatch, Session, Store};
use crate::config::DatabaseConfig;
use crate::db::create_pool;
use crate::error::DatabaseError;
use crate::generator::LoadMode;

const CURSOR_NAME: &str = "genflow_cursor";
const SAVEPOINT_NAME: &str = "genflow_load";

type PgQuery<'q> = sqlx::query::Query<'q, Postgres, PgArguments>;

/// Store backed by a connection pool; one pooled connection per session
#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl Store for PgStore {
    async fn begin(&self) -> Result<Box<dyn Session>, DatabaseError> {
        let tx = self.pool.begin().await?;
        Ok(Box::new(PgSession { tx, cursor_open: false }))
    }

    async fn begin_external(&self, config: &DatabaseConfig) -> Result<Box<dyn Session>, DatabaseError> {
        let single = DatabaseConfig {
            max_connections: 1,
            min_connections: 0,
            ..config.clone()
        };
        let pool = create_pool(&single).await?;
        let mut tx = pool.begin().await?;
        sqlx::query("SET TRANSACTION READ ONLY").execute(&mut *tx).await?;
        Ok(Box::new(PgSession { tx, cursor_open: false }))
    }

    async fn execute_batch(&self, statements: &[String]) -> Result<(), DatabaseError> {
        let mut tx = self.pool.begin().await?;
        for statement in statements {
            sqlx::query(statement).execute(&mut *tx).await?;
        }
        tx.commit().await?;
        Ok(())
    }
}

pub struct PgSession {
    tx: Transaction<'static, Postgres>,
    cursor_open: bool,
}

fn bind_value<'q>(query: PgQuery<'q>, value: &Value) -> PgQuery<'q> {
    match value {
        Value::Null => query.bind(None::<String>),
        Value::Int(i) => query.bind(*i),
        Value::Text(s) => query.bind(s.clone()),
        Value::Decimal(d) => query.bind(d.clone()),
        Value::Double(f) => query.bind(*f),
        Value::Bool(b) => query.bind(*b),
        Value::Date(d) => query.bind(*d),
    }
}

fn bind_all<'q, 'v>(query: PgQuery<'q>, values: impl IntoIterator<Item = &'v Value>) -> PgQuery<'q> {
    values.into_iter().fold(query, bind_value)
}

fn decode_row(row: &PgRow) -> Result<Vec<Value>, DatabaseError> {
    row.columns()
        .iter()
        .map(|column| decode_column(row, column.ordinal(), column.name(), column.type_info().name()))
        .collect()
}

fn decode_column(row: &PgRow, index: usize, name: &str, type_name: &str) -> Result<Value, DatabaseError> {
    let value = match type_name {
        "INT8" => row.try_get::<Option<i64>, _>(index)?.map(Value::Int),
        "INT4" => row.try_get::<Option<i32>, _>(index)?.map(|v| Value::Int(v.into())),
        "INT2" => row.try_get::<Option<i16>, _>(index)?.map(|v| Value::Int(v.into())),
        "FLOAT8" => row.try_get::<Option<f64>, _>(index)?.map(Value::Double),
        "FLOAT4" => row.try_get::<Option<f32>, _>(index)?.map(|v| Value::Double(v.into())),
        "NUMERIC" => row.try_get::<Option<BigDecimal>, _>(index)?.map(Value::Decimal),
        "BOOL" => row.try_get::<Option<bool>, _>(index)?.map(Value::Bool),
        "DATE" => row.try_get::<Option<NaiveDate>, _>(index)?.map(Value::Date),
        "TEXT" | "VARCHAR" | "BPCHAR" | "NAME" | "CHAR" => row.try_get::<Option<String>, _>(index)?.map(Value::Text),
        "JSON" | "JSONB" => row
            .try_get::<Option<serde_json::Value>, _>(index)?
            .map(|v| Value::Text(v.to_string())),
        "UUID" => row
            .try_get::<Option<uuid::Uuid>, _>(index)?
            .map(|v| Value::Text(v.to_string())),
        other => {
            return Err(DatabaseError::fatal(format!(
                "Unsupported type {} for extracted column '{}'",
                other, name
            )))
        },
    };
    Ok(value.unwrap_or(Value::Null))
}

impl PgSession {
    async fn write_batched(&mut self, batch: &LoadBatch) -> Result<u64, DatabaseError> {
        let per_statement = rows_per_statement(batch.columns.len());
        let mut affected = 0;
        for chunk in batch.rows.chunks(per_statement) {
            let sql = match batch.mode {
                LoadMode::Insert => insert_statement(&batch.table, &batch.columns, &batch.types, chunk.len()),
                LoadMode::Update => update_statement(&batch.table, &batch.columns, &batch.types, chunk.len()),
            };
            let query = bind_all(sqlx::query(&sql), chunk.iter().flatten());
            affected += query.execute(&mut *self.tx).await?.rows_affected();
        }
        Ok(affected)
    }

    async fn write_bulk(&mut self, batch: &LoadBatch) -> Result<u64, DatabaseError> {
        let temp = temp_table_name(&batch.table);
        sqlx::query(&create_temp_table(&temp, &batch.table))
            .execute(&mut *self.tx)
            .await?;

        let mut copy = self.tx.copy_in_raw(&copy_statement(&temp, &batch.columns)).await?;
        copy.send(encode_copy_rows(&batch.rows)).await?;
        let copied = copy.finish().await?;

        let merged = sqlx::query(&merge_statement(batch.mode, &temp, &batch.table, &batch.columns))
            .execute(&mut *self.tx)
            .await?
            .rows_affected();
        sqlx::query(&drop_temp_table(&temp)).execute(&mut *self.tx).await?;
        debug!(table = %batch.table, temp = %temp, copied, merged, "Bulk load merged");
        Ok(merged)
    }
}

#[async_trait]
impl Session for PgSession {
    async fn count(&mut self, plan: &ExtractPlan) -> Result<u64, DatabaseError> {
        let sql = format!("SELECT COUNT(*) FROM ({}) AS genflow_count", plan.sql);
        let row = bind_all(sqlx::query(&sql), &plan.binds)
            .fetch_one(&mut *self.tx)
            .await?;
        let count: i64 = row.try_get(0)?;
        Ok(count.max(0) as u64)
    }

    async fn open_cursor(&mut self, plan: &ExtractPlan) -> Result<(), DatabaseError> {
        let sql = format!("DECLARE {} NO SCROLL CURSOR FOR {}", CURSOR_NAME, plan.sql);
        bind_all(sqlx::query(&sql), &plan.binds)
            .execute(&mut *self.tx)
            .await?;
        self.cursor_open = true;
        Ok(())
    }

    async fn fetch(&mut self, n: usize) -> Result<Vec<Vec<Value>>, DatabaseError> {
        let sql = format!("FETCH FORWARD {} FROM {}", n, CURSOR_NAME);
        let rows = sqlx::query(&sql).fetch_all(&mut *self.tx).await?;
        rows.iter().map(decode_row).collect()
    }

    async fn close_cursor(&mut self) -> Result<(), DatabaseError> {
        if self.cursor_open {
            sqlx::query(&format!("CLOSE {}", CURSOR_NAME))
                .execute(&mut *self.tx)
                .await?;
            self.cursor_open = false;
        }
        Ok(())
    }

    async fn savepoint(&mut self) -> Result<(), DatabaseError> {
        sqlx::query(&format!("SAVEPOINT {}", SAVEPOINT_NAME))
            .execute(&mut *self.tx)
            .await?;
        Ok(())
    }

    async fn rollback_to_savepoint(&mut self) -> Result<(), DatabaseError> {
        sqlx::query(&format!("ROLLBACK TO SAVEPOINT {}", SAVEPOINT_NAME))
            .execute(&mut *self.tx)
            .await?;
        Ok(())
    }

    async fn release_savepoint(&mut self) -> Result<(), DatabaseError> {
        sqlx::query(&format!("RELEASE SAVEPOINT {}", SAVEPOINT_NAME))
            .execute(&mut *self.tx)
            .await?;
        Ok(())
    }

    async fn write(&mut self, batch: &LoadBatch, bulk: bool) -> Result<u64, DatabaseError> {
        if batch.is_empty() {
            return Ok(0);
        }
        if bulk {
            self.write_bulk(batch).await
        } else {
            self.write_batched(batch).await
        }
    }

    async fn commit(self: Box<Self>) -> Result<(), DatabaseError> {
        self.tx.commit().await?;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<(), DatabaseError> {
        self.tx.rollback().await?;
        Ok(())
    }
}
