//! Chunked insert-or-update keyed by `round_id`.
//!
//! The loader owns batching and failure accounting; a [`BatchWriter`] owns the
//! storage. Every batch is its own transaction and is committed before the next one
//! starts, so a crash loses at most the batch in flight and a rerun simply replays it.
use std::collections::HashMap;
use std::fmt;
use std::time::Instant;

use async_trait::async_trait;
use chrono::NaiveDateTime;
use serde_json::Value;
use sqlx::query_builder::Separated;
use sqlx::{PgPool, Postgres, QueryBuilder};
use tracing::{debug, info, instrument, warn};

use crate::database_ops::db::Db;
use crate::database_ops::schema::{self, quote_ident, TableKind, TableRef, KEY_COLUMN};
use crate::error::IngestError;

/// Postgres caps a single statement at 65535 bind parameters.
pub const PG_MAX_BINDS: usize = 65_535;

/// A typed column value as bound into the insert statement.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
    BigInt(Option<i64>),
    Text(Option<String>),
    Timestamp(Option<NaiveDateTime>),
    Json(Value),
}

/// Something that can be written as one row keyed by `round_id`.
pub trait UpsertRow: Send + Sync {
    fn round_id(&self) -> i64;
    /// Column name/value pairs; the name set must be the same for every row of a type.
    fn values(&self) -> Vec<(&'static str, SqlValue)>;
}

/// Column sets for one load, derived from the record shape and the live table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpsertPlan {
    pub insert_columns: Vec<String>,
    /// Every insert column except the key.
    pub update_columns: Vec<String>,
    pub skipped_columns: Vec<String>,
}

impl UpsertPlan {
    /// Returns `None` when the table lacks the key column.
    pub fn build(record_columns: &[&str], table_columns: &[String]) -> Option<Self> {
        if !table_columns.iter().any(|c| c == KEY_COLUMN)
            || !record_columns.contains(&KEY_COLUMN)
        {
            return None;
        }
        let (insert_columns, skipped_columns): (Vec<String>, Vec<String>) = record_columns
            .iter()
            .map(|c| c.to_string())
            .partition(|c| table_columns.contains(c));
        let update_columns = insert_columns
            .iter()
            .filter(|c| c.as_str() != KEY_COLUMN)
            .cloned()
            .collect();
        Some(Self {
            insert_columns,
            update_columns,
            skipped_columns,
        })
    }

    pub fn insert_prefix(&self, table: &TableRef) -> String {
        let cols = self
            .insert_columns
            .iter()
            .map(|c| quote_ident(c))
            .collect::<Vec<_>>()
            .join(", ");
        format!("INSERT INTO {} ({cols}) ", table.qualified())
    }

    pub fn conflict_clause(&self) -> String {
        if self.update_columns.is_empty() {
            return format!(" ON CONFLICT ({}) DO NOTHING", quote_ident(KEY_COLUMN));
        }
        let sets = self
            .update_columns
            .iter()
            .map(|c| {
                let q = quote_ident(c);
                format!("{q} = EXCLUDED.{q}")
            })
            .collect::<Vec<_>>()
            .join(", ");
        format!(" ON CONFLICT ({}) DO UPDATE SET {sets}", quote_ident(KEY_COLUMN))
    }

    /// Values of `row` in `insert_columns` order.
    pub fn row_values<R: UpsertRow + ?Sized>(&self, row: &R) -> Vec<SqlValue> {
        let mut by_name: HashMap<&'static str, SqlValue> = row.values().into_iter().collect();
        self.insert_columns
            .iter()
            .map(|c| by_name.remove(c.as_str()).unwrap_or(SqlValue::Text(None)))
            .collect()
    }
}

/// Storage side of the loader.
#[async_trait]
pub trait BatchWriter<R: UpsertRow>: Send {
    /// Human-readable target, e.g. `public.rounds`.
    fn target(&self) -> String;

    /// Make sure the table exists and return its column names.
    async fn prepare(&mut self) -> sqlx::Result<Vec<String>>;

    /// Write and commit one batch; returns affected rows.
    async fn write_batch(&mut self, plan: &UpsertPlan, batch: &[&R]) -> sqlx::Result<u64>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpsertReport {
    pub target: String,
    pub rows: usize,
    pub batches: usize,
}

impl fmt::Display for UpsertReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Inserted {} rows into {}", self.rows, self.target)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct UpsertLoader {
    batch_size: usize,
}

impl UpsertLoader {
    pub fn new(batch_size: usize) -> Self {
        Self {
            batch_size: batch_size.max(1),
        }
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Configured batch size, shrunk if a full batch would exceed the bind limit.
    pub fn effective_batch_size(&self, columns: usize) -> usize {
        self.batch_size.min(PG_MAX_BINDS / columns.max(1)).max(1)
    }

    #[instrument(skip_all, fields(records = records.len()))]
    pub async fn upsert<R, W>(&self, records: &[R], writer: &mut W) -> Result<UpsertReport, IngestError>
    where
        R: UpsertRow,
        W: BatchWriter<R>,
    {
        let target = writer.target();
        let table_columns = writer
            .prepare()
            .await
            .map_err(|source| IngestError::Provision {
                table: target.clone(),
                source,
            })?;

        let Some(first) = records.first() else {
            info!(table = %target, "no records to upsert");
            return Ok(UpsertReport {
                target,
                rows: 0,
                batches: 0,
            });
        };

        let record_columns: Vec<&str> = first.values().iter().map(|(name, _)| *name).collect();
        let plan = UpsertPlan::build(&record_columns, &table_columns).ok_or_else(|| {
            IngestError::Provision {
                table: target.clone(),
                source: sqlx::Error::ColumnNotFound(KEY_COLUMN.into()),
            }
        })?;
        if !plan.skipped_columns.is_empty() {
            warn!(table = %target, skipped = ?plan.skipped_columns, "record columns missing from table; not written");
        }

        let rows = dedupe_last_wins(records);
        if rows.len() < records.len() {
            warn!(
                table = %target,
                dropped = records.len() - rows.len(),
                "duplicate round_ids in input; keeping the last occurrence"
            );
        }

        let size = self.effective_batch_size(plan.insert_columns.len());
        if size < self.batch_size {
            warn!(configured = self.batch_size, effective = size, "batch size clamped to bind parameter limit");
        }

        let mut committed = 0usize;
        let mut batches = 0usize;
        for (idx, batch) in rows.chunks(size).enumerate() {
            let t0 = Instant::now();
            let affected = writer
                .write_batch(&plan, batch)
                .await
                .map_err(|source| IngestError::Persistence {
                    table: target.clone(),
                    batch: idx + 1,
                    committed,
                    source,
                })?;
            committed += batch.len();
            batches += 1;
            debug!(
                table = %target,
                batch = idx + 1,
                rows = batch.len(),
                affected,
                elapsed_ms = t0.elapsed().as_millis() as u64,
                "batch committed"
            );
        }

        let report = UpsertReport {
            target,
            rows: committed,
            batches,
        };
        info!(batches, "{report}");
        Ok(report)
    }
}

/// Keeps one row per `round_id` (the last one seen) in first-seen position order.
fn dedupe_last_wins<R: UpsertRow>(records: &[R]) -> Vec<&R> {
    let mut last: HashMap<i64, usize> = HashMap::with_capacity(records.len());
    for (i, r) in records.iter().enumerate() {
        last.insert(r.round_id(), i);
    }
    if last.len() == records.len() {
        return records.iter().collect();
    }
    let mut out: Vec<&R> = Vec::with_capacity(last.len());
    let mut slot: HashMap<i64, usize> = HashMap::with_capacity(last.len());
    for r in records {
        match slot.get(&r.round_id()) {
            Some(&pos) => out[pos] = r,
            None => {
                slot.insert(r.round_id(), out.len());
                out.push(r);
            }
        }
    }
    out
}

fn push_sql_value(b: &mut Separated<'_, 'static, Postgres, &'static str>, value: SqlValue) {
    match value {
        SqlValue::BigInt(v) => b.push_bind(v),
        SqlValue::Text(v) => b.push_bind(v),
        SqlValue::Timestamp(v) => b.push_bind(v),
        SqlValue::Json(v) => b.push_bind(v),
    };
}

/// Postgres-backed writer for one of the round tables. Provisioning and column
/// introspection run once; the column list is cached for the writer's lifetime.
pub struct PgTableWriter {
    pool: PgPool,
    table: TableRef,
    kind: TableKind,
    columns: Option<Vec<String>>,
}

impl PgTableWriter {
    pub fn new(db: &Db, table: TableRef, kind: TableKind) -> Self {
        Self {
            pool: db.pool.clone(),
            table,
            kind,
            columns: None,
        }
    }
}

#[async_trait]
impl<R: UpsertRow> BatchWriter<R> for PgTableWriter {
    fn target(&self) -> String {
        self.table.to_string()
    }

    async fn prepare(&mut self) -> sqlx::Result<Vec<String>> {
        if let Some(cols) = &self.columns {
            return Ok(cols.clone());
        }
        schema::provision(&self.pool, &self.table, self.kind).await?;
        let cols = schema::table_columns(&self.pool, &self.table).await?;
        info!(table = %self.table, columns = cols.len(), "table provisioned; columns cached");
        self.columns = Some(cols.clone());
        Ok(cols)
    }

    async fn write_batch(&mut self, plan: &UpsertPlan, batch: &[&R]) -> sqlx::Result<u64> {
        let mut qb: QueryBuilder<'static, Postgres> =
            QueryBuilder::new(plan.insert_prefix(&self.table));
        qb.push_values(batch.iter(), |mut b, row| {
            for value in plan.row_values(*row) {
                push_sql_value(&mut b, value);
            }
        });
        qb.push(plan.conflict_clause());

        let mut tx = self.pool.begin().await?;
        let res = qb.build().persistent(false).execute(&mut *tx).await?;
        tx.commit().await?;
        Ok(res.rows_affected())
    }
}
