//! Table definitions for the two round tables plus the DDL/introspection helpers the
//! upsert path relies on.
use std::fmt;

use sqlx::PgPool;

/// Conflict key shared by both tables.
pub const KEY_COLUMN: &str = "round_id";

/// Schema-qualified table name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableRef {
    pub schema: String,
    pub table: String,
}

impl TableRef {
    pub fn new(schema: impl Into<String>, table: impl Into<String>) -> Self {
        Self {
            schema: schema.into(),
            table: table.into(),
        }
    }

    /// `"schema"."table"`, safe to splice into SQL.
    pub fn qualified(&self) -> String {
        format!("{}.{}", quote_ident(&self.schema), quote_ident(&self.table))
    }
}

impl fmt::Display for TableRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.schema, self.table)
    }
}

pub fn quote_ident(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

#[derive(Debug, Clone, Copy)]
pub struct ColumnDef {
    pub name: &'static str,
    pub sql_type: &'static str,
}

const fn col(name: &'static str, sql_type: &'static str) -> ColumnDef {
    ColumnDef { name, sql_type }
}

pub const METADATA_COLUMNS: &[ColumnDef] = &[
    col("round_id", "BIGINT PRIMARY KEY"),
    col("game_mode", "TEXT"),
    col("game_mode_result", "TEXT"),
    col("end_state", "TEXT"),
    col("map_name", "TEXT"),
    col("server_id", "TEXT"),
    col("commit_hash", "TEXT"),
    col("initialize_datetime", "TIMESTAMP"),
    col("start_datetime", "TIMESTAMP"),
    col("shutdown_datetime", "TIMESTAMP"),
    col("end_datetime", "TIMESTAMP"),
    col("extra", "JSONB NOT NULL DEFAULT '{}'::jsonb"),
    // Not part of any payload, so upserts never overwrite it.
    col("ingested_at", "TIMESTAMPTZ NOT NULL DEFAULT now()"),
];

pub const DETAIL_ONLY_COLUMNS: &[ColumnDef] = &[
    col("player_counts", "JSONB NOT NULL DEFAULT '[]'::jsonb"),
    col("stats", "JSONB NOT NULL DEFAULT '[]'::jsonb"),
];

/// Which of the two round tables a writer provisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TableKind {
    Metadata,
    Detail,
}

impl TableKind {
    pub fn columns(self) -> Vec<ColumnDef> {
        let mut out = METADATA_COLUMNS.to_vec();
        if self == TableKind::Detail {
            out.extend_from_slice(DETAIL_ONLY_COLUMNS);
        }
        out
    }
}

pub fn create_schema_sql(table: &TableRef) -> String {
    format!("CREATE SCHEMA IF NOT EXISTS {}", quote_ident(&table.schema))
}

pub fn create_table_sql(table: &TableRef, kind: TableKind) -> String {
    let cols = kind
        .columns()
        .iter()
        .map(|c| format!("{} {}", quote_ident(c.name), c.sql_type))
        .collect::<Vec<_>>()
        .join(", ");
    format!("CREATE TABLE IF NOT EXISTS {} ({cols})", table.qualified())
}

/// Idempotent: safe to run before every load.
pub async fn provision(pool: &PgPool, table: &TableRef, kind: TableKind) -> sqlx::Result<()> {
    sqlx::raw_sql(&create_schema_sql(table)).execute(pool).await?;
    sqlx::raw_sql(&create_table_sql(table, kind))
        .execute(pool)
        .await?;
    Ok(())
}

/// Column names of `table` in ordinal order.
pub async fn table_columns(pool: &PgPool, table: &TableRef) -> sqlx::Result<Vec<String>> {
    sqlx::query_scalar(
        "SELECT column_name::text
         FROM information_schema.columns
         WHERE table_schema = $1 AND table_name = $2
         ORDER BY ordinal_position",
    )
    .persistent(false)
    .bind(&table.schema)
    .bind(&table.table)
    .fetch_all(pool)
    .await
}

/// Whether `table` is visible at all (used by stats reporting).
pub async fn table_exists(pool: &PgPool, table: &TableRef) -> sqlx::Result<bool> {
    sqlx::query_scalar("SELECT to_regclass($1) IS NOT NULL")
        .persistent(false)
        .bind(table.qualified())
        .fetch_one(pool)
        .await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn qualified_names_are_quoted() {
        let t = TableRef::new("ods", "round\"s");
        assert_eq!(t.qualified(), "\"ods\".\"round\"\"s\"");
        assert_eq!(t.to_string(), "ods.round\"s");
    }

    #[test]
    fn detail_table_ddl_embeds_payload_columns() {
        let t = TableRef::new("public", "rounds");
        let ddl = create_table_sql(&t, TableKind::Detail);
        assert!(ddl.starts_with("CREATE TABLE IF NOT EXISTS \"public\".\"rounds\""));
        assert!(ddl.contains("\"round_id\" BIGINT PRIMARY KEY"));
        assert!(ddl.contains("\"player_counts\" JSONB"));
        assert!(ddl.contains("\"stats\" JSONB"));

        let meta = create_table_sql(&t, TableKind::Metadata);
        assert!(!meta.contains("player_counts"));
        assert_eq!(create_schema_sql(&t), "CREATE SCHEMA IF NOT EXISTS \"public\"");
    }
}
