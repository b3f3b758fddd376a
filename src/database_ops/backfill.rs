//! Catch-up: rounds whose listing metadata is stored but whose full detail is not.

use async_trait::async_trait;
use serde::Serialize;
use sqlx::{postgres::PgRow, Row};
use tracing::{info, instrument, warn};

use crate::database_ops::db::Db;
use crate::database_ops::paradise::models::RoundMetadata;
use crate::database_ops::schema::{self, TableRef};
use crate::error::IngestError;

/// Persisted state the detector reads from.
#[async_trait]
pub trait CatchupSource: Send + Sync {
    /// Metadata rows with no detail row, newest first.
    async fn missing_detail(&self) -> Result<Vec<RoundMetadata>, IngestError>;
    /// Detail rows with no metadata row.
    async fn orphaned_detail_count(&self) -> Result<i64, IngestError>;
}

/// Work list for the backfill path. Orphans are reported but never acted on.
#[instrument(skip(source))]
pub async fn find_missing<S: CatchupSource + ?Sized>(
    source: &S,
) -> Result<Vec<RoundMetadata>, IngestError> {
    let missing = source.missing_detail().await?;
    let orphans = source.orphaned_detail_count().await?;
    if orphans > 0 {
        warn!(orphans, "detail rows without metadata; not part of the backlog");
    }
    if missing.is_empty() {
        info!("no backlog: every metadata row has detail");
    } else {
        info!(
            missing = missing.len(),
            newest = missing.first().map(|m| m.round_id),
            oldest = missing.last().map(|m| m.round_id),
            "backlog found"
        );
    }
    Ok(missing)
}

/// The metadata/detail table pair in Postgres.
pub struct RoundTables {
    db: Db,
    pub metadata: TableRef,
    pub detail: TableRef,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BacklogStats {
    pub metadata_rows: i64,
    pub detail_rows: i64,
    pub missing_detail: i64,
    pub orphaned_detail: i64,
}

impl RoundTables {
    pub fn new(db: &Db, metadata: TableRef, detail: TableRef) -> Self {
        Self {
            db: db.clone(),
            metadata,
            detail,
        }
    }

    async fn count(&self, sql: &str) -> Result<i64, IngestError> {
        let n: i64 = sqlx::query_scalar(sql)
            .persistent(false)
            .fetch_one(&self.db.pool)
            .await?;
        Ok(n)
    }

    /// Counts for `db-missing-stats`. Missing tables count as empty.
    pub async fn stats(&self) -> Result<BacklogStats, IngestError> {
        let pool = &self.db.pool;
        let has_meta = schema::table_exists(pool, &self.metadata).await?;
        let has_detail = schema::table_exists(pool, &self.detail).await?;

        let mut out = BacklogStats::default();
        if has_meta {
            out.metadata_rows = self
                .count(&format!("SELECT COUNT(*)::BIGINT FROM {}", self.metadata.qualified()))
                .await?;
        }
        if has_detail {
            out.detail_rows = self
                .count(&format!("SELECT COUNT(*)::BIGINT FROM {}", self.detail.qualified()))
                .await?;
        }
        match (has_meta, has_detail) {
            (true, true) => {
                out.missing_detail = self
                    .count(&anti_join_sql("COUNT(*)::BIGINT", &self.metadata, &self.detail))
                    .await?;
                out.orphaned_detail = self
                    .count(&anti_join_sql("COUNT(*)::BIGINT", &self.detail, &self.metadata))
                    .await?;
            }
            (true, false) => out.missing_detail = out.metadata_rows,
            (false, true) => out.orphaned_detail = out.detail_rows,
            (false, false) => {}
        }
        Ok(out)
    }
}

fn anti_join_sql(select: &str, from: &TableRef, absent_in: &TableRef) -> String {
    format!(
        "SELECT {select} FROM {} src WHERE NOT EXISTS \
         (SELECT 1 FROM {} dst WHERE dst.round_id = src.round_id)",
        from.qualified(),
        absent_in.qualified()
    )
}

/// Metadata rows lacking detail, newest first. With no detail table every metadata row
/// is missing.
fn missing_sql(metadata: &TableRef, detail: Option<&TableRef>) -> String {
    let cols = schema::METADATA_COLUMNS
        .iter()
        .filter(|c| c.name != "ingested_at")
        .map(|c| format!("src.{}", schema::quote_ident(c.name)))
        .collect::<Vec<_>>()
        .join(", ");
    let select = match detail {
        Some(detail) => anti_join_sql(&cols, metadata, detail),
        None => format!("SELECT {cols} FROM {} src", metadata.qualified()),
    };
    format!("{select} ORDER BY src.round_id DESC")
}

fn metadata_from_row(row: &PgRow) -> Result<RoundMetadata, sqlx::Error> {
    let extra: Option<serde_json::Value> = row.try_get("extra")?;
    Ok(RoundMetadata {
        round_id: row.try_get("round_id")?,
        game_mode: row.try_get("game_mode")?,
        game_mode_result: row.try_get("game_mode_result")?,
        end_state: row.try_get("end_state")?,
        map_name: row.try_get("map_name")?,
        server_id: row.try_get("server_id")?,
        commit_hash: row.try_get("commit_hash")?,
        initialize_datetime: row.try_get("initialize_datetime")?,
        start_datetime: row.try_get("start_datetime")?,
        shutdown_datetime: row.try_get("shutdown_datetime")?,
        end_datetime: row.try_get("end_datetime")?,
        extra: match extra {
            Some(serde_json::Value::Object(map)) => map,
            _ => serde_json::Map::new(),
        },
    })
}

#[async_trait]
impl CatchupSource for RoundTables {
    async fn missing_detail(&self) -> Result<Vec<RoundMetadata>, IngestError> {
        let pool = &self.db.pool;
        if !schema::table_exists(pool, &self.metadata).await? {
            return Ok(Vec::new());
        }
        // A metadata-only history has no detail table until the first detail write.
        let detail = schema::table_exists(pool, &self.detail)
            .await?
            .then_some(&self.detail);
        let rows = sqlx::query(&missing_sql(&self.metadata, detail))
            .persistent(false)
            .fetch_all(pool)
            .await?;
        let out = rows
            .iter()
            .map(metadata_from_row)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(out)
    }

    async fn orphaned_detail_count(&self) -> Result<i64, IngestError> {
        Ok(self.stats().await?.orphaned_detail)
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use std::collections::BTreeSet;

    use super::*;

    /// Two id sets standing in for the metadata and detail tables.
    #[derive(Debug, Default)]
    pub struct MemoryTables {
        pub metadata: BTreeSet<i64>,
        pub detail: BTreeSet<i64>,
    }

    impl MemoryTables {
        pub fn new(metadata: impl IntoIterator<Item = i64>, detail: impl IntoIterator<Item = i64>) -> Self {
            Self {
                metadata: metadata.into_iter().collect(),
                detail: detail.into_iter().collect(),
            }
        }
    }

    #[async_trait]
    impl CatchupSource for MemoryTables {
        async fn missing_detail(&self) -> Result<Vec<RoundMetadata>, IngestError> {
            let mut ids: Vec<i64> = self.metadata.difference(&self.detail).copied().collect();
            ids.reverse();
            Ok(ids.into_iter().map(RoundMetadata::new).collect())
        }

        async fn orphaned_detail_count(&self) -> Result<i64, IngestError> {
            Ok(self.detail.difference(&self.metadata).count() as i64)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::MemoryTables;
    use super::*;

    fn ids(rounds: &[RoundMetadata]) -> Vec<i64> {
        rounds.iter().map(|r| r.round_id).collect()
    }

    #[tokio::test]
    async fn missing_is_the_set_difference_newest_first() {
        let tables = MemoryTables::new([1, 2, 3, 4], [1, 3]);
        let missing = find_missing(&tables).await.unwrap();
        assert_eq!(ids(&missing), vec![4, 2]);
    }

    #[tokio::test]
    async fn no_backlog_is_an_empty_list() {
        let tables = MemoryTables::new([1, 2], [1, 2]);
        assert!(find_missing(&tables).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn orphans_do_not_enter_the_backlog() {
        let tables = MemoryTables::new([5, 6], [5, 7, 8]);
        assert_eq!(ids(&find_missing(&tables).await.unwrap()), vec![6]);
        assert_eq!(tables.orphaned_detail_count().await.unwrap(), 2);
    }

    #[test]
    fn missing_query_is_an_ordered_anti_join() {
        let sql = missing_sql(
            &TableRef::new("ods", "round_metadata"),
            Some(&TableRef::new("ods", "rounds")),
        );
        assert!(sql.starts_with("SELECT src.\"round_id\", "));
        assert!(sql.contains("FROM \"ods\".\"round_metadata\" src WHERE NOT EXISTS"));
        assert!(sql.contains("SELECT 1 FROM \"ods\".\"rounds\" dst WHERE dst.round_id = src.round_id"));
        assert!(sql.ends_with("ORDER BY src.round_id DESC"));
        assert!(!sql.contains("ingested_at"));
    }

    #[test]
    fn missing_query_without_detail_table_lists_all_metadata() {
        let sql = missing_sql(&TableRef::new("ods", "round_metadata"), None);
        assert!(sql.contains("FROM \"ods\".\"round_metadata\" src ORDER BY src.round_id DESC"));
        assert!(!sql.contains("NOT EXISTS"));
    }
}
