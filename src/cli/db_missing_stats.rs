use anyhow::Result;
use serde_json::{json, Value};
use tracing::info;

use crate::cli::ingest::{connect, detail_table, metadata_table};
use crate::config::IngestConfig;
use crate::database_ops::backfill::{BacklogStats, RoundTables};

#[derive(Debug, Clone, Default)]
pub struct DbMissingStatsConfig {
    /// Optional override for the Postgres connection string.
    pub database_url: Option<String>,
}

fn render(tables: &RoundTables, stats: BacklogStats) -> Value {
    json!({
        "metadata_table": tables.metadata.to_string(),
        "detail_table": tables.detail.to_string(),
        "metadata_rows": stats.metadata_rows,
        "detail_rows": stats.detail_rows,
        "missing_detail": stats.missing_detail,
        "orphaned_detail": stats.orphaned_detail,
    })
}

pub async fn run(cfg: DbMissingStatsConfig) -> Result<()> {
    let mut ingest = IngestConfig::from_env();
    if cfg.database_url.is_some() {
        ingest.database_url = cfg.database_url;
    }
    let db = connect(&ingest).await?;
    let tables = RoundTables::new(&db, metadata_table(&ingest), detail_table(&ingest));

    let stats = tables.stats().await?;
    println!("{}", serde_json::to_string_pretty(&render(&tables, stats))?);
    info!(missing = stats.missing_detail, orphans = stats.orphaned_detail, "db_missing_stats done");
    Ok(())
}
