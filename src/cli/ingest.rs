use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::info;

use crate::config::IngestConfig;
use crate::database_ops::backfill::RoundTables;
use crate::database_ops::db::Db;
use crate::database_ops::paradise::client::ParaApiClient;
use crate::database_ops::paradise::models::UnifiedRoundRecord;
use crate::database_ops::paradise::pipeline::{IngestPipeline, RunSummary};
use crate::database_ops::schema::{TableKind, TableRef};
use crate::database_ops::upsert::PgTableWriter;
use crate::util::env as env_util;
use crate::util::snapshot::read_snapshot;

pub(crate) async fn connect(cfg: &IngestConfig) -> Result<Db> {
    let database_url = match cfg.database_url.clone() {
        Some(url) => url,
        None => env_util::db_url()?,
    };
    info!(
        url = %env_util::redact_value("DATABASE_URL", &database_url),
        "connecting"
    );
    Db::connect(&database_url, cfg.db_max_connections)
        .await
        .context("connecting to round store")
}

pub(crate) fn metadata_table(cfg: &IngestConfig) -> TableRef {
    TableRef::new(&cfg.schema, &cfg.metadata_table)
}

pub(crate) fn detail_table(cfg: &IngestConfig) -> TableRef {
    TableRef::new(&cfg.schema, &cfg.rounds_table)
}

fn pipeline(cfg: &IngestConfig) -> Result<IngestPipeline<ParaApiClient>> {
    let client = ParaApiClient::new(cfg)?;
    Ok(IngestPipeline::new(Arc::new(client), cfg.clone()))
}

fn detail_writer(db: &Db, cfg: &IngestConfig) -> PgTableWriter {
    PgTableWriter::new(db, detail_table(cfg), TableKind::Detail)
}

fn report(summary: &RunSummary) -> Result<()> {
    println!("{summary}");
    if !summary.failures.is_empty() {
        eprintln!(
            "{} round(s) excluded:\n{}",
            summary.failures.len(),
            serde_json::to_string_pretty(&summary.failures)?
        );
    }
    Ok(())
}

/// Full-detail ingest of `[end, start]`; `start == 0` means the newest round.
pub async fn run_ingest(cfg: IngestConfig, start: i64, end: i64) -> Result<()> {
    let db = connect(&cfg).await?;
    let mut writer = detail_writer(&db, &cfg);
    let summary = pipeline(&cfg)?
        .ingest(start, end, &mut writer)
        .await
        .with_context(|| format!("ingesting rounds {start}..{end}"))?;
    report(&summary)
}

pub async fn run_metadata(cfg: IngestConfig, start: i64, end: i64) -> Result<()> {
    let db = connect(&cfg).await?;
    let mut writer = PgTableWriter::new(&db, metadata_table(&cfg), TableKind::Metadata);
    let summary = pipeline(&cfg)?
        .sync_metadata(start, end, &mut writer)
        .await
        .with_context(|| format!("syncing metadata {start}..{end}"))?;
    report(&summary)
}

pub async fn run_round(cfg: IngestConfig, round_id: i64) -> Result<()> {
    let db = connect(&cfg).await?;
    let mut writer = detail_writer(&db, &cfg);
    let summary = pipeline(&cfg)?
        .ingest_round(round_id, &mut writer)
        .await
        .with_context(|| format!("ingesting round {round_id}"))?;
    report(&summary)
}

/// Detail for every round that has metadata but no detail row yet.
pub async fn run_backfill(cfg: IngestConfig) -> Result<()> {
    let db = connect(&cfg).await?;
    let tables = RoundTables::new(&db, metadata_table(&cfg), detail_table(&cfg));
    let mut writer = detail_writer(&db, &cfg);
    let summary = pipeline(&cfg)?
        .backfill(&tables, &mut writer)
        .await
        .context("backfilling missing round detail")?;
    report(&summary)
}

pub async fn run_replay(cfg: IngestConfig, path: &Path) -> Result<()> {
    let records: Vec<UnifiedRoundRecord> = read_snapshot(path)?;
    info!(path = %path.display(), records = records.len(), "replaying snapshot");
    let db = connect(&cfg).await?;
    let mut writer = detail_writer(&db, &cfg);
    let summary = pipeline(&cfg)?
        .replay(records, &mut writer)
        .await
        .with_context(|| format!("replaying {}", path.display()))?;
    report(&summary)
}
