use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;
use tracing::{info, instrument, warn};

use super::client::RoundApi;
use super::fetcher::DetailFetcher;
use super::merge::{merge_rounds, MergedBatch};
use super::models::{normalize_blackbox, RoundMetadata, UnifiedRoundRecord};
use super::paginator::CursorPaginator;
use crate::config::IngestConfig;
use crate::database_ops::backfill::{find_missing, CatchupSource};
use crate::database_ops::upsert::{BatchWriter, UpsertLoader, UpsertReport};
use crate::error::{FetchError, IngestError, RoundFailure, Stage};
use crate::util::snapshot::SnapshotCache;

/// Outcome of one pipeline run.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RunSummary {
    pub target: String,
    pub fetched: usize,
    pub written: usize,
    pub batches: usize,
    pub failures: Vec<RoundFailure>,
}

impl RunSummary {
    fn absorb(&mut self, report: UpsertReport) {
        self.target = report.target;
        self.written += report.rows;
        self.batches += report.batches;
    }
}

impl fmt::Display for RunSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Inserted {} rows into {}", self.written, self.target)
    }
}

/// Paginate, fetch detail, merge, upsert. One instance per process; each method is a
/// self-contained run.
pub struct IngestPipeline<A: ?Sized> {
    api: Arc<A>,
    cfg: IngestConfig,
    cache: SnapshotCache,
}

impl<A: RoundApi + ?Sized> IngestPipeline<A> {
    pub fn new(api: Arc<A>, cfg: IngestConfig) -> Self {
        let cache = SnapshotCache::from_config(&cfg);
        Self { api, cfg, cache }
    }

    pub fn with_cache(mut self, cache: SnapshotCache) -> Self {
        self.cache = cache;
        self
    }

    fn loader(&self) -> UpsertLoader {
        UpsertLoader::new(self.cfg.batch_size)
    }

    fn fetcher(&self) -> DetailFetcher<A> {
        DetailFetcher::new(Arc::clone(&self.api), self.cfg.workers, self.cfg.pool_call_timeout())
            .abort_on_partial_failure(self.cfg.abort_on_partial_failure)
    }

    /// `0` resolves to the newest round so snapshot names stay stable.
    async fn resolve_start(&self, start: i64) -> Result<i64, IngestError> {
        if start != 0 {
            return Ok(start);
        }
        let latest = self
            .api
            .latest_round_id()
            .await
            .map_err(|source| IngestError::PageFetch { cursor: 0, source })?;
        let latest = latest.ok_or(IngestError::RoundsNotFound { cursor: 0 })?;
        info!(latest, "resolved start cursor to newest round");
        Ok(latest)
    }

    pub async fn list_rounds(&self, start: i64, end: i64) -> Result<Vec<RoundMetadata>, IngestError> {
        CursorPaginator::new(&*self.api, self.cfg.max_pages)
            .fetch_range(start, end)
            .await
    }

    /// Detail fetch and merge for an already-listed set of rounds.
    pub async fn collect_rounds(&self, metadata: Vec<RoundMetadata>) -> Result<MergedBatch, IngestError> {
        let ids: Vec<i64> = metadata.iter().map(|m| m.round_id).collect();
        let details = self.fetcher().fetch(&ids).await?;
        merge_rounds(metadata, details)
    }

    /// Merged records for `[end, start]`, served from the snapshot cache when one exists.
    #[instrument(skip(self))]
    pub async fn collect_range(&self, start: i64, end: i64) -> Result<MergedBatch, IngestError> {
        let start = self.resolve_start(start).await?;
        if let Some(records) = self.cache.lookup::<Vec<UnifiedRoundRecord>>(start, end)? {
            info!(start, end, records = records.len(), "using cached snapshot");
            return Ok(MergedBatch {
                records,
                failures: Vec::new(),
            });
        }
        let metadata = self.list_rounds(start, end).await?;
        let merged = self.collect_rounds(metadata).await?;
        if merged.failures.is_empty() {
            self.cache.store(start, end, &merged.records)?;
        } else if self.cache.is_enabled() {
            warn!(
                start,
                end,
                failed = merged.failures.len(),
                "partial run not cached; failed rounds will be refetched"
            );
        }
        Ok(merged)
    }

    #[instrument(skip(self, writer))]
    pub async fn ingest<W>(&self, start: i64, end: i64, writer: &mut W) -> Result<RunSummary, IngestError>
    where
        W: BatchWriter<UnifiedRoundRecord>,
    {
        let t0 = Instant::now();
        let merged = self.collect_range(start, end).await?;
        let summary = self.load(merged, writer).await?;
        info!(
            written = summary.written,
            failed = summary.failures.len(),
            elapsed_ms = t0.elapsed().as_millis() as u64,
            "{summary}"
        );
        Ok(summary)
    }

    /// Listing metadata only, into the metadata table.
    #[instrument(skip(self, writer))]
    pub async fn sync_metadata<W>(&self, start: i64, end: i64, writer: &mut W) -> Result<RunSummary, IngestError>
    where
        W: BatchWriter<RoundMetadata>,
    {
        let start = self.resolve_start(start).await?;
        let rounds = self.list_rounds(start, end).await?;
        let report = self.loader().upsert(&rounds, writer).await?;
        let mut summary = RunSummary {
            fetched: rounds.len(),
            ..RunSummary::default()
        };
        summary.absorb(report);
        info!(written = summary.written, "{summary}");
        Ok(summary)
    }

    /// All three endpoints for one round, then a single-row upsert.
    #[instrument(skip(self, writer))]
    pub async fn ingest_round<W>(&self, round_id: i64, writer: &mut W) -> Result<RunSummary, IngestError>
    where
        W: BatchWriter<UnifiedRoundRecord>,
    {
        let fetch_err = move |stage: Stage| {
            move |source: FetchError| IngestError::RoundFetch { round_id, stage, source }
        };
        let metadata = self
            .api
            .metadata(round_id)
            .await
            .map_err(fetch_err(Stage::Metadata))?;
        let (counts, stats) = tokio::join!(self.api.player_counts(round_id), self.api.blackbox(round_id));
        let record = UnifiedRoundRecord {
            metadata,
            player_counts: counts.map_err(fetch_err(Stage::PlayerCounts))?,
            stats: normalize_blackbox(stats.map_err(fetch_err(Stage::Blackbox))?),
        };
        let merged = MergedBatch {
            records: vec![record],
            failures: Vec::new(),
        };
        self.load(merged, writer).await
    }

    /// Works through the catch-up backlog one batch-sized chunk at a time; each chunk is
    /// committed before the next is fetched.
    #[instrument(skip_all)]
    pub async fn backfill<S, W>(&self, source: &S, writer: &mut W) -> Result<RunSummary, IngestError>
    where
        S: CatchupSource + ?Sized,
        W: BatchWriter<UnifiedRoundRecord>,
    {
        let target = writer.target();
        // The anti-join reads the detail table, so it has to exist before the backlog query.
        writer
            .prepare()
            .await
            .map_err(|e| IngestError::Provision {
                table: target.clone(),
                source: e,
            })?;
        let missing = find_missing(source).await?;
        let mut summary = RunSummary {
            target,
            ..RunSummary::default()
        };
        let chunk_size = self.cfg.batch_size.max(1);
        let chunks = missing.len().div_ceil(chunk_size);
        for (i, chunk) in missing.chunks(chunk_size).enumerate() {
            let merged = self.collect_rounds(chunk.to_vec()).await?;
            let part = self.load(merged, writer).await?;
            summary.fetched += part.fetched;
            summary.written += part.written;
            summary.batches += part.batches;
            summary.failures.extend(part.failures);
            info!(chunk = i + 1, chunks, written = summary.written, "backlog chunk committed");
        }
        info!(written = summary.written, failed = summary.failures.len(), "{summary}");
        Ok(summary)
    }

    /// Upserts previously captured records without touching the API.
    pub async fn replay<W>(&self, records: Vec<UnifiedRoundRecord>, writer: &mut W) -> Result<RunSummary, IngestError>
    where
        W: BatchWriter<UnifiedRoundRecord>,
    {
        let merged = MergedBatch {
            records,
            failures: Vec::new(),
        };
        let summary = self.load(merged, writer).await?;
        info!(written = summary.written, "{summary}");
        Ok(summary)
    }

    async fn load<W>(&self, merged: MergedBatch, writer: &mut W) -> Result<RunSummary, IngestError>
    where
        W: BatchWriter<UnifiedRoundRecord>,
    {
        for f in &merged.failures {
            warn!(round_id = f.round_id, stage = %f.stage, error = %f.error, "round excluded from load");
        }
        let report = self.loader().upsert(&merged.records, writer).await?;
        let mut summary = RunSummary {
            fetched: merged.records.len() + merged.failures.len(),
            failures: merged.failures,
            ..RunSummary::default()
        };
        summary.absorb(report);
        Ok(summary)
    }
}
