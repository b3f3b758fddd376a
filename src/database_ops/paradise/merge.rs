use tracing::{debug, warn};

use super::fetcher::{DetailBatch, Slot};
use super::models::{RoundMetadata, UnifiedRoundRecord};
use crate::error::{IngestError, RoundFailure, Stage};

/// Records ready to persist plus the rounds left out of them.
#[derive(Debug, Clone, Default)]
pub struct MergedBatch {
    pub records: Vec<UnifiedRoundRecord>,
    pub failures: Vec<RoundFailure>,
}

/// Attach `details.player_counts[i]` and `details.stats[i]` to `metadata[i]`.
///
/// The join is positional. Lengths and the round id at every position are checked, and
/// any disagreement is an alignment error rather than something to paper over.
pub fn merge_rounds(
    metadata: Vec<RoundMetadata>,
    details: DetailBatch,
) -> Result<MergedBatch, IngestError> {
    let DetailBatch {
        round_ids,
        player_counts,
        stats,
    } = details;

    let lens = (metadata.len(), player_counts.len(), stats.len());
    if lens.0 != lens.1 || lens.0 != lens.2 || lens.0 != round_ids.len() {
        return Err(IngestError::Alignment {
            metadata: lens.0,
            player_counts: lens.1,
            stats: lens.2,
            detail: format!("length mismatch, fetched ids={}", round_ids.len()),
        });
    }
    if let Some((pos, (m, id))) = metadata
        .iter()
        .zip(&round_ids)
        .enumerate()
        .find(|(_, (m, id))| m.round_id != **id)
    {
        return Err(IngestError::Alignment {
            metadata: lens.0,
            player_counts: lens.1,
            stats: lens.2,
            detail: format!(
                "position {pos}: metadata round {} paired with fetched round {id}",
                m.round_id
            ),
        });
    }

    let mut out = MergedBatch {
        records: Vec::with_capacity(metadata.len()),
        failures: Vec::new(),
    };
    for ((meta, counts), log) in metadata.into_iter().zip(player_counts).zip(stats) {
        match (counts, log) {
            (Slot::Ready(player_counts), Slot::Ready(stats)) => {
                out.records.push(UnifiedRoundRecord {
                    metadata: meta,
                    player_counts,
                    stats,
                });
            }
            (counts, log) => {
                for (stage, err) in [
                    (Stage::PlayerCounts, counts.failure()),
                    (Stage::Blackbox, log.failure()),
                ] {
                    if let Some(e) = err {
                        out.failures.push(RoundFailure {
                            round_id: meta.round_id,
                            stage,
                            error: e.to_string(),
                        });
                    }
                }
            }
        }
    }

    if out.failures.is_empty() {
        debug!(records = out.records.len(), "rounds merged");
    } else {
        warn!(
            records = out.records.len(),
            excluded = out.failures.len(),
            "rounds merged with exclusions"
        );
    }
    Ok(out)
}
