use std::time::Duration;

use thiserror::Error;

/// Failure of a single outbound API call, after the retry policy gave up.
#[derive(Debug, Clone, Error)]
pub enum FetchError {
    /// Connection resets, 429s, 5xx: retried, then surfaced once attempts run out.
    #[error("transient failure on {endpoint} after {attempts} attempt(s): {message}")]
    Transient {
        endpoint: String,
        attempts: u32,
        message: String,
    },
    #[error("request to {endpoint} rejected (status={status}): {message}")]
    Permanent {
        endpoint: String,
        status: u16,
        message: String,
    },
    #[error("malformed response from {endpoint}: {message}")]
    Decode { endpoint: String, message: String },
    #[error("{endpoint} timed out after {}ms", .after.as_millis())]
    Timeout { endpoint: String, after: Duration },
    #[error("{endpoint} cancelled before completion")]
    Cancelled { endpoint: String },
}

impl FetchError {
    pub fn endpoint(&self) -> &str {
        match self {
            Self::Transient { endpoint, .. }
            | Self::Permanent { endpoint, .. }
            | Self::Decode { endpoint, .. }
            | Self::Timeout { endpoint, .. }
            | Self::Cancelled { endpoint } => endpoint,
        }
    }
}

/// Which per-round sub-resource a failure belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Metadata,
    PlayerCounts,
    Blackbox,
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Stage::Metadata => "metadata",
            Stage::PlayerCounts => "playercounts",
            Stage::Blackbox => "blackbox",
        };
        f.write_str(s)
    }
}

/// A round excluded from a run because one of its fetches failed.
#[derive(Debug, Clone, serde::Serialize)]
pub struct RoundFailure {
    pub round_id: i64,
    pub stage: Stage,
    pub error: String,
}

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("invalid round range: start {start} is below end boundary {end}")]
    InvalidRange { start: i64, end: i64 },

    #[error("no rounds found at cursor {cursor}")]
    RoundsNotFound { cursor: i64 },

    #[error("pagination broke at cursor {cursor} after {pages} page(s): {reason}")]
    Pagination {
        cursor: i64,
        pages: usize,
        reason: String,
    },

    #[error("pagination request failed at cursor {cursor}")]
    PageFetch {
        cursor: i64,
        #[source]
        source: FetchError,
    },

    #[error("round {round_id}: {stage} fetch failed")]
    RoundFetch {
        round_id: i64,
        stage: Stage,
        #[source]
        source: FetchError,
    },

    #[error("aborted detail fetch: {} round(s) failed{}", .failures.len(), describe_first(.failures))]
    PartialFailure { failures: Vec<RoundFailure> },

    #[error("sequence alignment violated ({detail}): metadata={metadata} player_counts={player_counts} stats={stats}")]
    Alignment {
        metadata: usize,
        player_counts: usize,
        stats: usize,
        detail: String,
    },

    #[error("failed to provision {table}")]
    Provision {
        table: String,
        #[source]
        source: sqlx::Error,
    },

    #[error("batch {batch} into {table} failed; {committed} row(s) already committed")]
    Persistence {
        table: String,
        batch: usize,
        committed: usize,
        #[source]
        source: sqlx::Error,
    },

    #[error(transparent)]
    Database(#[from] sqlx::Error),

    #[error("snapshot {path}: {message}")]
    Snapshot { path: String, message: String },
}

fn describe_first(failures: &[RoundFailure]) -> String {
    failures
        .first()
        .map(|f| format!(", first: round {} {} ({})", f.round_id, f.stage, f.error))
        .unwrap_or_default()
}
