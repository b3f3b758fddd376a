use std::path::PathBuf;
use std::time::Duration;

use tracing::warn;

use crate::database_ops::paradise::client::RetryPolicy;
use crate::util::env as env_util;

pub const DEFAULT_API_URL: &str = "https://api.paradisestation.org/stats";

/// Everything a pipeline run needs, resolved once and passed by value.
#[derive(Debug, Clone)]
pub struct IngestConfig {
    pub database_url: Option<String>,
    pub db_max_connections: u32,
    pub schema: String,
    pub metadata_table: String,
    pub rounds_table: String,
    pub batch_size: usize,
    pub workers: usize,
    pub call_timeout: Duration,
    pub http_timeout: Duration,
    pub max_retries: u32,
    pub backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub max_pages: usize,
    pub abort_on_partial_failure: bool,
    pub debug_cache: bool,
    pub debug_cache_dir: PathBuf,
    pub api_url: String,
    pub user_agent: String,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            database_url: None,
            db_max_connections: 4,
            schema: "public".into(),
            metadata_table: "round_metadata".into(),
            rounds_table: "rounds".into(),
            batch_size: 1000,
            workers: 2,
            call_timeout: Duration::from_secs(60),
            http_timeout: Duration::from_secs(30),
            max_retries: 4,
            backoff_ms: 500,
            max_backoff_ms: 15_000,
            max_pages: 10_000,
            abort_on_partial_failure: false,
            debug_cache: false,
            debug_cache_dir: PathBuf::from(".para_cache"),
            api_url: DEFAULT_API_URL.into(),
            user_agent: "para-stats-ingest/0.1".into(),
        }
    }
}

impl IngestConfig {
    pub fn from_env() -> Self {
        let d = Self::default();
        let cfg = Self {
            database_url: env_util::db_url().ok(),
            db_max_connections: env_util::env_parse("DB_MAX_CONNS", d.db_max_connections).max(1),
            schema: env_util::env_opt("PARA_DB_SCHEMA")
                .or_else(|| env_util::env_opt("SQLALCHEMY_ODS_SCHEMA"))
                .unwrap_or(d.schema),
            metadata_table: env_util::env_opt("PARA_METADATA_TABLE").unwrap_or(d.metadata_table),
            rounds_table: env_util::env_opt("PARA_ROUNDS_TABLE")
                .or_else(|| env_util::env_opt("SQLALCHEMY_ODS_TABLE"))
                .unwrap_or(d.rounds_table),
            batch_size: env_util::env_parse("PARA_BATCH_SIZE", d.batch_size).max(1),
            workers: env_util::env_parse("PARA_WORKERS", d.workers).max(1),
            call_timeout: Duration::from_secs(
                env_util::env_parse("PARA_CALL_TIMEOUT_SECS", d.call_timeout.as_secs()).max(1),
            ),
            http_timeout: Duration::from_secs(
                env_util::env_parse("PARA_HTTP_TIMEOUT_SECS", d.http_timeout.as_secs()).max(1),
            ),
            max_retries: env_util::env_parse("PARA_MAX_RETRIES", d.max_retries),
            backoff_ms: env_util::env_parse("PARA_BACKOFF_MS", d.backoff_ms),
            max_backoff_ms: env_util::env_parse("PARA_MAX_BACKOFF_MS", d.max_backoff_ms),
            max_pages: env_util::env_parse("PARA_MAX_PAGES", d.max_pages).max(1),
            abort_on_partial_failure: env_util::env_flag(
                "PARA_ABORT_ON_PARTIAL_FAILURE",
                d.abort_on_partial_failure,
            ),
            debug_cache: env_util::env_flag("PARA_DEBUG_CACHE", d.debug_cache),
            debug_cache_dir: env_util::env_opt("PARA_DEBUG_CACHE_DIR")
                .map(PathBuf::from)
                .unwrap_or(d.debug_cache_dir),
            api_url: env_util::env_opt("PARA_API_URL").unwrap_or(d.api_url),
            user_agent: env_util::env_opt("PARA_USER_AGENT").unwrap_or(d.user_agent),
        };
        let budget = cfg.retry_budget();
        if cfg.call_timeout < budget {
            warn!(
                call_timeout_secs = cfg.call_timeout.as_secs(),
                retry_budget_ms = budget.as_millis() as u64,
                "PARA_CALL_TIMEOUT_SECS is shorter than the HTTP retry budget; the longer one applies"
            );
        }
        cfg
    }

    /// Worst-case duration of one API call through the client's retry loop.
    pub fn retry_budget(&self) -> Duration {
        RetryPolicy::from_config(self).worst_case(self.http_timeout)
    }

    /// Deadline the detail pool puts on each call. Never shorter than the retry budget,
    /// so a call that is still backing off is not cut off mid-retry.
    pub fn pool_call_timeout(&self) -> Duration {
        self.call_timeout.max(self.retry_budget())
    }

    /// Keys worth showing in the preflight snapshot.
    pub const LOGGED_KEYS: &'static [&'static str] = &[
        "DATABASE_URL",
        "PARA_DB_SCHEMA",
        "PARA_METADATA_TABLE",
        "PARA_ROUNDS_TABLE",
        "PARA_BATCH_SIZE",
        "PARA_WORKERS",
        "PARA_API_URL",
        "PARA_ABORT_ON_PARTIAL_FAILURE",
        "PARA_DEBUG_CACHE",
    ];
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_pool_deadline_covers_every_retry() {
        let cfg = IngestConfig::default();
        // 5 attempts of 30s plus 7.5s of backoff with a quarter of jitter on top.
        assert_eq!(cfg.retry_budget(), Duration::from_millis(159_375));
        assert!(cfg.pool_call_timeout() >= cfg.retry_budget());
        assert!(cfg.pool_call_timeout() > cfg.call_timeout);
    }

    #[test]
    fn longer_call_timeout_is_kept() {
        let cfg = IngestConfig {
            call_timeout: Duration::from_secs(600),
            ..IngestConfig::default()
        };
        assert_eq!(cfg.pool_call_timeout(), Duration::from_secs(600));
    }
}
