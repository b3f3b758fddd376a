use anyhow::{anyhow, Context};
use tracing_subscriber::EnvFilter;

use crate::util::env as env_util;

/// Used when `RUST_LOG` is not set.
pub const DEFAULT_FILTER: &str = "info,sqlx=warn";

fn filter_or(default_filter: &str) -> anyhow::Result<EnvFilter> {
    match EnvFilter::try_from_default_env() {
        Ok(f) => Ok(f),
        Err(_) => EnvFilter::try_new(default_filter)
            .with_context(|| format!("invalid log filter '{default_filter}'")),
    }
}

/// Installs the global fmt subscriber. `PARA_LOG_COMPACT=1` switches to single-line
/// output without source locations, for cron logs.
pub fn init_tracing(default_filter: &str) -> anyhow::Result<()> {
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter_or(default_filter)?)
        .with_target(true);
    let res = if env_util::env_flag("PARA_LOG_COMPACT", false) {
        builder.compact().try_init()
    } else {
        builder.with_file(true).with_line_number(true).try_init()
    };
    res.map_err(|e| anyhow!("failed to initialize tracing: {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_filter_parses() {
        assert!(EnvFilter::try_new(DEFAULT_FILTER).is_ok());
    }
}
