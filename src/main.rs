use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use para_stats::cli::{db_missing_stats, ingest};
use para_stats::config::IngestConfig;
use para_stats::tracing::{init_tracing, DEFAULT_FILTER};
use para_stats::util::env;

#[derive(Parser, Debug)]
#[command(name = "para-stats", version, about = "Paradise Station round ingestion")]
struct Cli {
    /// Optional override for the database URL
    #[arg(long, global = true)]
    db_url: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
#[command(rename_all = "kebab-case")]
enum Commands {
    /// Ingest full round detail for a cursor range (newest first)
    Ingest {
        /// Newest round id to start from; 0 means the latest round
        #[arg(long, default_value_t = 0)]
        start: i64,
        /// Oldest round id to include
        #[arg(long)]
        end: i64,
    },
    /// Fetch detail for rounds that have metadata but no detail row
    Backfill,
    /// Upsert listing metadata only
    Metadata {
        #[arg(long, default_value_t = 0)]
        start: i64,
        #[arg(long)]
        end: i64,
    },
    /// Ingest a single round by id
    Round { round_id: i64 },
    /// Upsert a debug snapshot without calling the API
    Replay { path: PathBuf },
    /// Print metadata/detail backlog counts as JSON
    DbMissingStats,
}

#[tokio::main]
async fn main() -> Result<()> {
    env::init_env();
    init_tracing(DEFAULT_FILTER)?;

    let cli = Cli::parse();
    env::preflight_check("para-stats", &[], IngestConfig::LOGGED_KEYS)?;

    let mut cfg = IngestConfig::from_env();
    if cli.db_url.is_some() {
        cfg.database_url = cli.db_url.clone();
    }

    match cli.command {
        Commands::Ingest { start, end } => ingest::run_ingest(cfg, start, end).await?,
        Commands::Backfill => ingest::run_backfill(cfg).await?,
        Commands::Metadata { start, end } => ingest::run_metadata(cfg, start, end).await?,
        Commands::Round { round_id } => ingest::run_round(cfg, round_id).await?,
        Commands::Replay { path } => ingest::run_replay(cfg, &path).await?,
        Commands::DbMissingStats => {
            let stats_cfg = db_missing_stats::DbMissingStatsConfig {
                database_url: cli.db_url,
            };
            db_missing_stats::run(stats_cfg).await?;
        }
    }
    Ok(())
}
