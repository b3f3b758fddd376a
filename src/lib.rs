//! Round ingestion for the Paradise Station stats API: cursor pagination, concurrent
//! detail fetch, positional merge and chunked upsert into Postgres.

pub mod cli;
pub mod config;
pub mod database_ops;
pub mod error;
pub mod tracing;

pub mod util {
    pub mod env;
    pub mod snapshot;
}

pub use config::IngestConfig;
pub use database_ops::paradise::pipeline::{IngestPipeline, RunSummary};
pub use error::{FetchError, IngestError};
