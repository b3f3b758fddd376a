pub mod db_missing_stats;
pub mod ingest;
