pub mod backfill;
pub mod db;
pub mod paradise;
pub mod schema;
pub mod upsert;
