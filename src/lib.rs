//! Backup and restore for the media collection database.
//!
//! Dumps are taken with `pg_dump`, recorded in `backup_records`, optionally
//! shipped to S3, R2 or Dropbox, and replayed with `psql`.

pub mod backup;
pub mod cloud;
pub mod config;
pub mod context;
pub mod database;
pub mod errors;
pub mod restore;
pub mod scheduler;
pub mod store;
pub mod utils;

#[cfg(test)]
mod testing;
