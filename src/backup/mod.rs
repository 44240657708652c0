pub mod db_dump;
pub mod logic;
pub mod naming;

pub use db_dump::{DatabaseDumper, DumpOutcome, PgDumpEngine};
pub use logic::{BackupOptions, BackupOrchestrator, CreateBackupResult};
pub(crate) use logic::capture;
