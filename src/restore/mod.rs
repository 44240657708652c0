pub mod db_restore;
pub mod logic;
pub mod verification;

pub use db_restore::{PsqlReplayer, ReplayReport, SqlReplayer, classify_stderr};
pub use logic::{RestoreEngine, RestoreResult, RestoreStep};
pub use verification::Verification;
