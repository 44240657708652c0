// collection-backup/src/backup/db_dump.rs
use crate::errors::DumpError;
use crate::utils::connection::ConnectionParams;
use crate::utils::find_executable;
use crate::utils::process::{CommandSpec, ProcessLimits, run_bounded};
use async_trait::async_trait;
use serde::Serialize;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DumpOutcome {
    pub size_bytes: u64,
}

/// Writes a plain-SQL dump of the live database to a file.
#[async_trait]
pub trait DatabaseDumper: Send + Sync {
    async fn dump(&self, destination: &Path) -> Result<DumpOutcome, DumpError>;
}

/// `pg_dump` driven through an argument list and `PGPASSWORD`.
#[derive(Clone)]
pub struct PgDumpEngine {
    connection_url: String,
    pg_dump_path: Option<PathBuf>,
    limits: ProcessLimits,
}

impl std::fmt::Debug for PgDumpEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PgDumpEngine")
            .field("pg_dump_path", &self.pg_dump_path)
            .field("limits", &self.limits)
            .finish_non_exhaustive()
    }
}

impl PgDumpEngine {
    pub fn new(
        connection_url: impl Into<String>,
        pg_dump_path: Option<PathBuf>,
        limits: ProcessLimits,
    ) -> Self {
        Self {
            connection_url: connection_url.into(),
            pg_dump_path,
            limits,
        }
    }

    pub fn command(params: &ConnectionParams, program: &Path, destination: &Path) -> CommandSpec {
        CommandSpec::new("pg_dump", program)
            .args(params.client_args())
            .arg("-f")
            .arg(destination.as_os_str())
            .args(["--no-owner", "--no-acl"])
            .envs(params.client_env())
    }

    /// Dumps the database at `connection_url` into `destination`.
    ///
    /// The URL is validated before anything is spawned. A failed or empty
    /// dump leaves no file behind.
    pub async fn dump_url(
        &self,
        connection_url: &str,
        destination: &Path,
    ) -> Result<DumpOutcome, DumpError> {
        let params = ConnectionParams::parse(connection_url)?;
        let pg_dump = find_executable("pg_dump", self.pg_dump_path.as_deref())?;
        debug!("Found pg_dump executable at: {}", pg_dump.display());

        if let Some(parent) = destination.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        info!(
            database = %params.redacted(),
            "Dumping database to {}",
            destination.display()
        );
        let spec = Self::command(&params, &pg_dump, destination);
        if let Err(e) = run_bounded(&spec, self.limits).await {
            discard(destination).await;
            return Err(e.into());
        }

        let size_bytes = match tokio::fs::metadata(destination).await {
            Ok(meta) => meta.len(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => 0,
            Err(e) => return Err(e.into()),
        };
        if size_bytes == 0 {
            discard(destination).await;
            return Err(DumpError::EmptyOutput(destination.to_path_buf()));
        }

        info!("✓ Database dumped ({size_bytes} bytes)");
        Ok(DumpOutcome { size_bytes })
    }
}

async fn discard(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => debug!("Removed partial dump {}", path.display()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!("⚠️ Could not remove partial dump {}: {e}", path.display()),
    }
}

#[async_trait]
impl DatabaseDumper for PgDumpEngine {
    async fn dump(&self, destination: &Path) -> Result<DumpOutcome, DumpError> {
        self.dump_url(&self.connection_url, destination).await
    }
}
