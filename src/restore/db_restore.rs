// collection-backup/src/restore/db_restore.rs
use crate::errors::RestoreError;
use crate::utils::connection::ConnectionParams;
use crate::utils::find_executable;
use crate::utils::process::{CommandSpec, ProcessLimits, run_bounded};
use async_trait::async_trait;
use regex::Regex;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use tracing::{debug, info, warn};

/// `NOTICE:` / `WARNING:`, optionally behind psql's `psql:file:line:` prefix.
static BENIGN_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^(psql:\S*:\d+:\s*)?(notice|warning):").expect("notice pattern compiles")
});

/// Detail lines psql prints under the message they belong to.
static CONTINUATION_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^(psql:\S*:\d+:\s*)?(detail|hint|context):").expect("detail pattern compiles")
});

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReplayReport {
    /// Notices and warnings psql printed while replaying.
    pub notices: Vec<String>,
}

/// Replays a plain-SQL dump into the live database.
#[async_trait]
pub trait SqlReplayer: Send + Sync {
    async fn replay(&self, script: &Path) -> Result<ReplayReport, RestoreError>;
}

/// Any `LEVEL:` line psql prints.
static MESSAGE_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(psql:\S*:\d+:\s*)?[A-Za-z]+:\s").expect("message pattern compiles")
});

#[derive(Clone, Copy, PartialEq, Eq)]
enum Attach {
    Nothing,
    Notice,
    Detail,
}

/// Splits psql stderr into benign notices and errors.
///
/// Any non-empty line that is not a notice, a warning, or detail text
/// belonging to one of those fails the restore.
pub fn classify_stderr(stderr: &str) -> Result<Vec<String>, RestoreError> {
    let mut notices: Vec<String> = Vec::new();
    let mut errors = Vec::new();
    let mut attach = Attach::Nothing;

    for line in stderr.lines() {
        let trimmed = line.trim_end();
        if trimmed.trim().is_empty() {
            continue;
        }
        let continues = match attach {
            Attach::Nothing => false,
            Attach::Notice => {
                CONTINUATION_LINE.is_match(trimmed) || trimmed.starts_with(char::is_whitespace)
            }
            Attach::Detail => {
                CONTINUATION_LINE.is_match(trimmed) || !MESSAGE_LINE.is_match(trimmed)
            }
        };

        if BENIGN_LINE.is_match(trimmed) {
            notices.push(trimmed.to_string());
            attach = Attach::Notice;
        } else if continues {
            if let Some(last) = notices.last_mut() {
                last.push('\n');
                last.push_str(trimmed);
            }
            if CONTINUATION_LINE.is_match(trimmed) {
                attach = Attach::Detail;
            }
        } else {
            errors.push(trimmed.to_string());
            attach = Attach::Nothing;
        }
    }

    if errors.is_empty() {
        Ok(notices)
    } else {
        Err(RestoreError::Diagnostics(errors.join("\n")))
    }
}

/// `psql` with `ON_ERROR_STOP`, discrete connection arguments and `PGPASSWORD`.
#[derive(Clone)]
pub struct PsqlReplayer {
    connection_url: String,
    psql_path: Option<PathBuf>,
    limits: ProcessLimits,
}

impl std::fmt::Debug for PsqlReplayer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PsqlReplayer")
            .field("psql_path", &self.psql_path)
            .field("limits", &self.limits)
            .finish_non_exhaustive()
    }
}

impl PsqlReplayer {
    pub fn new(
        connection_url: impl Into<String>,
        psql_path: Option<PathBuf>,
        limits: ProcessLimits,
    ) -> Self {
        Self {
            connection_url: connection_url.into(),
            psql_path,
            limits,
        }
    }

    pub fn command(params: &ConnectionParams, program: &Path, script: &Path) -> CommandSpec {
        CommandSpec::new("psql", program)
            .args(["-X", "-q", "-v", "ON_ERROR_STOP=1"])
            .args(params.client_args())
            .arg("-f")
            .arg(script.as_os_str())
            .envs(params.client_env())
    }
}

#[async_trait]
impl SqlReplayer for PsqlReplayer {
    async fn replay(&self, script: &Path) -> Result<ReplayReport, RestoreError> {
        let params = ConnectionParams::parse(&self.connection_url)?;
        if !script.exists() {
            return Err(RestoreError::MissingScript(script.to_path_buf()));
        }
        let psql = find_executable("psql", self.psql_path.as_deref())?;
        debug!("Found psql executable at: {}", psql.display());

        info!(
            database = %params.redacted(),
            "Executing SQL file with psql: {}",
            script.display()
        );
        let output = run_bounded(&Self::command(&params, &psql, script), self.limits).await?;

        let notices = classify_stderr(&output.stderr)?;
        for notice in &notices {
            warn!("psql: {notice}");
        }
        info!("✓ Successfully executed SQL file: {}", script.display());
        Ok(ReplayReport { notices })
    }
}
