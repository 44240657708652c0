use serde::Serialize;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Machine-checkable error category carried by every structured result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Configuration,
    Dump,
    Restore,
    Transport,
    Provider,
    NotFound,
    Database,
    Busy,
    Cancelled,
    Io,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Invalid database connection URL: {0}")]
    ConnectionUrl(String),

    #[error("Missing required setting: {0}")]
    Missing(String),

    #[error("Invalid setting: {0}")]
    Invalid(String),
}

/// Failure of an external executable run through `utils::process`.
#[derive(Error, Debug)]
pub enum ProcessError {
    #[error("{program} executable not found: {reason}")]
    NotFound { program: String, reason: String },

    #[error("Failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{program} exited with status {code:?}: {stderr}")]
    NonZeroExit {
        program: String,
        code: Option<i32>,
        stderr: String,
    },

    #[error("{program} timed out after {}s: {stderr}", .after.as_secs())]
    Timeout {
        program: String,
        after: Duration,
        stderr: String,
    },

    #[error("{program} produced more than {limit} bytes of output")]
    OutputLimit { program: String, limit: usize },

    #[error("I/O error while running {program}: {source}")]
    Io {
        program: String,
        #[source]
        source: std::io::Error,
    },
}

impl ProcessError {
    /// Captured diagnostic output, when the process got far enough to produce any.
    pub fn stderr(&self) -> Option<&str> {
        match self {
            ProcessError::NonZeroExit { stderr, .. } | ProcessError::Timeout { stderr, .. } => {
                Some(stderr)
            }
            _ => None,
        }
    }
}

#[derive(Error, Debug)]
pub enum DumpError {
    #[error(transparent)]
    Configuration(#[from] ConfigError),

    #[error("Database dump failed: {0}")]
    Process(#[from] ProcessError),

    #[error("Database dump produced an empty file: {}", .0.display())]
    EmptyOutput(PathBuf),

    #[error("I/O error during dump: {0}")]
    Io(#[from] std::io::Error),
}

impl DumpError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            DumpError::Configuration(_) => ErrorKind::Configuration,
            DumpError::Process(_) | DumpError::EmptyOutput(_) => ErrorKind::Dump,
            DumpError::Io(_) => ErrorKind::Io,
        }
    }
}

#[derive(Error, Debug)]
pub enum RestoreError {
    #[error(transparent)]
    Configuration(#[from] ConfigError),

    #[error("Restore process failed: {0}")]
    Process(#[from] ProcessError),

    #[error("Restore reported errors: {0}")]
    Diagnostics(String),

    #[error("Restore script not found: {}", .0.display())]
    MissingScript(PathBuf),

    #[error("Restore script is empty: {}", .0.display())]
    EmptyScript(PathBuf),

    #[error("Schema reset failed: {0}")]
    SchemaReset(#[source] sqlx::Error),
}

impl RestoreError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            RestoreError::Configuration(_) => ErrorKind::Configuration,
            RestoreError::MissingScript(_) => ErrorKind::NotFound,
            RestoreError::EmptyScript(_) => ErrorKind::Restore,
            RestoreError::SchemaReset(_) => ErrorKind::Database,
            RestoreError::Process(_) | RestoreError::Diagnostics(_) => ErrorKind::Restore,
        }
    }
}

/// Cloud adapter failures. Never escapes `cloud::upload` / `cloud::test_connection`;
/// those fold it into an outcome value.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CloudError {
    #[error("Cloud storage configuration error: {0}")]
    Configuration(String),

    #[error("Cloud storage transport error: {0}")]
    Transport(String),

    #[error("Cloud storage provider error: {0}")]
    Provider(String),

    #[error("Local file error: {0}")]
    LocalFile(String),
}

impl CloudError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            CloudError::Configuration(_) => ErrorKind::Configuration,
            CloudError::Transport(_) => ErrorKind::Transport,
            CloudError::Provider(_) => ErrorKind::Provider,
            CloudError::LocalFile(_) => ErrorKind::Io,
        }
    }
}

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Backup record not found: {0}")]
    NotFound(String),

    #[error("Backup record store error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Corrupt backup record {id}: {reason}")]
    Corrupt { id: String, reason: String },
}

impl StoreError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            StoreError::NotFound(_) => ErrorKind::NotFound,
            StoreError::Database(_) | StoreError::Corrupt { .. } => ErrorKind::Database,
        }
    }
}

#[derive(Error, Debug)]
pub enum AppError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Dump(#[from] DumpError),

    #[error(transparent)]
    Restore(#[from] RestoreError),

    #[error(transparent)]
    Cloud(#[from] CloudError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Another backup or restore operation is already in progress")]
    Busy,

    #[error("Operation cancelled: {0}")]
    Cancelled(String),
}

impl AppError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            AppError::Config(_) => ErrorKind::Configuration,
            AppError::Dump(e) => e.kind(),
            AppError::Restore(e) => e.kind(),
            AppError::Cloud(e) => e.kind(),
            AppError::Store(e) => e.kind(),
            AppError::Database(_) => ErrorKind::Database,
            AppError::Io(_) => ErrorKind::Io,
            AppError::NotFound(_) => ErrorKind::NotFound,
            AppError::Busy => ErrorKind::Busy,
            AppError::Cancelled(_) => ErrorKind::Cancelled,
        }
    }

    pub fn report(&self) -> ErrorReport {
        ErrorReport {
            kind: self.kind(),
            message: self.to_string(),
        }
    }
}

/// Serializable `{kind, message}` pair embedded in operation results.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ErrorReport {
    pub kind: ErrorKind,
    pub message: String,
}

pub type Result<T> = std::result::Result<T, AppError>;
