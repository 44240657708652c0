// collection-backup/src/restore/logic.rs
use super::verification::{Verification, verify_item_count};
use crate::backup::capture;
use crate::context::Services;
use crate::errors::{AppError, ErrorReport, RestoreError, StoreError};
use crate::store::{BackupLocation, BackupRecord, BackupType};
use serde::Serialize;
use std::collections::HashSet;
use std::fmt;
use std::path::{Path, PathBuf};
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RestoreStep {
    Start,
    SafetyBackup,
    Materialize,
    SchemaReset,
    Restore,
    Verify,
}

impl RestoreStep {
    pub fn as_str(self) -> &'static str {
        match self {
            RestoreStep::Start => "start",
            RestoreStep::SafetyBackup => "safety_backup",
            RestoreStep::Materialize => "materialize",
            RestoreStep::SchemaReset => "schema_reset",
            RestoreStep::Restore => "restore",
            RestoreStep::Verify => "verify",
        }
    }
}

impl fmt::Display for RestoreStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A dump file ready for psql. Remote artifacts live in a scratch directory
/// that is removed when the artifact is dropped.
struct Artifact {
    path: PathBuf,
    _scratch: Option<TempDir>,
}

enum RestoreState {
    Start,
    SafetyBackup {
        target: BackupRecord,
    },
    Materialize {
        target: BackupRecord,
        safety: BackupRecord,
    },
    SchemaReset {
        target: BackupRecord,
        safety: BackupRecord,
        artifact: Artifact,
        snapshot: Vec<BackupRecord>,
    },
    Restore {
        target: BackupRecord,
        safety: BackupRecord,
        artifact: Artifact,
        snapshot: Vec<BackupRecord>,
    },
    Verify {
        target: BackupRecord,
        safety: BackupRecord,
        notices: Vec<String>,
    },
    Done {
        target: BackupRecord,
        safety: BackupRecord,
        verification: Verification,
        notices: Vec<String>,
    },
    Failed {
        step: RestoreStep,
        error: AppError,
        safety: Option<BackupRecord>,
    },
}

impl RestoreState {
    fn is_terminal(&self) -> bool {
        matches!(self, RestoreState::Done { .. } | RestoreState::Failed { .. })
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RestoreResult {
    pub success: bool,
    pub message: String,
    pub backup_id: String,
    /// Filename of the safety dump taken before anything was changed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub safety_backup: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failed_step: Option<RestoreStep>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorReport>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub verification: Option<Verification>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub notices: Vec<String>,
}

impl RestoreResult {
    fn failed(
        backup_id: &str,
        step: RestoreStep,
        err: &AppError,
        safety: Option<&BackupRecord>,
    ) -> Self {
        let safety_backup = safety.map(|s| s.filename.clone());
        let message = match &safety_backup {
            Some(filename) => format!(
                "Restore failed during {step}: {err}. Safety backup: {filename}"
            ),
            None => format!("Restore failed during {step}: {err}"),
        };
        Self {
            success: false,
            message,
            backup_id: backup_id.to_string(),
            safety_backup,
            failed_step: Some(step),
            error: Some(err.report()),
            verification: None,
            notices: Vec::new(),
        }
    }

    fn from_state(backup_id: &str, state: RestoreState) -> Self {
        match state {
            RestoreState::Done {
                target,
                safety,
                verification,
                notices,
            } => {
                let message = match &verification.warning {
                    Some(warning) => {
                        format!("Restored backup {} with a warning: {warning}", target.filename)
                    }
                    None => format!("Restored backup {}", target.filename),
                };
                Self {
                    success: true,
                    message,
                    backup_id: backup_id.to_string(),
                    safety_backup: Some(safety.filename),
                    failed_step: None,
                    error: None,
                    verification: Some(verification),
                    notices,
                }
            }
            RestoreState::Failed {
                step,
                error,
                safety,
            } => Self::failed(backup_id, step, &error, safety.as_ref()),
            // The engine only converts terminal states.
            _ => Self::failed(
                backup_id,
                RestoreStep::Start,
                &AppError::Cancelled("restore stopped before reaching a terminal state".into()),
                None,
            ),
        }
    }
}

/// Replaces the live database with the contents of a recorded backup.
#[derive(Clone)]
pub struct RestoreEngine {
    services: Services,
}

impl RestoreEngine {
    pub fn new(services: Services) -> Self {
        Self { services }
    }

    /// Never returns an error: failures come back as a result naming the
    /// step that failed and, once it exists, the safety backup.
    ///
    /// `cancel` is honoured until the schema reset starts.
    #[instrument(skip_all, fields(backup_id = %backup_id))]
    pub async fn restore(&self, backup_id: &str, cancel: &CancellationToken) -> RestoreResult {
        let Some(_guard) = self.services.lock.try_acquire() else {
            warn!("Restore refused: another operation is in progress");
            return RestoreResult::failed(backup_id, RestoreStep::Start, &AppError::Busy, None);
        };

        let mut state = RestoreState::Start;
        while !state.is_terminal() {
            state = self.advance(backup_id, state, cancel).await;
        }

        match &state {
            RestoreState::Failed { step, error, .. } => {
                error!("❌ Restore failed during {step}: {error}")
            }
            _ => info!("🎉 Restore of {backup_id} completed"),
        }
        RestoreResult::from_state(backup_id, state)
    }

    async fn advance(
        &self,
        backup_id: &str,
        state: RestoreState,
        cancel: &CancellationToken,
    ) -> RestoreState {
        match state {
            RestoreState::Start => {
                match cancellable(cancel, RestoreStep::Start, self.find_target(backup_id)).await {
                    Ok(target) => RestoreState::SafetyBackup { target },
                    Err(error) => RestoreState::Failed {
                        step: RestoreStep::Start,
                        error,
                        safety: None,
                    },
                }
            }

            RestoreState::SafetyBackup { target } => {
                if cancel.is_cancelled() {
                    return RestoreState::Failed {
                        step: RestoreStep::SafetyBackup,
                        error: cancelled(RestoreStep::SafetyBackup),
                        safety: None,
                    };
                }
                // Not raced against `cancel`: a half-taken safety dump would
                // leave a file without a record.
                info!("🛟 Taking safety backup before restoring {}", target.filename);
                match capture(&self.services, BackupType::Safety).await {
                    Ok(safety) if cancel.is_cancelled() => RestoreState::Failed {
                        step: RestoreStep::Materialize,
                        error: cancelled(RestoreStep::Materialize),
                        safety: Some(safety),
                    },
                    Ok(safety) => RestoreState::Materialize { target, safety },
                    Err(error) => RestoreState::Failed {
                        step: RestoreStep::SafetyBackup,
                        error,
                        safety: None,
                    },
                }
            }

            RestoreState::Materialize { target, safety } => {
                let work = self.materialize(&target);
                match cancellable(cancel, RestoreStep::Materialize, work).await {
                    Ok(_) if cancel.is_cancelled() => RestoreState::Failed {
                        step: RestoreStep::SchemaReset,
                        error: cancelled(RestoreStep::SchemaReset),
                        safety: Some(safety),
                    },
                    Ok(artifact) => match self.snapshot_records(&safety).await {
                        Ok(snapshot) => RestoreState::SchemaReset {
                            target,
                            safety,
                            artifact,
                            snapshot,
                        },
                        Err(error) => RestoreState::Failed {
                            step: RestoreStep::Materialize,
                            error,
                            safety: Some(safety),
                        },
                    },
                    Err(error) => RestoreState::Failed {
                        step: RestoreStep::Materialize,
                        error,
                        safety: Some(safety),
                    },
                }
            }

            RestoreState::SchemaReset {
                target,
                safety,
                artifact,
                snapshot,
            } => {
                info!("🧨 Resetting public schema");
                match self.services.admin.reset_schema().await {
                    Ok(()) => RestoreState::Restore {
                        target,
                        safety,
                        artifact,
                        snapshot,
                    },
                    Err(e) => {
                        self.reinsert_records(&snapshot).await;
                        RestoreState::Failed {
                            step: RestoreStep::SchemaReset,
                            error: e.into(),
                            safety: Some(safety),
                        }
                    }
                }
            }

            RestoreState::Restore {
                target,
                safety,
                artifact,
                snapshot,
            } => {
                info!("📥 Replaying {}", artifact.path.display());
                let replayed = self.services.replayer.replay(&artifact.path).await;
                drop(artifact);
                self.reinsert_records(&snapshot).await;
                match replayed {
                    Ok(report) => RestoreState::Verify {
                        target,
                        safety,
                        notices: report.notices,
                    },
                    Err(e) => RestoreState::Failed {
                        step: RestoreStep::Restore,
                        error: e.into(),
                        safety: Some(safety),
                    },
                }
            }

            RestoreState::Verify {
                target,
                safety,
                notices,
            } => {
                let verification =
                    verify_item_count(self.services.admin.as_ref(), target.item_count).await;
                RestoreState::Done {
                    target,
                    safety,
                    verification,
                    notices,
                }
            }

            terminal @ (RestoreState::Done { .. } | RestoreState::Failed { .. }) => terminal,
        }
    }

    async fn find_target(&self, backup_id: &str) -> Result<BackupRecord, AppError> {
        let record = self
            .services
            .store
            .find(backup_id)
            .await?
            .ok_or_else(|| StoreError::NotFound(backup_id.to_string()))?;
        info!("🎯 Restoring {} ({} items)", record.filename, record.item_count);
        Ok(record)
    }

    /// Puts the target's dump on local disk and checks it is usable.
    async fn materialize(&self, target: &BackupRecord) -> Result<Artifact, AppError> {
        let artifact = match target.location() {
            BackupLocation::Local(path) => Artifact {
                path,
                _scratch: None,
            },
            BackupLocation::Remote(url) => {
                // Credentials are needed even if uploads were switched off since.
                let settings = match self.services.settings.load().await {
                    Ok(settings) => Some(settings),
                    Err(e) => {
                        warn!("⚠️ Backup settings unavailable, fetching without credentials: {e}");
                        None
                    }
                };
                let scratch = tempfile::Builder::new()
                    .prefix("collection-restore-")
                    .tempdir()?;
                let dest = scratch.path().join(scratch_name(&target.filename));

                info!("☁️ Fetching {url}");
                let bytes = self
                    .services
                    .cloud
                    .fetch(
                        settings.as_ref().and_then(|s| s.cloud.as_ref()),
                        &url,
                        &dest,
                    )
                    .await?;
                debug!("Fetched {bytes} bytes into {}", dest.display());
                Artifact {
                    path: dest,
                    _scratch: Some(scratch),
                }
            }
        };
        ensure_script(&artifact.path).await?;
        Ok(artifact)
    }

    /// Every record as it stands right before the schema reset, which drops
    /// the records table along with everything else.
    async fn snapshot_records(&self, safety: &BackupRecord) -> Result<Vec<BackupRecord>, AppError> {
        let mut snapshot = self.services.store.all_records().await?;
        if !snapshot.iter().any(|r| r.id == safety.id) {
            snapshot.push(safety.clone());
        }
        debug!("Captured {} backup records before reset", snapshot.len());
        Ok(snapshot)
    }

    /// Puts back every snapshot record the replayed dump does not know about.
    async fn reinsert_records(&self, snapshot: &[BackupRecord]) {
        let store = &self.services.store;
        if let Err(e) = store.prepare().await {
            warn!("⚠️ Backup records table could not be recreated: {e}");
            return;
        }
        let present: HashSet<String> = match store.all_records().await {
            Ok(records) => records.into_iter().map(|r| r.id).collect(),
            Err(e) => {
                warn!("⚠️ Could not read backup records after restore: {e}");
                return;
            }
        };
        for record in snapshot.iter().filter(|r| !present.contains(&r.id)) {
            match store.create(record).await {
                Ok(()) => info!("Re-recorded {} backup {}", record.backup_type, record.filename),
                Err(e) => warn!(
                    "⚠️ Backup {} is on disk but could not be re-recorded: {e}",
                    record.filename
                ),
            }
        }
    }
}

async fn cancellable<T>(
    cancel: &CancellationToken,
    step: RestoreStep,
    work: impl Future<Output = Result<T, AppError>>,
) -> Result<T, AppError> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(cancelled(step)),
        result = work => result,
    }
}

fn cancelled(step: RestoreStep) -> AppError {
    AppError::Cancelled(format!("restore cancelled before {step}"))
}

fn scratch_name(filename: &str) -> String {
    Path::new(filename)
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .filter(|n| !n.is_empty())
        .unwrap_or_else(|| "backup.sql".to_string())
}

async fn ensure_script(path: &Path) -> Result<(), RestoreError> {
    match tokio::fs::metadata(path).await {
        Ok(meta) if !meta.is_file() => Err(RestoreError::MissingScript(path.to_path_buf())),
        Ok(meta) if meta.len() == 0 => Err(RestoreError::EmptyScript(path.to_path_buf())),
        Ok(_) => Ok(()),
        Err(_) => Err(RestoreError::MissingScript(path.to_path_buf())),
    }
}
