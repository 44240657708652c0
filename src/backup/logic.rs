use super::naming;
use crate::cloud::UploadOutcome;
use crate::config::{BackupSettings, CloudSettings};
use crate::context::Services;
use crate::errors::{AppError, ErrorReport, StoreError};
use crate::store::{BackupLocation, BackupRecord, BackupType};
use chrono::Utc;
use serde::Serialize;
use std::path::{Path, PathBuf};
use tracing::{error, info, instrument, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackupOptions {
    /// Keep the local dump once the record points at the uploaded copy.
    pub keep_local_after_upload: bool,
    /// Prune manual and scheduled backups beyond `backup_retention`.
    pub enforce_retention: bool,
}

impl Default for BackupOptions {
    fn default() -> Self {
        Self {
            keep_local_after_upload: true,
            enforce_retention: false,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateBackupResult {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub backup: Option<BackupRecord>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cloud_upload: Option<UploadOutcome>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub pruned: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorReport>,
}

impl CreateBackupResult {
    fn failed(err: &AppError) -> Self {
        Self {
            success: false,
            backup: None,
            cloud_upload: None,
            pruned: Vec::new(),
            error: Some(err.report()),
        }
    }
}

/// Counts items, dumps into `backup_dir` and records the artifact.
///
/// Shared by backup creation and the restore safety step; takes no lock.
pub(crate) async fn capture(
    services: &Services,
    backup_type: BackupType,
) -> Result<BackupRecord, AppError> {
    tokio::fs::create_dir_all(&services.backup_dir).await?;
    let created_at = Utc::now();
    let filename = match backup_type {
        BackupType::Safety => naming::safety_filename(created_at),
        BackupType::Manual | BackupType::Scheduled => naming::backup_filename(created_at),
    };
    let destination = std::path::absolute(services.backup_dir.join(&filename))?;

    // Counted before the dump so the number describes what the dump holds at most.
    let item_count = services.admin.count_items().await?;
    let outcome = services.dumper.dump(&destination).await?;

    let record = BackupRecord::new(
        filename,
        outcome.size_bytes,
        item_count,
        destination.to_string_lossy(),
        backup_type,
        created_at,
    );
    if let Err(e) = services.store.create(&record).await {
        warn!(
            "⚠️ Dump written to {} but its record could not be saved",
            destination.display()
        );
        return Err(e.into());
    }
    info!(id = %record.id, "📦 Recorded {backup_type} backup {}", record.filename);
    Ok(record)
}

/// The "create backup" use case: dump, record, then optionally ship to the cloud.
#[derive(Clone)]
pub struct BackupOrchestrator {
    services: Services,
    options: BackupOptions,
}

impl BackupOrchestrator {
    pub fn new(services: Services, options: BackupOptions) -> Self {
        Self { services, options }
    }

    pub fn services(&self) -> &Services {
        &self.services
    }

    /// Never returns an error: failures are folded into the result. Cloud
    /// problems leave `success` true and are reported under `cloud_upload`.
    #[instrument(skip_all, fields(backup_type = %backup_type))]
    pub async fn create_backup(&self, backup_type: BackupType) -> CreateBackupResult {
        let Some(_guard) = self.services.lock.try_acquire() else {
            warn!("Backup refused: another operation is in progress");
            return CreateBackupResult::failed(&AppError::Busy);
        };
        match self.run(backup_type).await {
            Ok(result) => result,
            Err(e) => {
                error!("❌ Backup failed: {e}");
                CreateBackupResult::failed(&e)
            }
        }
    }

    async fn run(&self, backup_type: BackupType) -> Result<CreateBackupResult, AppError> {
        info!("🚀 Starting {backup_type} backup");
        let mut record = capture(&self.services, backup_type).await?;

        let settings = match self.services.settings.load().await {
            Ok(settings) => Some(settings),
            Err(e) => {
                warn!("⚠️ Backup settings unavailable, treating cloud storage as disabled: {e}");
                None
            }
        };

        let cloud_upload = match settings.as_ref().and_then(|s| s.cloud_settings()) {
            Some(cloud) => Some(self.ship(&mut record, &cloud).await),
            None => None,
        };

        let mut pruned = Vec::new();
        if self.options.enforce_retention {
            if let Some(settings) = &settings {
                match self.prune(settings).await {
                    Ok(names) => pruned = names,
                    Err(e) => warn!("⚠️ Retention pass failed: {e}"),
                }
            }
        }

        info!("🎉 Backup {} completed", record.filename);
        Ok(CreateBackupResult {
            success: true,
            backup: Some(record),
            cloud_upload,
            pruned,
            error: None,
        })
    }

    /// Uploads and, on success, points the record at the remote copy.
    async fn ship(&self, record: &mut BackupRecord, cloud: &CloudSettings) -> UploadOutcome {
        let local = PathBuf::from(&record.location);
        let outcome = self
            .services
            .cloud
            .upload(cloud, &local, &record.filename)
            .await;
        let Some(url) = outcome.url.clone().filter(|_| outcome.success) else {
            return outcome;
        };

        let mut updated = record.clone();
        updated.location = url;
        if let Err(e) = self.services.store.update(&updated).await {
            warn!("⚠️ Uploaded, but the record still points at the local file: {e}");
            return UploadOutcome {
                success: false,
                url: outcome.url,
                error: Some(AppError::from(e).report()),
            };
        }
        *record = updated;

        if !self.options.keep_local_after_upload {
            remove_local(&local).await;
        }
        outcome
    }

    /// Deletes the oldest manual and scheduled backups beyond
    /// `backup_retention`. Safety backups are never touched. A backup whose
    /// remote copy cannot be deleted keeps its record for the next pass.
    async fn prune(&self, settings: &BackupSettings) -> Result<Vec<String>, StoreError> {
        let keep = settings.backup_retention.max(1) as usize;
        let records = self
            .services
            .store
            .records_of_types(&[BackupType::Manual, BackupType::Scheduled])
            .await?;

        let mut pruned = Vec::new();
        for stale in records.into_iter().skip(keep) {
            match stale.location() {
                BackupLocation::Local(path) => remove_local(&path).await,
                BackupLocation::Remote(url) => {
                    let credentials = settings.cloud.as_ref();
                    if let Err(e) = self.services.cloud.delete(credentials, &url).await {
                        warn!("⚠️ Kept {}: remote copy could not be deleted: {e}", stale.filename);
                        continue;
                    }
                    remove_local(&self.services.backup_dir.join(&stale.filename)).await;
                }
            }
            self.services.store.delete(&stale.id).await?;
            info!("🧹 Pruned backup {}", stale.filename);
            pruned.push(stale.filename);
        }
        Ok(pruned)
    }
}

async fn remove_local(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => info!("Removed local copy {}", path.display()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!("⚠️ Could not remove {}: {e}", path.display()),
    }
}
