use crate::backup::{BackupOptions, DatabaseDumper, PgDumpEngine};
use crate::cloud::{CloudGateway, ProviderGateway};
use crate::config::{AppConfig, JsonSettingsProvider, SettingsProvider};
use crate::database::{DatabaseAdmin, PgDatabaseAdmin, lazy_pool};
use crate::errors::ConfigError;
use crate::restore::{PsqlReplayer, SqlReplayer};
use crate::store::{BackupRecordStore, PgBackupRecordStore};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

/// Serializes backup creation and restore inside one process.
#[derive(Debug, Clone, Default)]
pub struct OperationLock(Arc<Mutex<()>>);

impl OperationLock {
    /// `None` while another operation holds the lock. Never waits.
    pub fn try_acquire(&self) -> Option<OwnedMutexGuard<()>> {
        Arc::clone(&self.0).try_lock_owned().ok()
    }

    pub fn is_held(&self) -> bool {
        self.0.try_lock().is_err()
    }
}

/// Collaborators shared by the orchestrator, restore engine and scheduler.
#[derive(Clone)]
pub struct Services {
    pub dumper: Arc<dyn DatabaseDumper>,
    pub replayer: Arc<dyn SqlReplayer>,
    pub admin: Arc<dyn DatabaseAdmin>,
    pub store: Arc<dyn BackupRecordStore>,
    pub cloud: Arc<dyn CloudGateway>,
    pub settings: Arc<dyn SettingsProvider>,
    pub lock: OperationLock,
    pub backup_dir: PathBuf,
}

impl Services {
    /// Wires the PostgreSQL-backed implementations. Nothing connects yet.
    pub fn from_config(config: &AppConfig) -> Result<Self, ConfigError> {
        let pool = lazy_pool(&config.database_url)?;
        Ok(Self {
            dumper: Arc::new(PgDumpEngine::new(
                config.database_url.clone(),
                config.tools.pg_dump_path.clone(),
                config.tools.dump_limits,
            )),
            replayer: Arc::new(PsqlReplayer::new(
                config.database_url.clone(),
                config.tools.psql_path.clone(),
                config.tools.restore_limits,
            )),
            admin: Arc::new(PgDatabaseAdmin::new(pool.clone(), config.item_table.clone())),
            store: Arc::new(PgBackupRecordStore::new(pool)),
            cloud: Arc::new(ProviderGateway),
            settings: Arc::new(JsonSettingsProvider::new(&config.settings_path)),
            lock: OperationLock::default(),
            backup_dir: config.backup_dir.clone(),
        })
    }
}

impl From<&AppConfig> for BackupOptions {
    fn from(config: &AppConfig) -> Self {
        Self {
            keep_local_after_upload: config.keep_local_after_upload,
            enforce_retention: config.enforce_retention,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_lock_is_exclusive_until_released() {
        let lock = OperationLock::default();
        let guard = lock.try_acquire().expect("first acquire succeeds");
        assert!(lock.is_held());
        assert!(lock.clone().try_acquire().is_none());
        drop(guard);
        assert!(!lock.is_held());
        assert!(lock.try_acquire().is_some());
    }

    #[tokio::test]
    async fn test_services_build_without_connecting() -> anyhow::Result<()> {
        let raw = serde_json::from_value(serde_json::json!({
            "database_url": "postgres://u:p@127.0.0.1:1/collection"
        }))?;
        let config = AppConfig::from_raw(raw, None, PathBuf::from("config.json"))?;
        let services = Services::from_config(&config)?;
        assert_eq!(services.backup_dir, PathBuf::from("./backups"));
        assert!(!services.lock.is_held());
        Ok(())
    }
}
