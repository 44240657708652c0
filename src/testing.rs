//! In-memory collaborators for unit tests.

use crate::backup::{DatabaseDumper, DumpOutcome};
use crate::cloud::{CloudGateway, ConnectionOutcome, UploadOutcome};
use crate::config::{
    BackupSettings, CloudProvider, CloudProviderConfig, CloudSettings, SettingsProvider,
};
use crate::context::{OperationLock, Services};
use crate::database::DatabaseAdmin;
use crate::errors::{CloudError, ConfigError, DumpError, ProcessError, RestoreError};
use crate::restore::{ReplayReport, SqlReplayer};
use crate::store::{BackupRecordStore, BackupType, InMemoryBackupRecordStore};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use url::Url;

#[derive(Debug, Clone, Default)]
pub struct EventLog(Arc<Mutex<Vec<&'static str>>>);

impl EventLog {
    pub fn push(&self, event: &'static str) {
        self.0.lock().unwrap().push(event);
    }

    pub fn events(&self) -> Vec<&'static str> {
        self.0.lock().unwrap().clone()
    }

    pub fn position(&self, event: &str) -> Option<usize> {
        self.events().iter().position(|e| *e == event)
    }
}

pub struct FakeDumper {
    pub fail: AtomicBool,
    pub calls: AtomicUsize,
    /// Time the dump keeps running after its file is written.
    pub delay_ms: AtomicU64,
    events: EventLog,
}

#[async_trait]
impl DatabaseDumper for FakeDumper {
    async fn dump(&self, destination: &Path) -> Result<DumpOutcome, DumpError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.events.push("dump");
        if self.fail.load(Ordering::SeqCst) {
            return Err(DumpError::Process(ProcessError::NonZeroExit {
                program: "pg_dump".into(),
                code: Some(1),
                stderr: "pg_dump: error: connection refused".into(),
            }));
        }
        let body = b"-- PostgreSQL database dump\nCREATE TABLE items (id int);\n";
        tokio::fs::write(destination, body).await?;
        let delay = self.delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        Ok(DumpOutcome {
            size_bytes: body.len() as u64,
        })
    }
}

pub struct FakeAdmin {
    pub items: Arc<AtomicI64>,
    pub fail_count: AtomicBool,
    pub fail_reset: AtomicBool,
    pub resets: AtomicUsize,
    /// Safety records present in the store when the reset ran.
    pub safety_records_at_reset: Mutex<Option<usize>>,
    store: Arc<InMemoryBackupRecordStore>,
    events: EventLog,
}

#[async_trait]
impl DatabaseAdmin for FakeAdmin {
    async fn count_items(&self) -> Result<i64, sqlx::Error> {
        if self.fail_count.load(Ordering::SeqCst) {
            return Err(sqlx::Error::PoolTimedOut);
        }
        Ok(self.items.load(Ordering::SeqCst))
    }

    async fn reset_schema(&self) -> Result<(), RestoreError> {
        self.events.push("reset");
        self.resets.fetch_add(1, Ordering::SeqCst);
        let safety = self
            .store
            .records_of_types(&[BackupType::Safety])
            .await
            .map(|r| r.len())
            .unwrap_or_default();
        *self.safety_records_at_reset.lock().unwrap() = Some(safety);
        if self.fail_reset.load(Ordering::SeqCst) {
            return Err(RestoreError::SchemaReset(sqlx::Error::PoolTimedOut));
        }
        // Dropping the schema drops the records table with it.
        self.store.clear().await;
        Ok(())
    }
}

pub struct FakeReplayer {
    pub fail: AtomicBool,
    pub items_after_replay: AtomicI64,
    pub replayed: Mutex<Vec<PathBuf>>,
    items: Arc<AtomicI64>,
    events: EventLog,
}

#[async_trait]
impl SqlReplayer for FakeReplayer {
    async fn replay(&self, script: &Path) -> Result<ReplayReport, RestoreError> {
        self.events.push("replay");
        self.replayed.lock().unwrap().push(script.to_path_buf());
        if !script.exists() {
            return Err(RestoreError::MissingScript(script.to_path_buf()));
        }
        if self.fail.load(Ordering::SeqCst) {
            return Err(RestoreError::Diagnostics(
                "psql:backup.sql:12: ERROR:  syntax error at or near \"CREAT\"".into(),
            ));
        }
        self.items
            .store(self.items_after_replay.load(Ordering::SeqCst), Ordering::SeqCst);
        Ok(ReplayReport {
            notices: vec!["NOTICE:  table \"items\" does not exist, skipping".into()],
        })
    }
}

pub struct FakeCloud {
    pub upload_ok: AtomicBool,
    pub uploads: Mutex<Vec<String>>,
    pub fetches: Mutex<Vec<Url>>,
    pub fetch_body: Mutex<Vec<u8>>,
    pub deleted: Mutex<Vec<Url>>,
    pub delete_ok: AtomicBool,
    events: EventLog,
}

#[async_trait]
impl CloudGateway for FakeCloud {
    async fn upload(&self, _settings: &CloudSettings, local: &Path, filename: &str) -> UploadOutcome {
        self.events.push("upload");
        self.uploads.lock().unwrap().push(filename.to_string());
        if !local.exists() {
            return UploadOutcome::failed(CloudError::LocalFile(local.display().to_string()));
        }
        if self.upload_ok.load(Ordering::SeqCst) {
            let url = Url::parse(&format!("s3://media/backups/{filename}")).unwrap();
            UploadOutcome::uploaded(&url)
        } else {
            UploadOutcome::failed(CloudError::Transport("connection reset by peer".into()))
        }
    }

    async fn test_connection(&self, settings: &CloudSettings) -> ConnectionOutcome {
        ConnectionOutcome {
            success: true,
            message: Some(format!("Connected to {}", settings.provider)),
            error: None,
        }
    }

    async fn fetch(
        &self,
        _credentials: Option<&CloudProviderConfig>,
        remote: &Url,
        dest: &Path,
    ) -> Result<u64, CloudError> {
        self.events.push("fetch");
        self.fetches.lock().unwrap().push(remote.clone());
        let body = self.fetch_body.lock().unwrap().clone();
        tokio::fs::write(dest, &body)
            .await
            .map_err(|e| CloudError::LocalFile(e.to_string()))?;
        Ok(body.len() as u64)
    }

    async fn delete(
        &self,
        _credentials: Option<&CloudProviderConfig>,
        remote: &Url,
    ) -> Result<(), CloudError> {
        self.events.push("delete");
        if !self.delete_ok.load(Ordering::SeqCst) {
            return Err(CloudError::Provider("delete object returned 500".into()));
        }
        self.deleted.lock().unwrap().push(remote.clone());
        Ok(())
    }
}

/// Settings that tests can swap at runtime; counts loads.
pub struct MutableSettings {
    current: Mutex<Result<BackupSettings, ConfigError>>,
    pub loads: AtomicUsize,
}

impl MutableSettings {
    pub fn set(&self, settings: BackupSettings) {
        *self.current.lock().unwrap() = Ok(settings);
    }

    pub fn fail(&self, reason: &str) {
        *self.current.lock().unwrap() = Err(ConfigError::Invalid(reason.into()));
    }
}

#[async_trait]
impl SettingsProvider for MutableSettings {
    async fn load(&self) -> Result<BackupSettings, ConfigError> {
        self.loads.fetch_add(1, Ordering::SeqCst);
        self.current.lock().unwrap().clone()
    }
}

pub fn s3_cloud_settings(automatic: bool) -> BackupSettings {
    BackupSettings {
        automatic_backups: automatic,
        cloud_storage_enabled: true,
        cloud_provider: CloudProvider::S3,
        cloud: Some(CloudProviderConfig::S3 {
            bucket: "media".into(),
            region: "eu-west-1".into(),
            access_key_id: "AKIA".into(),
            secret_access_key: "secret".into(),
        }),
        ..BackupSettings::default()
    }
}

pub struct Harness {
    pub services: Services,
    pub store: Arc<InMemoryBackupRecordStore>,
    pub dumper: Arc<FakeDumper>,
    pub admin: Arc<FakeAdmin>,
    pub replayer: Arc<FakeReplayer>,
    pub cloud: Arc<FakeCloud>,
    pub settings: Arc<MutableSettings>,
    pub events: EventLog,
    pub dir: TempDir,
}

impl Harness {
    pub fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let events = EventLog::default();
        let items = Arc::new(AtomicI64::new(42));
        let store = Arc::new(InMemoryBackupRecordStore::new());
        let dumper = Arc::new(FakeDumper {
            fail: AtomicBool::new(false),
            calls: AtomicUsize::new(0),
            delay_ms: AtomicU64::new(0),
            events: events.clone(),
        });
        let admin = Arc::new(FakeAdmin {
            items: Arc::clone(&items),
            fail_count: AtomicBool::new(false),
            fail_reset: AtomicBool::new(false),
            resets: AtomicUsize::new(0),
            safety_records_at_reset: Mutex::new(None),
            store: Arc::clone(&store),
            events: events.clone(),
        });
        let replayer = Arc::new(FakeReplayer {
            fail: AtomicBool::new(false),
            items_after_replay: AtomicI64::new(42),
            replayed: Mutex::new(Vec::new()),
            items,
            events: events.clone(),
        });
        let cloud = Arc::new(FakeCloud {
            upload_ok: AtomicBool::new(true),
            uploads: Mutex::new(Vec::new()),
            fetches: Mutex::new(Vec::new()),
            fetch_body: Mutex::new(b"-- remote dump\n".to_vec()),
            deleted: Mutex::new(Vec::new()),
            delete_ok: AtomicBool::new(true),
            events: events.clone(),
        });
        let settings = Arc::new(MutableSettings {
            current: Mutex::new(Ok(BackupSettings::default())),
            loads: AtomicUsize::new(0),
        });

        let services = Services {
            dumper: dumper.clone(),
            replayer: replayer.clone(),
            admin: admin.clone(),
            store: store.clone(),
            cloud: cloud.clone(),
            settings: settings.clone(),
            lock: OperationLock::default(),
            backup_dir: dir.path().join("backups"),
        };

        Self {
            services,
            store,
            dumper,
            admin,
            replayer,
            cloud,
            settings,
            events,
            dir,
        }
    }
}
