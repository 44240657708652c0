// collection-backup/src/scheduler/mod.rs
pub mod log_ring;
pub mod policy;

pub use log_ring::{DEFAULT_LOG_CAPACITY, LogRing, ScheduleLogEntry, ScheduleOutcome};
pub use policy::{next_due, should_run};

use crate::backup::{BackupOrchestrator, CreateBackupResult};
use crate::errors::ErrorKind;
use crate::store::BackupType;
use chrono::Utc;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchedulerOptions {
    /// How often the policy is evaluated.
    pub check_interval: Duration,
    /// Minimum gap between two `skipped` log entries.
    pub skip_log_interval: Duration,
    pub log_capacity: usize,
}

impl Default for SchedulerOptions {
    fn default() -> Self {
        Self {
            check_interval: Duration::from_secs(60 * 60),
            skip_log_interval: Duration::from_secs(6 * 60 * 60),
            log_capacity: DEFAULT_LOG_CAPACITY,
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

struct Inner {
    orchestrator: BackupOrchestrator,
    options: SchedulerOptions,
    logs: Mutex<LogRing>,
    last_skip_logged: Mutex<Option<Instant>>,
}

impl Inner {
    /// A check that is already running finishes before `stop` takes effect.
    async fn run(self: Arc<Self>, stop: CancellationToken) {
        let mut interval = tokio::time::interval(self.options.check_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                biased;
                _ = stop.cancelled() => break,
                _ = interval.tick() => {}
            }
            self.tick().await;
        }
        debug!("Backup scheduler task exited");
    }

    async fn tick(&self) {
        let services = self.orchestrator.services();
        // A restore may have dropped the records table; leave the store alone.
        if services.lock.is_held() {
            self.skip("Another backup or restore is in progress".to_string());
            return;
        }
        let settings = match services.settings.load().await {
            Ok(settings) => settings,
            Err(e) => {
                warn!("⚠️ Backup settings unavailable, skipping scheduled check: {e}");
                self.skip(format!("Backup settings unavailable: {e}"));
                return;
            }
        };

        let last_backup = match services
            .store
            .latest_of_types(&[BackupType::Scheduled, BackupType::Manual])
            .await
        {
            Ok(record) => record.map(|r| r.created_at),
            Err(e) => {
                error!("❌ Could not look up the last backup: {e}");
                self.record(
                    ScheduleOutcome::Failed,
                    format!("Could not look up the last backup: {e}"),
                );
                return;
            }
        };

        if !should_run(&settings, last_backup, Utc::now()) {
            let reason = if !settings.automatic_backups {
                "Automatic backups are disabled".to_string()
            } else {
                match last_backup.and_then(|last| next_due(settings.backup_frequency, last)) {
                    Some(due) => format!("Next backup due at {}", due.to_rfc3339()),
                    None => "No backup due".to_string(),
                }
            };
            self.skip(reason);
            return;
        }

        info!("⏰ Scheduled backup is due");
        let result = self.orchestrator.create_backup(BackupType::Scheduled).await;
        let (outcome, message) = summarize(&result);
        self.record(outcome, message);
    }

    fn skip(&self, message: String) {
        let now = Instant::now();
        {
            let mut last = lock(&self.last_skip_logged);
            if last.is_some_and(|at| now.duration_since(at) < self.options.skip_log_interval) {
                debug!("Scheduled check skipped: {message}");
                return;
            }
            *last = Some(now);
        }
        info!("Scheduled check skipped: {message}");
        self.record(ScheduleOutcome::Skipped, message);
    }

    fn record(&self, outcome: ScheduleOutcome, message: String) {
        lock(&self.logs).push(ScheduleLogEntry::new(outcome, message));
    }
}

fn summarize(result: &CreateBackupResult) -> (ScheduleOutcome, String) {
    if result.success {
        let filename = result
            .backup
            .as_ref()
            .map(|b| b.filename.as_str())
            .unwrap_or("backup");
        let message = match result.cloud_upload.as_ref().filter(|u| !u.success) {
            Some(upload) => format!(
                "Created {filename}; cloud upload failed: {}",
                upload
                    .error
                    .as_ref()
                    .map(|e| e.message.as_str())
                    .unwrap_or("unknown error")
            ),
            None => format!("Created {filename}"),
        };
        return (ScheduleOutcome::Ran, message);
    }
    match &result.error {
        Some(report) if report.kind == ErrorKind::Busy => {
            (ScheduleOutcome::Skipped, report.message.clone())
        }
        Some(report) => (ScheduleOutcome::Failed, report.message.clone()),
        None => (ScheduleOutcome::Failed, "Backup failed".to_string()),
    }
}

/// Periodically checks whether an automatic backup is due and runs it.
///
struct Task {
    handle: JoinHandle<()>,
    stop: CancellationToken,
}

/// Owns at most one background task. The log survives `stop`/`start`.
pub struct Scheduler {
    inner: Arc<Inner>,
    task: Mutex<Option<Task>>,
}

impl Scheduler {
    pub fn new(orchestrator: BackupOrchestrator, options: SchedulerOptions) -> Self {
        Self {
            inner: Arc::new(Inner {
                orchestrator,
                options,
                logs: Mutex::new(LogRing::new(options.log_capacity)),
                last_skip_logged: Mutex::new(None),
            }),
            task: Mutex::new(None),
        }
    }

    /// Spawns the periodic task; the first check runs immediately.
    /// Returns `false` if it was already running.
    pub fn start(&self) -> bool {
        let mut task = lock(&self.task);
        if task.as_ref().is_some_and(|t| !t.handle.is_finished()) {
            debug!("Backup scheduler already running");
            return false;
        }
        let inner = Arc::clone(&self.inner);
        let stop = CancellationToken::new();
        *task = Some(Task {
            handle: tokio::spawn(inner.run(stop.clone())),
            stop,
        });
        info!(
            "⏰ Backup scheduler started, checking every {}s",
            self.inner.options.check_interval.as_secs()
        );
        true
    }

    /// No further checks are started. A backup already in flight runs to
    /// completion in the background. Returns `false` if it was not running.
    pub fn stop(&self) -> bool {
        match lock(&self.task).take() {
            Some(task) => {
                task.stop.cancel();
                info!("🛑 Backup scheduler stopped");
                true
            }
            None => false,
        }
    }

    /// Like `stop`, but waits for an in-flight backup to finish.
    pub async fn shutdown(&self) -> bool {
        let Some(task) = lock(&self.task).take() else {
            return false;
        };
        task.stop.cancel();
        if let Err(e) = task.handle.await {
            warn!("⚠️ Backup scheduler task ended abnormally: {e}");
        }
        info!("🛑 Backup scheduler stopped");
        true
    }

    pub fn is_running(&self) -> bool {
        lock(&self.task)
            .as_ref()
            .is_some_and(|t| !t.handle.is_finished())
    }

    /// Newest first.
    pub fn get_logs(&self) -> Vec<ScheduleLogEntry> {
        lock(&self.inner.logs).entries()
    }

    /// Runs one check now, outside the periodic task.
    pub async fn tick(&self) {
        self.inner.tick().await;
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        let task = self.task.get_mut().unwrap_or_else(PoisonError::into_inner);
        if let Some(task) = task.take() {
            task.stop.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backup::BackupOptions;
    use crate::config::BackupSettings;
    use crate::errors::StoreError;
    use crate::store::{BackupPage, BackupRecord, BackupRecordStore, ListQuery};
    use crate::testing::Harness;
    use async_trait::async_trait;
    use std::sync::atomic::Ordering;

    fn scheduler(h: &Harness, check_interval: Duration) -> Scheduler {
        let orchestrator = BackupOrchestrator::new(h.services.clone(), BackupOptions::default());
        Scheduler::new(
            orchestrator,
            SchedulerOptions {
                check_interval,
                ..SchedulerOptions::default()
            },
        )
    }

    fn automatic() -> BackupSettings {
        BackupSettings {
            automatic_backups: true,
            ..BackupSettings::default()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_is_idempotent() {
        let h = Harness::new();
        let scheduler = scheduler(&h, Duration::from_secs(60));
        assert!(scheduler.start());
        assert!(!scheduler.start());

        tokio::time::sleep(Duration::from_secs(210)).await;

        // Ticks at 0s, 60s, 120s and 180s from a single task.
        assert_eq!(h.settings.loads.load(Ordering::SeqCst), 4);
        // Automatic backups are off; the skip is logged once.
        let logs = scheduler.get_logs();
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].outcome, ScheduleOutcome::Skipped);
        scheduler.stop();
    }

    #[tokio::test]
    async fn test_stop_and_restart() {
        let h = Harness::new();
        let scheduler = scheduler(&h, Duration::from_secs(3600));
        assert!(!scheduler.is_running());
        assert!(scheduler.start());
        assert!(scheduler.is_running());
        assert!(scheduler.stop());
        assert!(!scheduler.is_running());
        assert!(!scheduler.stop());
        assert!(scheduler.start());
        assert!(scheduler.is_running());
    }

    #[tokio::test]
    async fn test_due_tick_runs_scheduled_backup() -> anyhow::Result<()> {
        let h = Harness::new();
        h.settings.set(automatic());
        let scheduler = scheduler(&h, Duration::from_secs(3600));
        scheduler.tick().await;

        let logs = scheduler.get_logs();
        assert_eq!(logs[0].outcome, ScheduleOutcome::Ran);
        let records = h.store.records_of_types(&[BackupType::Scheduled]).await?;
        assert_eq!(records.len(), 1);
        assert!(logs[0].message.as_deref().unwrap_or_default().contains(&records[0].filename));

        // The fresh backup makes the next check a skip.
        scheduler.tick().await;
        assert_eq!(h.dumper.calls.load(Ordering::SeqCst), 1);
        assert_eq!(scheduler.get_logs()[0].outcome, ScheduleOutcome::Skipped);
        Ok(())
    }

    #[tokio::test]
    async fn test_dump_failure_is_logged_as_failed() {
        let h = Harness::new();
        h.settings.set(automatic());
        h.dumper.fail.store(true, Ordering::SeqCst);
        let scheduler = scheduler(&h, Duration::from_secs(3600));
        scheduler.tick().await;

        let logs = scheduler.get_logs();
        assert_eq!(logs[0].outcome, ScheduleOutcome::Failed);
        assert!(logs[0].message.as_deref().unwrap_or_default().contains("connection refused"));
    }

    #[tokio::test]
    async fn test_busy_is_a_skip() {
        let h = Harness::new();
        h.settings.set(automatic());
        let scheduler = scheduler(&h, Duration::from_secs(3600));
        let _held = h.services.lock.try_acquire().expect("lock free");
        scheduler.tick().await;
        assert_eq!(scheduler.get_logs()[0].outcome, ScheduleOutcome::Skipped);
        assert_eq!(h.dumper.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_lets_running_backup_finish() -> anyhow::Result<()> {
        let h = Harness::new();
        h.settings.set(automatic());
        h.dumper.delay_ms.store(500, Ordering::SeqCst);
        let scheduler = scheduler(&h, Duration::from_secs(3600));
        assert!(scheduler.start());

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(h.dumper.calls.load(Ordering::SeqCst), 1);
        assert!(scheduler.stop());
        assert!(!scheduler.is_running());
        tokio::time::sleep(Duration::from_secs(1)).await;

        let records = h.store.records_of_types(&[BackupType::Scheduled]).await?;
        assert_eq!(records.len(), 1);
        assert!(std::path::Path::new(&records[0].location).exists());
        assert_eq!(scheduler.get_logs()[0].outcome, ScheduleOutcome::Ran);
        assert!(!h.services.lock.is_held());
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_waits_for_running_backup() -> anyhow::Result<()> {
        let h = Harness::new();
        h.settings.set(automatic());
        h.dumper.delay_ms.store(500, Ordering::SeqCst);
        let scheduler = scheduler(&h, Duration::from_secs(3600));
        scheduler.start();
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert!(scheduler.shutdown().await);
        assert_eq!(h.store.records_of_types(&[BackupType::Scheduled]).await?.len(), 1);
        assert!(!scheduler.shutdown().await);
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn test_skips_are_rate_limited() {
        let h = Harness::new();
        h.settings.fail("unexpected end of JSON input");
        let scheduler = scheduler(&h, Duration::from_secs(3600));
        for _ in 0..3 {
            scheduler.tick().await;
        }
        let logs = scheduler.get_logs();
        assert_eq!(logs.len(), 1);
        assert!(logs[0].message.as_deref().unwrap_or_default().contains("unexpected end"));

        tokio::time::advance(Duration::from_secs(6 * 60 * 60 + 1)).await;
        scheduler.tick().await;
        assert_eq!(scheduler.get_logs().len(), 2);
        assert_eq!(h.settings.loads.load(Ordering::SeqCst), 4);
    }

    struct UnreachableStore;

    #[async_trait]
    impl BackupRecordStore for UnreachableStore {
        async fn create(&self, _record: &BackupRecord) -> Result<(), StoreError> {
            Err(StoreError::Database(sqlx::Error::PoolTimedOut))
        }

        async fn find(&self, _id: &str) -> Result<Option<BackupRecord>, StoreError> {
            Err(StoreError::Database(sqlx::Error::PoolTimedOut))
        }

        async fn update(&self, _record: &BackupRecord) -> Result<(), StoreError> {
            Err(StoreError::Database(sqlx::Error::PoolTimedOut))
        }

        async fn delete(&self, _id: &str) -> Result<(), StoreError> {
            Err(StoreError::Database(sqlx::Error::PoolTimedOut))
        }

        async fn list(&self, _query: &ListQuery) -> Result<BackupPage, StoreError> {
            Err(StoreError::Database(sqlx::Error::PoolTimedOut))
        }

        async fn records_of_types(
            &self,
            _types: &[BackupType],
        ) -> Result<Vec<BackupRecord>, StoreError> {
            Err(StoreError::Database(sqlx::Error::PoolTimedOut))
        }
    }

    #[tokio::test]
    async fn test_lookup_failure_is_logged_as_failed() {
        let h = Harness::new();
        h.settings.set(automatic());
        let mut services = h.services.clone();
        services.store = Arc::new(UnreachableStore);
        let scheduler = Scheduler::new(
            BackupOrchestrator::new(services, BackupOptions::default()),
            SchedulerOptions::default(),
        );
        scheduler.tick().await;

        let logs = scheduler.get_logs();
        assert_eq!(logs[0].outcome, ScheduleOutcome::Failed);
        assert_eq!(h.dumper.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_store_untouched_while_locked() {
        let h = Harness::new();
        h.settings.set(automatic());
        let mut services = h.services.clone();
        services.store = Arc::new(UnreachableStore);
        let scheduler = Scheduler::new(
            BackupOrchestrator::new(services, BackupOptions::default()),
            SchedulerOptions::default(),
        );
        let _restoring = h.services.lock.try_acquire().expect("lock free");
        scheduler.tick().await;

        // A store call would have been logged as `failed`.
        let logs = scheduler.get_logs();
        assert_eq!(logs[0].outcome, ScheduleOutcome::Skipped);
        assert_eq!(h.settings.loads.load(Ordering::SeqCst), 0);
    }
}
