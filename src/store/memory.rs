use super::{BackupPage, BackupRecord, BackupRecordStore, BackupType, ListQuery};
use crate::errors::StoreError;
use async_trait::async_trait;
use tokio::sync::RwLock;

/// Process-local record store. Used when no database-backed store is wanted
/// and as the store in unit tests.
#[derive(Debug, Default)]
pub struct InMemoryBackupRecordStore {
    records: RwLock<Vec<BackupRecord>>,
}

impl InMemoryBackupRecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn all(&self) -> Vec<BackupRecord> {
        self.records.read().await.clone()
    }

    pub async fn clear(&self) {
        self.records.write().await.clear();
    }
}

#[async_trait]
impl BackupRecordStore for InMemoryBackupRecordStore {
    async fn create(&self, record: &BackupRecord) -> Result<(), StoreError> {
        let mut records = self.records.write().await;
        if records.iter().any(|r| r.id == record.id) {
            return Err(StoreError::Corrupt {
                id: record.id.clone(),
                reason: "duplicate id".into(),
            });
        }
        records.push(record.clone());
        Ok(())
    }

    async fn find(&self, id: &str) -> Result<Option<BackupRecord>, StoreError> {
        Ok(self.records.read().await.iter().find(|r| r.id == id).cloned())
    }

    async fn update(&self, record: &BackupRecord) -> Result<(), StoreError> {
        let mut records = self.records.write().await;
        match records.iter_mut().find(|r| r.id == record.id) {
            Some(existing) => {
                *existing = record.clone();
                Ok(())
            }
            None => Err(StoreError::NotFound(record.id.clone())),
        }
    }

    async fn delete(&self, id: &str) -> Result<(), StoreError> {
        let mut records = self.records.write().await;
        let before = records.len();
        records.retain(|r| r.id != id);
        if records.len() == before {
            return Err(StoreError::NotFound(id.to_string()));
        }
        Ok(())
    }

    async fn list(&self, query: &ListQuery) -> Result<BackupPage, StoreError> {
        let mut records = self.records.read().await.clone();
        records.sort_by(|a, b| {
            let ord = query.sort_by.compare(a, b).then_with(|| a.id.cmp(&b.id));
            if query.descending { ord.reverse() } else { ord }
        });
        let total = records.len() as u64;
        let page = records
            .into_iter()
            .skip(query.offset() as usize)
            .take(query.per_page as usize)
            .collect();
        Ok(BackupPage {
            records: page,
            total,
            page: query.page.max(1),
            per_page: query.per_page,
        })
    }

    async fn records_of_types(&self, types: &[BackupType]) -> Result<Vec<BackupRecord>, StoreError> {
        let mut records: Vec<BackupRecord> = self
            .records
            .read()
            .await
            .iter()
            .filter(|r| types.contains(&r.backup_type))
            .cloned()
            .collect();
        records.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(records)
    }
}
