//! Backup metadata persistence boundary.

pub mod memory;
pub mod postgres;

pub use memory::InMemoryBackupRecordStore;
pub use postgres::PgBackupRecordStore;

use crate::errors::StoreError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use url::Url;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackupType {
    Manual,
    Scheduled,
    Safety,
}

impl BackupType {
    pub fn as_str(self) -> &'static str {
        match self {
            BackupType::Manual => "manual",
            BackupType::Scheduled => "scheduled",
            BackupType::Safety => "safety",
        }
    }
}

impl fmt::Display for BackupType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BackupType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "manual" => Ok(BackupType::Manual),
            "scheduled" => Ok(BackupType::Scheduled),
            "safety" => Ok(BackupType::Safety),
            other => Err(format!("unknown backup type '{other}'")),
        }
    }
}

/// Where a backup's bytes live.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackupLocation {
    Local(PathBuf),
    Remote(Url),
}

impl BackupLocation {
    pub fn parse(raw: &str) -> Self {
        if Path::new(raw).is_absolute() {
            return BackupLocation::Local(PathBuf::from(raw));
        }
        match Url::parse(raw) {
            // Single-letter schemes are Windows drive letters, not remotes.
            Ok(url) if url.scheme().len() > 1 => BackupLocation::Remote(url),
            _ => BackupLocation::Local(PathBuf::from(raw)),
        }
    }

    pub fn is_remote(&self) -> bool {
        matches!(self, BackupLocation::Remote(_))
    }
}

/// One physical backup artifact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupRecord {
    pub id: String,
    pub filename: String,
    pub size_bytes: u64,
    /// Domain row count captured before the dump started.
    pub item_count: i64,
    pub location: String,
    #[serde(rename = "type")]
    pub backup_type: BackupType,
    pub created_at: DateTime<Utc>,
}

impl BackupRecord {
    pub fn new(
        filename: impl Into<String>,
        size_bytes: u64,
        item_count: i64,
        location: impl Into<String>,
        backup_type: BackupType,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            filename: filename.into(),
            size_bytes,
            item_count,
            location: location.into(),
            backup_type,
            created_at,
        }
    }

    pub fn location(&self) -> BackupLocation {
        BackupLocation::parse(&self.location)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum BackupSortField {
    Id,
    Filename,
    SizeBytes,
    ItemCount,
    Location,
    Type,
    #[default]
    CreatedAt,
}

impl BackupSortField {
    pub(crate) fn column(self) -> &'static str {
        match self {
            BackupSortField::Id => "id",
            BackupSortField::Filename => "filename",
            BackupSortField::SizeBytes => "size_bytes",
            BackupSortField::ItemCount => "item_count",
            BackupSortField::Location => "location",
            BackupSortField::Type => "backup_type",
            BackupSortField::CreatedAt => "created_at",
        }
    }

    pub(crate) fn compare(self, a: &BackupRecord, b: &BackupRecord) -> Ordering {
        match self {
            BackupSortField::Id => a.id.cmp(&b.id),
            BackupSortField::Filename => a.filename.cmp(&b.filename),
            BackupSortField::SizeBytes => a.size_bytes.cmp(&b.size_bytes),
            BackupSortField::ItemCount => a.item_count.cmp(&b.item_count),
            BackupSortField::Location => a.location.cmp(&b.location),
            BackupSortField::Type => a.backup_type.as_str().cmp(b.backup_type.as_str()),
            BackupSortField::CreatedAt => a.created_at.cmp(&b.created_at),
        }
    }
}

/// Pagination and ordering for [`BackupRecordStore::list`]. No filtering.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListQuery {
    pub sort_by: BackupSortField,
    pub descending: bool,
    /// 1-based.
    pub page: u32,
    pub per_page: u32,
}

impl Default for ListQuery {
    fn default() -> Self {
        Self {
            sort_by: BackupSortField::CreatedAt,
            descending: true,
            page: 1,
            per_page: 20,
        }
    }
}

impl ListQuery {
    pub(crate) fn offset(&self) -> u64 {
        u64::from(self.page.max(1) - 1) * u64::from(self.per_page)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupPage {
    pub records: Vec<BackupRecord>,
    pub total: u64,
    pub page: u32,
    pub per_page: u32,
}

#[async_trait]
pub trait BackupRecordStore: Send + Sync {
    /// Makes sure the backing table exists, even if it was dropped since the
    /// store was first used.
    async fn prepare(&self) -> Result<(), StoreError> {
        Ok(())
    }

    async fn create(&self, record: &BackupRecord) -> Result<(), StoreError>;

    async fn find(&self, id: &str) -> Result<Option<BackupRecord>, StoreError>;

    /// Fails with [`StoreError::NotFound`] when no row has `record.id`.
    async fn update(&self, record: &BackupRecord) -> Result<(), StoreError>;

    async fn delete(&self, id: &str) -> Result<(), StoreError>;

    async fn list(&self, query: &ListQuery) -> Result<BackupPage, StoreError>;

    /// Records of the given types, newest first.
    async fn records_of_types(&self, types: &[BackupType]) -> Result<Vec<BackupRecord>, StoreError>;

    async fn latest_of_types(&self, types: &[BackupType]) -> Result<Option<BackupRecord>, StoreError> {
        Ok(self.records_of_types(types).await?.into_iter().next())
    }

    /// Every record, newest first.
    async fn all_records(&self) -> Result<Vec<BackupRecord>, StoreError> {
        self.records_of_types(&[BackupType::Manual, BackupType::Scheduled, BackupType::Safety])
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn location_parsing_distinguishes_local_and_remote() {
        assert_eq!(
            BackupLocation::parse("/var/backups/backup-1.sql"),
            BackupLocation::Local(PathBuf::from("/var/backups/backup-1.sql"))
        );
        assert!(BackupLocation::parse("s3://bucket/backups/backup-1.sql").is_remote());
        assert!(BackupLocation::parse("https://example.com/backup-1.sql").is_remote());
        assert!(BackupLocation::parse("dropbox:///backups/backup-1.sql").is_remote());
        assert!(!BackupLocation::parse("backups/backup-1.sql").is_remote());
        assert!(!BackupLocation::parse("C:/backups/backup-1.sql").is_remote());
    }

    #[test]
    fn record_serializes_with_wire_names() -> anyhow::Result<()> {
        let record = BackupRecord::new(
            "backup-2026-01-01T00-00-00-000Z.sql",
            42,
            7,
            "/tmp/x.sql",
            BackupType::Scheduled,
            Utc::now(),
        );
        let json = serde_json::to_value(&record)?;
        assert_eq!(json["type"], "scheduled");
        assert_eq!(json["sizeBytes"], 42);
        assert_eq!(json["itemCount"], 7);
        assert!(Uuid::parse_str(&record.id).is_ok());
        Ok(())
    }

    #[test]
    fn backup_type_round_trips_through_strings() {
        for t in [BackupType::Manual, BackupType::Scheduled, BackupType::Safety] {
            assert_eq!(t.as_str().parse::<BackupType>(), Ok(t));
        }
        assert!("weekly".parse::<BackupType>().is_err());
    }

    #[test]
    fn list_query_offset_is_one_based() {
        let query = ListQuery {
            page: 3,
            per_page: 10,
            ..ListQuery::default()
        };
        assert_eq!(query.offset(), 20);
        let zero = ListQuery {
            page: 0,
            ..ListQuery::default()
        };
        assert_eq!(zero.offset(), 0);
    }
}
