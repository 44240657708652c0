use super::{BackupPage, BackupRecord, BackupRecordStore, BackupType, ListQuery};
use crate::errors::StoreError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{FromRow, PgPool};
use std::sync::Arc;
use tokio::sync::OnceCell;

const CREATE_TABLE_SQL: &str = r#"
    CREATE TABLE IF NOT EXISTS backup_records (
        id          TEXT PRIMARY KEY,
        filename    TEXT NOT NULL,
        size_bytes  BIGINT NOT NULL,
        item_count  BIGINT NOT NULL,
        location    TEXT NOT NULL,
        backup_type TEXT NOT NULL,
        created_at  TIMESTAMPTZ NOT NULL
    )
"#;

const COLUMNS: &str = "id, filename, size_bytes, item_count, location, backup_type, created_at";

#[derive(Debug, FromRow)]
struct BackupRow {
    id: String,
    filename: String,
    size_bytes: i64,
    item_count: i64,
    location: String,
    backup_type: String,
    created_at: DateTime<Utc>,
}

impl TryFrom<BackupRow> for BackupRecord {
    type Error = StoreError;

    fn try_from(row: BackupRow) -> Result<Self, Self::Error> {
        let backup_type = row
            .backup_type
            .parse::<BackupType>()
            .map_err(|reason| StoreError::Corrupt {
                id: row.id.clone(),
                reason,
            })?;
        let size_bytes = u64::try_from(row.size_bytes).map_err(|_| StoreError::Corrupt {
            id: row.id.clone(),
            reason: format!("negative size {}", row.size_bytes),
        })?;
        Ok(BackupRecord {
            id: row.id,
            filename: row.filename,
            size_bytes,
            item_count: row.item_count,
            location: row.location,
            backup_type,
            created_at: row.created_at,
        })
    }
}

fn size_to_db(record: &BackupRecord) -> Result<i64, StoreError> {
    i64::try_from(record.size_bytes).map_err(|_| StoreError::Corrupt {
        id: record.id.clone(),
        reason: format!("size {} does not fit in BIGINT", record.size_bytes),
    })
}

/// `backup_records` table in the application database.
///
/// The table is created by the first call only. A restore drops and replays
/// the schema, so ordinary calls must never recreate it behind the replay's
/// back; the restore engine calls [`BackupRecordStore::prepare`] once the
/// replay is over.
#[derive(Debug, Clone)]
pub struct PgBackupRecordStore {
    pool: PgPool,
    created: Arc<OnceCell<()>>,
}

impl PgBackupRecordStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            created: Arc::new(OnceCell::new()),
        }
    }

    async fn ensure_table(&self) -> Result<(), StoreError> {
        self.created
            .get_or_try_init(|| async {
                sqlx::query(CREATE_TABLE_SQL).execute(&self.pool).await?;
                Ok::<_, StoreError>(())
            })
            .await?;
        Ok(())
    }
}

#[async_trait]
impl BackupRecordStore for PgBackupRecordStore {
    async fn prepare(&self) -> Result<(), StoreError> {
        sqlx::query(CREATE_TABLE_SQL).execute(&self.pool).await?;
        let _ = self.created.set(());
        Ok(())
    }

    async fn create(&self, record: &BackupRecord) -> Result<(), StoreError> {
        self.ensure_table().await?;
        sqlx::query(&format!(
            "INSERT INTO backup_records ({COLUMNS}) VALUES ($1, $2, $3, $4, $5, $6, $7)"
        ))
        .bind(&record.id)
        .bind(&record.filename)
        .bind(size_to_db(record)?)
        .bind(record.item_count)
        .bind(&record.location)
        .bind(record.backup_type.as_str())
        .bind(record.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn find(&self, id: &str) -> Result<Option<BackupRecord>, StoreError> {
        self.ensure_table().await?;
        let row = sqlx::query_as::<_, BackupRow>(&format!(
            "SELECT {COLUMNS} FROM backup_records WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(BackupRecord::try_from).transpose()
    }

    async fn update(&self, record: &BackupRecord) -> Result<(), StoreError> {
        self.ensure_table().await?;
        let result = sqlx::query(
            "UPDATE backup_records
             SET filename = $2, size_bytes = $3, item_count = $4, location = $5,
                 backup_type = $6, created_at = $7
             WHERE id = $1",
        )
        .bind(&record.id)
        .bind(&record.filename)
        .bind(size_to_db(record)?)
        .bind(record.item_count)
        .bind(&record.location)
        .bind(record.backup_type.as_str())
        .bind(record.created_at)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(record.id.clone()));
        }
        Ok(())
    }

    async fn delete(&self, id: &str) -> Result<(), StoreError> {
        self.ensure_table().await?;
        let result = sqlx::query("DELETE FROM backup_records WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(id.to_string()));
        }
        Ok(())
    }

    async fn list(&self, query: &ListQuery) -> Result<BackupPage, StoreError> {
        self.ensure_table().await?;
        let total: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM backup_records")
            .fetch_one(&self.pool)
            .await?;

        // Column and direction come from closed enums, never from caller text.
        let direction = if query.descending { "DESC" } else { "ASC" };
        let rows = sqlx::query_as::<_, BackupRow>(&format!(
            "SELECT {COLUMNS} FROM backup_records ORDER BY {} {direction}, id {direction} LIMIT $1 OFFSET $2",
            query.sort_by.column()
        ))
        .bind(i64::from(query.per_page))
        .bind(i64::try_from(query.offset()).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await?;

        Ok(BackupPage {
            records: rows
                .into_iter()
                .map(BackupRecord::try_from)
                .collect::<Result<_, _>>()?,
            total: u64::try_from(total).unwrap_or_default(),
            page: query.page.max(1),
            per_page: query.per_page,
        })
    }

    async fn records_of_types(&self, types: &[BackupType]) -> Result<Vec<BackupRecord>, StoreError> {
        self.ensure_table().await?;
        let names: Vec<&str> = types.iter().map(|t| t.as_str()).collect();
        let rows = sqlx::query_as::<_, BackupRow>(&format!(
            "SELECT {COLUMNS} FROM backup_records WHERE backup_type = ANY($1) ORDER BY created_at DESC"
        ))
        .bind(&names)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(BackupRecord::try_from).collect()
    }

    async fn latest_of_types(&self, types: &[BackupType]) -> Result<Option<BackupRecord>, StoreError> {
        self.ensure_table().await?;
        let names: Vec<&str> = types.iter().map(|t| t.as_str()).collect();
        let row = sqlx::query_as::<_, BackupRow>(&format!(
            "SELECT {COLUMNS} FROM backup_records WHERE backup_type = ANY($1) ORDER BY created_at DESC LIMIT 1"
        ))
        .bind(&names)
        .fetch_optional(&self.pool)
        .await?;
        row.map(BackupRecord::try_from).transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(backup_type: &str, size_bytes: i64) -> BackupRow {
        BackupRow {
            id: "id-1".into(),
            filename: "backup-x.sql".into(),
            size_bytes,
            item_count: 3,
            location: "/backups/backup-x.sql".into(),
            backup_type: backup_type.into(),
            created_at: Utc::now(),
        }
    }

    #[test]
    fn row_conversion_validates_type_and_size() {
        let record = BackupRecord::try_from(row("safety", 12)).unwrap();
        assert_eq!(record.backup_type, BackupType::Safety);
        assert_eq!(record.size_bytes, 12);

        assert!(matches!(
            BackupRecord::try_from(row("hourly", 12)),
            Err(StoreError::Corrupt { .. })
        ));
        assert!(matches!(
            BackupRecord::try_from(row("manual", -1)),
            Err(StoreError::Corrupt { .. })
        ));
    }
}
