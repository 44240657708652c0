use crate::errors::{ConfigError, RestoreError};
use async_trait::async_trait;
use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;
use std::time::Duration;
use tracing::{error, info, warn};

/// PostgreSQL SQLSTATE for "relation does not exist".
const UNDEFINED_TABLE: &str = "42P01";

const RESET_STATEMENTS: &[&str] = &[
    "DROP SCHEMA IF EXISTS public CASCADE",
    "CREATE SCHEMA public",
    "GRANT ALL ON SCHEMA public TO CURRENT_USER",
    "GRANT ALL ON SCHEMA public TO public",
];

/// The two direct database operations backup and restore need besides the
/// client tools.
#[async_trait]
pub trait DatabaseAdmin: Send + Sync {
    /// Rows in the domain item table. A database without that table counts as empty.
    async fn count_items(&self) -> Result<i64, sqlx::Error>;

    /// Drops and recreates the `public` schema in one transaction.
    async fn reset_schema(&self) -> Result<(), RestoreError>;
}

#[derive(Debug, Clone)]
pub struct PgDatabaseAdmin {
    pool: PgPool,
    item_table: String,
}

/// Pool that connects on first use.
pub fn lazy_pool(database_url: &str) -> Result<PgPool, ConfigError> {
    PgPoolOptions::new()
        .max_connections(5)
        .acquire_timeout(Duration::from_secs(10))
        .connect_lazy(database_url)
        .map_err(|e| ConfigError::ConnectionUrl(e.to_string()))
}

impl PgDatabaseAdmin {
    /// `item_table` must already be a validated plain identifier.
    pub fn new(pool: PgPool, item_table: impl Into<String>) -> Self {
        Self {
            pool,
            item_table: item_table.into(),
        }
    }
}

#[async_trait]
impl DatabaseAdmin for PgDatabaseAdmin {
    async fn count_items(&self) -> Result<i64, sqlx::Error> {
        let sql = format!(r#"SELECT COUNT(*) FROM "{}""#, self.item_table);
        match sqlx::query_scalar::<_, i64>(&sql).fetch_one(&self.pool).await {
            Ok(count) => Ok(count),
            Err(sqlx::Error::Database(db)) if db.code().as_deref() == Some(UNDEFINED_TABLE) => {
                warn!(table = %self.item_table, "Item table does not exist, counting 0 items");
                Ok(0)
            }
            Err(e) => Err(e),
        }
    }

    async fn reset_schema(&self) -> Result<(), RestoreError> {
        info!("Resetting public schema");
        let mut tx = self.pool.begin().await.map_err(RestoreError::SchemaReset)?;
        for statement in RESET_STATEMENTS {
            sqlx::query(statement)
                .execute(&mut *tx)
                .await
                .map_err(RestoreError::SchemaReset)?;
        }
        tx.commit().await.map_err(RestoreError::SchemaReset)?;
        info!("✓ Public schema recreated");
        Ok(())
    }
}

pub async fn check_db_connection(pool: &PgPool) -> bool {
    match sqlx::query("SELECT 1").execute(pool).await {
        Ok(_) => {
            info!("✅ Database connection OK");
            true
        }
        Err(e) => {
            error!("❌ Failed to connect to database: {e}");
            false
        }
    }
}
