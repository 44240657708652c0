// collection-backup/src/restore/verification.rs
use crate::database::DatabaseAdmin;
use serde::Serialize;
use tracing::{info, warn};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Verification {
    pub expected_items: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub actual_items: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub warning: Option<String>,
}

impl Verification {
    pub fn matched(&self) -> bool {
        self.actual_items == Some(self.expected_items)
    }
}

/// Compares the restored item count with the backup's. A mismatch, or a
/// failed count, is reported as a warning and never fails the restore.
pub async fn verify_item_count(admin: &dyn DatabaseAdmin, expected_items: i64) -> Verification {
    match admin.count_items().await {
        Ok(actual) if actual == expected_items => {
            info!("✓ Restore verification passed: {actual} items");
            Verification {
                expected_items,
                actual_items: Some(actual),
                warning: None,
            }
        }
        Ok(actual) => {
            let warning =
                format!("Restored database has {actual} items, backup recorded {expected_items}");
            warn!("⚠️ {warning}");
            Verification {
                expected_items,
                actual_items: Some(actual),
                warning: Some(warning),
            }
        }
        Err(e) => {
            let warning = format!("Could not count restored items: {e}");
            warn!("⚠️ {warning}");
            Verification {
                expected_items,
                actual_items: None,
                warning: Some(warning),
            }
        }
    }
}
