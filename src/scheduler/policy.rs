use crate::config::{BackupFrequency, BackupSettings};
use chrono::{DateTime, Duration, Months, Utc};

/// Whether an automatic backup is due at `now`.
///
/// `last_backup` is the creation time of the newest manual or scheduled
/// backup. Monthly means one calendar month, clamped to the last day of
/// shorter months.
pub fn should_run(
    settings: &BackupSettings,
    last_backup: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
) -> bool {
    if !settings.automatic_backups {
        return false;
    }
    let Some(last) = last_backup else {
        return true;
    };
    match next_due(settings.backup_frequency, last) {
        Some(due) => now >= due,
        None => false,
    }
}

/// Earliest instant the next backup becomes due.
pub fn next_due(frequency: BackupFrequency, last: DateTime<Utc>) -> Option<DateTime<Utc>> {
    match frequency {
        BackupFrequency::Daily => last.checked_add_signed(Duration::days(1)),
        BackupFrequency::Weekly => last.checked_add_signed(Duration::days(7)),
        BackupFrequency::Monthly => last.checked_add_months(Months::new(1)),
    }
}
