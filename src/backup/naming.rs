use chrono::{DateTime, Utc};

/// ISO-8601 UTC with millisecond precision, with `:` and `.` replaced so the
/// result is safe in file names and object keys.
pub fn timestamp_slug(at: DateTime<Utc>) -> String {
    at.format("%Y-%m-%dT%H:%M:%S%.3fZ")
        .to_string()
        .replace([':', '.'], "-")
}

pub fn backup_filename(at: DateTime<Utc>) -> String {
    format!("backup-{}.sql", timestamp_slug(at))
}

pub fn safety_filename(at: DateTime<Utc>) -> String {
    format!("backup-safety-{}.sql", timestamp_slug(at))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_file_names() {
        let at = Utc.with_ymd_and_hms(2026, 3, 9, 14, 5, 7).unwrap()
            + chrono::Duration::milliseconds(42);
        assert_eq!(backup_filename(at), "backup-2026-03-09T14-05-07-042Z.sql");
        assert_eq!(safety_filename(at), "backup-safety-2026-03-09T14-05-07-042Z.sql");
    }
}
