// backupd/src/backup/naming.rs
use chrono::{DateTime, NaiveDateTime, Utc};

const PREFIX: &str = "backup_";
const TIMESTAMP_FORMAT: &str = "%Y%m%d_%H%M%S";

/// `backup_<yyyyMMdd_HHmmss>.<ext>`, always in UTC.
pub fn artifact_name(timestamp: DateTime<Utc>, extension: &str) -> String {
    format!("{}{}.{}", PREFIX, timestamp.format(TIMESTAMP_FORMAT), extension)
}

/// Inverse of [`artifact_name`]. Rejects anything that is not exactly the generated shape,
/// which also keeps path separators out of names used to build local paths.
pub fn parse_artifact_name(name: &str) -> Option<(DateTime<Utc>, &str)> {
    let rest = name.strip_prefix(PREFIX)?;
    let (stamp, extension) = rest.split_once('.')?;
    if extension.is_empty() || !extension.chars().all(|c| c.is_ascii_alphanumeric()) {
        return None;
    }
    let naive = NaiveDateTime::parse_from_str(stamp, TIMESTAMP_FORMAT).ok()?;
    if naive.format(TIMESTAMP_FORMAT).to_string() != stamp {
        return None;
    }
    Some((naive.and_utc(), extension))
}
