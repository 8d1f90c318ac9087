// backupd/src/history/postgres.rs
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;

use super::{BackupAttempt, HistoryStore, InitiatorKind};
use crate::errors::HistoryError;

const CREATE_TABLE_SQL: &str = r#"
    CREATE TABLE IF NOT EXISTS backup_history (
        id              BIGSERIAL PRIMARY KEY,
        started_at      TIMESTAMPTZ NOT NULL,
        artifact_name   TEXT NOT NULL,
        initiator_kind  TEXT NOT NULL,
        initiator_id    BIGINT NULL,
        succeeded       BOOLEAN NOT NULL,
        error_detail    TEXT NULL
    )
"#;

const CREATE_INDEX_SQL: &str =
    "CREATE INDEX IF NOT EXISTS backup_history_started_at_idx ON backup_history (started_at DESC)";

#[derive(sqlx::FromRow)]
struct HistoryRow {
    id: i64,
    started_at: DateTime<Utc>,
    artifact_name: String,
    initiator_kind: String,
    initiator_id: Option<i64>,
    succeeded: bool,
    error_detail: Option<String>,
}

impl TryFrom<HistoryRow> for BackupAttempt {
    type Error = HistoryError;

    fn try_from(row: HistoryRow) -> Result<Self, Self::Error> {
        let initiator_kind = InitiatorKind::parse(&row.initiator_kind).ok_or_else(|| {
            HistoryError::Unavailable(format!(
                "unknown initiator kind '{}' in history row {}",
                row.initiator_kind, row.id
            ))
        })?;
        Ok(BackupAttempt {
            id: Some(row.id),
            timestamp: row.started_at,
            artifact_name: row.artifact_name,
            initiator_kind,
            initiator_id: row.initiator_id,
            succeeded: row.succeeded,
            error_detail: row.error_detail,
        })
    }
}

/// History persisted in the `backup_history` table.
#[derive(Clone)]
pub struct PgHistoryStore {
    pool: PgPool,
}

impl PgHistoryStore {
    pub async fn connect(database_url: &str) -> Result<Self, HistoryError> {
        let pool = PgPoolOptions::new()
            .max_connections(4)
            .acquire_timeout(std::time::Duration::from_secs(10))
            .connect(database_url)
            .await?;
        Ok(Self::from_pool(pool))
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn ensure_schema(&self) -> Result<(), HistoryError> {
        sqlx::query(CREATE_TABLE_SQL).execute(&self.pool).await?;
        sqlx::query(CREATE_INDEX_SQL).execute(&self.pool).await?;
        Ok(())
    }
}

#[async_trait]
impl HistoryStore for PgHistoryStore {
    async fn append(&self, attempt: &BackupAttempt) -> Result<i64, HistoryError> {
        let id: i64 = sqlx::query_scalar(
            "INSERT INTO backup_history
                (started_at, artifact_name, initiator_kind, initiator_id, succeeded, error_detail)
             VALUES ($1, $2, $3, $4, $5, $6)
             RETURNING id",
        )
        .bind(attempt.timestamp)
        .bind(&attempt.artifact_name)
        .bind(attempt.initiator_kind.as_str())
        .bind(attempt.initiator_id)
        .bind(attempt.succeeded)
        .bind(&attempt.error_detail)
        .fetch_one(&self.pool)
        .await?;
        Ok(id)
    }

    async fn list(&self, limit: i64, offset: i64) -> Result<Vec<BackupAttempt>, HistoryError> {
        let rows = sqlx::query_as::<_, HistoryRow>(
            "SELECT id, started_at, artifact_name, initiator_kind, initiator_id, succeeded, error_detail
             FROM backup_history
             ORDER BY started_at DESC, id DESC
             LIMIT $1 OFFSET $2",
        )
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(BackupAttempt::try_from).collect()
    }

    async fn get(&self, id: i64) -> Result<Option<BackupAttempt>, HistoryError> {
        let row = sqlx::query_as::<_, HistoryRow>(
            "SELECT id, started_at, artifact_name, initiator_kind, initiator_id, succeeded, error_detail
             FROM backup_history
             WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(BackupAttempt::try_from).transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn row(kind: &str) -> HistoryRow {
        HistoryRow {
            id: 7,
            started_at: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
            artifact_name: "backup_20240101_000000.sql".to_string(),
            initiator_kind: kind.to_string(),
            initiator_id: None,
            succeeded: false,
            error_detail: Some("upload failed".to_string()),
        }
    }

    #[test]
    fn test_row_conversion() {
        let attempt = BackupAttempt::try_from(row("Automatic")).unwrap();
        assert_eq!(attempt.id, Some(7));
        assert_eq!(attempt.initiator_kind, InitiatorKind::Automatic);
        assert_eq!(attempt.error_detail.as_deref(), Some("upload failed"));
    }

    #[test]
    fn test_row_conversion_rejects_unknown_kind() {
        assert!(BackupAttempt::try_from(row("Cron")).is_err());
    }
}
