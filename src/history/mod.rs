//! Durable audit trail of backup and restore attempts.
//!
//! Every orchestration run appends exactly one [`BackupAttempt`]. Writes go
//! through [`HistoryRecorder`], which never lets a persistence failure escape
//! to the caller: a lost audit record is an accepted degraded mode.

pub(crate) mod memory;
pub(crate) mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

use crate::errors::HistoryError;

pub use memory::MemoryHistoryStore;
pub use postgres::PgHistoryStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InitiatorKind {
    Manual,
    Automatic,
    Restore,
}

impl InitiatorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            InitiatorKind::Manual => "Manual",
            InitiatorKind::Automatic => "Automatic",
            InitiatorKind::Restore => "Restore",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "Manual" => Some(InitiatorKind::Manual),
            "Automatic" => Some(InitiatorKind::Automatic),
            "Restore" => Some(InitiatorKind::Restore),
            _ => None,
        }
    }
}

impl std::fmt::Display for InitiatorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One run's outcome. `id` is `None` until the store has assigned it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupAttempt {
    pub id: Option<i64>,
    pub timestamp: DateTime<Utc>,
    pub artifact_name: String,
    pub initiator_kind: InitiatorKind,
    pub initiator_id: Option<i64>,
    pub succeeded: bool,
    pub error_detail: Option<String>,
}

impl BackupAttempt {
    /// Placeholder created at run start; optimistic until an exit path says otherwise.
    pub fn begin(
        timestamp: DateTime<Utc>,
        artifact_name: String,
        initiator_kind: InitiatorKind,
        initiator_id: Option<i64>,
    ) -> Self {
        Self {
            id: None,
            timestamp,
            artifact_name,
            initiator_kind,
            initiator_id,
            succeeded: true,
            error_detail: None,
        }
    }

    pub fn mark_failed(&mut self, detail: impl Into<String>) {
        self.succeeded = false;
        self.error_detail = Some(detail.into());
    }
}

/// Append-only persistence for attempts.
#[async_trait]
pub trait HistoryStore: Send + Sync {
    /// Persists the attempt and returns the assigned id.
    async fn append(&self, attempt: &BackupAttempt) -> Result<i64, HistoryError>;

    /// Newest first.
    async fn list(&self, limit: i64, offset: i64) -> Result<Vec<BackupAttempt>, HistoryError>;

    async fn get(&self, id: i64) -> Result<Option<BackupAttempt>, HistoryError>;
}

/// Best-effort writer used by the orchestrator's finalize step.
#[derive(Clone)]
pub struct HistoryRecorder {
    store: Arc<dyn HistoryStore>,
    write_timeout: Duration,
}

impl HistoryRecorder {
    pub fn new(store: Arc<dyn HistoryStore>, write_timeout: Duration) -> Self {
        Self {
            store,
            write_timeout,
        }
    }

    /// Returns the stored id, or `None` when the write failed. Never errors.
    pub async fn record(&self, attempt: &BackupAttempt) -> Option<i64> {
        let write = tokio::time::timeout(self.write_timeout, self.store.append(attempt));
        let result = match write.await {
            Ok(result) => result,
            Err(_) => Err(HistoryError::TimedOut(self.write_timeout.as_secs())),
        };

        match result {
            Ok(id) => {
                tracing::debug!(id, artifact = %attempt.artifact_name, "history record stored");
                Some(id)
            }
            Err(e) => {
                tracing::warn!(
                    artifact = %attempt.artifact_name,
                    succeeded = attempt.succeeded,
                    error = %e,
                    "failed to persist backup history record"
                );
                None
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Store whose writes always fail, for exercising the swallow path.
    #[derive(Default)]
    pub struct FailingHistoryStore {
        pub attempts: AtomicUsize,
    }

    #[async_trait]
    impl HistoryStore for FailingHistoryStore {
        async fn append(&self, _attempt: &BackupAttempt) -> Result<i64, HistoryError> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            Err(HistoryError::Unavailable("connection reset".to_string()))
        }

        async fn list(&self, _limit: i64, _offset: i64) -> Result<Vec<BackupAttempt>, HistoryError> {
            Err(HistoryError::Unavailable("connection reset".to_string()))
        }

        async fn get(&self, _id: i64) -> Result<Option<BackupAttempt>, HistoryError> {
            Err(HistoryError::Unavailable("connection reset".to_string()))
        }
    }

    /// Store that never answers, for exercising the write timeout.
    pub struct StalledHistoryStore;

    #[async_trait]
    impl HistoryStore for StalledHistoryStore {
        async fn append(&self, _attempt: &BackupAttempt) -> Result<i64, HistoryError> {
            std::future::pending().await
        }

        async fn list(&self, _limit: i64, _offset: i64) -> Result<Vec<BackupAttempt>, HistoryError> {
            std::future::pending().await
        }

        async fn get(&self, _id: i64) -> Result<Option<BackupAttempt>, HistoryError> {
            std::future::pending().await
        }
    }
}
