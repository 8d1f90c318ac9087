// backupd/src/backup/orchestrator.rs
//! One entry point for manual, scheduled and restore runs.
//!
//! A run is strictly linear: start, snapshot (or download), upload (or
//! restore-exec), finalize. Finalize always executes: it appends exactly one
//! history record and removes the local artifact, and neither step can change
//! the outcome handed back to the caller. All runs share one lock, so no two
//! runs ever touch the database or the temp directory at the same time, and
//! every backup gets a name no earlier run has used.

use chrono::{DateTime, Utc};
use futures::FutureExt;
use serde::Serialize;
use std::panic::AssertUnwindSafe;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::backup::db_dump::SnapshotProducer;
use crate::backup::naming::{artifact_name, parse_artifact_name};
use crate::backup::remote::{RemoteStore, UploadReceipt};
use crate::config::DumpFormat;
use crate::errors::{OrchestratorBusy, RestoreError, SnapshotError, UploadError};
use crate::history::{BackupAttempt, HistoryRecorder, InitiatorKind};
use crate::restore::RestoreExecutor;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Initiator {
    Manual { operator_id: i64 },
    Automatic,
}

impl Initiator {
    fn kind(self) -> InitiatorKind {
        match self {
            Initiator::Manual { .. } => InitiatorKind::Manual,
            Initiator::Automatic => InitiatorKind::Automatic,
        }
    }

    fn operator_id(self) -> Option<i64> {
        match self {
            Initiator::Manual { operator_id } => Some(operator_id),
            Initiator::Automatic => None,
        }
    }
}

/// Which stage ended a failed run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FailureKind {
    Snapshot,
    Upload,
    Download,
    Restore,
    Internal,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum RunResult {
    Completed {
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        receipt: Option<UploadReceipt>,
    },
    Failed {
        reason: String,
        failure: FailureKind,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupOutcome {
    pub attempt: BackupAttempt,
    pub result: RunResult,
}

impl BackupOutcome {
    pub fn succeeded(&self) -> bool {
        matches!(self.result, RunResult::Completed { .. })
    }
}

struct StepFailure {
    kind: FailureKind,
    reason: String,
}

impl From<SnapshotError> for StepFailure {
    fn from(e: SnapshotError) -> Self {
        Self {
            kind: FailureKind::Snapshot,
            reason: e.to_string(),
        }
    }
}

impl From<UploadError> for StepFailure {
    fn from(e: UploadError) -> Self {
        Self {
            kind: FailureKind::Upload,
            reason: e.to_string(),
        }
    }
}

impl From<RestoreError> for StepFailure {
    fn from(e: RestoreError) -> Self {
        let kind = match &e {
            RestoreError::Download(_) | RestoreError::InvalidArtifact(_) => FailureKind::Download,
            _ => FailureKind::Restore,
        };
        Self {
            kind,
            reason: e.to_string(),
        }
    }
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    let detail = payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic payload".to_string());
    format!("internal error: {}", detail)
}

pub struct OrchestratorDeps {
    pub producer: Arc<dyn SnapshotProducer>,
    pub remote: Arc<dyn RemoteStore>,
    pub history: HistoryRecorder,
    pub restorer: Arc<dyn RestoreExecutor>,
}

/// Stamp of the most recently issued backup name, owned by whoever holds the run lock.
type RunGuard = OwnedMutexGuard<Option<DateTime<Utc>>>;

struct RunContext {
    deps: OrchestratorDeps,
    temp_dir: PathBuf,
    cancel: CancellationToken,
}

/// Runs execute on their own task, so a caller that stops waiting (a dropped
/// HTTP request, a timeout) never cuts a run short of finalize.
pub struct BackupOrchestrator {
    ctx: Arc<RunContext>,
    lock: Arc<Mutex<Option<DateTime<Utc>>>>,
    clock: fn() -> DateTime<Utc>,
}

impl BackupOrchestrator {
    pub fn new(deps: OrchestratorDeps, temp_dir: PathBuf, cancel: CancellationToken) -> Self {
        Self {
            ctx: Arc::new(RunContext {
                deps,
                temp_dir,
                cancel,
            }),
            lock: Arc::new(Mutex::new(None)),
            clock: Utc::now,
        }
    }

    /// Replaces the wall clock used to stamp attempts.
    pub fn with_clock(mut self, clock: fn() -> DateTime<Utc>) -> Self {
        self.clock = clock;
        self
    }

    /// Starts a backup only if nothing else is running.
    pub async fn try_backup(&self, initiator: Initiator) -> Result<BackupOutcome, OrchestratorBusy> {
        let guard = Arc::clone(&self.lock)
            .try_lock_owned()
            .map_err(|_| OrchestratorBusy)?;
        Ok(self.spawn_backup(initiator, guard).await)
    }

    /// Waits for any running backup or restore, then runs.
    pub async fn backup(&self, initiator: Initiator) -> BackupOutcome {
        let guard = Arc::clone(&self.lock).lock_owned().await;
        self.spawn_backup(initiator, guard).await
    }

    pub async fn try_restore(
        &self,
        artifact: &str,
        operator_id: Option<i64>,
    ) -> Result<BackupOutcome, OrchestratorBusy> {
        let guard = Arc::clone(&self.lock)
            .try_lock_owned()
            .map_err(|_| OrchestratorBusy)?;
        Ok(self.spawn_restore(artifact, operator_id, guard).await)
    }

    async fn spawn_backup(&self, initiator: Initiator, mut guard: RunGuard) -> BackupOutcome {
        let started = next_stamp((self.clock)(), *guard);
        *guard = Some(started);
        let name = artifact_name(started, self.ctx.deps.producer.extension());
        let attempt = BackupAttempt::begin(started, name, initiator.kind(), initiator.operator_id());
        tracing::info!(
            artifact = %attempt.artifact_name,
            initiator = %attempt.initiator_kind,
            operator_id = ?attempt.initiator_id,
            "backup run started"
        );

        let ctx = Arc::clone(&self.ctx);
        let run = attempt.clone();
        let handle = tokio::spawn(async move { ctx.run_backup(run, guard).await });
        join_run(handle, attempt).await
    }

    async fn spawn_restore(&self, artifact: &str, operator_id: Option<i64>, guard: RunGuard) -> BackupOutcome {
        let started = (self.clock)();
        let attempt = BackupAttempt::begin(started, artifact.to_string(), InitiatorKind::Restore, operator_id);
        tracing::info!(artifact, operator_id = ?operator_id, "restore run started");

        let ctx = Arc::clone(&self.ctx);
        let run = attempt.clone();
        let handle = tokio::spawn(async move { ctx.run_restore(run, guard).await });
        join_run(handle, attempt).await
    }
}

/// Two runs within the same second would otherwise share an artifact name.
fn next_stamp(now: DateTime<Utc>, last: Option<DateTime<Utc>>) -> DateTime<Utc> {
    match last.map(|last| last + chrono::Duration::seconds(1)) {
        Some(floor) if now < floor => floor,
        _ => now,
    }
}

async fn join_run(handle: JoinHandle<BackupOutcome>, mut attempt: BackupAttempt) -> BackupOutcome {
    match handle.await {
        Ok(outcome) => outcome,
        Err(e) => {
            let reason = format!("internal error: run task ended abnormally: {}", e);
            tracing::error!(artifact = %attempt.artifact_name, error = %e, "run task ended abnormally");
            attempt.mark_failed(reason.clone());
            BackupOutcome {
                attempt,
                result: RunResult::Failed {
                    reason,
                    failure: FailureKind::Internal,
                },
            }
        }
    }
}

impl RunContext {
    async fn run_backup(&self, attempt: BackupAttempt, _guard: RunGuard) -> BackupOutcome {
        let name = attempt.artifact_name.clone();
        let temp_path = self.temp_dir.join(&name);

        let body = AssertUnwindSafe(self.snapshot_and_upload(&temp_path, &name))
            .catch_unwind()
            .await;
        let result = match body {
            Ok(Ok(receipt)) => RunResult::Completed {
                message: format!(
                    "Backup {} uploaded to {} ({} bytes)",
                    name,
                    self.deps.remote.describe(),
                    receipt.size_bytes
                ),
                receipt: Some(receipt),
            },
            Ok(Err(failure)) => RunResult::Failed {
                reason: failure.reason,
                failure: failure.kind,
            },
            Err(payload) => RunResult::Failed {
                reason: panic_message(payload),
                failure: FailureKind::Internal,
            },
        };

        self.finalize(attempt, result, Some(&temp_path)).await
    }

    async fn snapshot_and_upload(&self, temp_path: &Path, name: &str) -> Result<UploadReceipt, StepFailure> {
        tokio::fs::create_dir_all(&self.temp_dir)
            .await
            .map_err(SnapshotError::from)?;
        let snapshot = self.deps.producer.produce(temp_path, &self.cancel).await?;
        let receipt = self
            .deps
            .remote
            .upload(&snapshot.path, name, &self.cancel)
            .await?;
        Ok(receipt)
    }

    async fn run_restore(&self, attempt: BackupAttempt, _guard: RunGuard) -> BackupOutcome {
        let artifact = attempt.artifact_name.clone();
        let body = AssertUnwindSafe(self.download_and_restore(&artifact))
            .catch_unwind()
            .await;
        let result = match body {
            Ok(Ok(bytes)) => RunResult::Completed {
                message: format!("Restored {} ({} bytes) from {}", artifact, bytes, self.deps.remote.describe()),
                receipt: None,
            },
            Ok(Err(failure)) => RunResult::Failed {
                reason: failure.reason,
                failure: failure.kind,
            },
            Err(payload) => RunResult::Failed {
                reason: panic_message(payload),
                failure: FailureKind::Internal,
            },
        };

        // Names that fail validation never reach the filesystem.
        let temp_path = self.restore_path(&artifact);
        self.finalize(attempt, result, temp_path.as_deref()).await
    }

    fn restore_path(&self, artifact: &str) -> Option<PathBuf> {
        parse_artifact_name(artifact).map(|_| self.temp_dir.join(format!("restore_{}", artifact)))
    }

    async fn download_and_restore(&self, artifact: &str) -> Result<u64, StepFailure> {
        let format = parse_artifact_name(artifact)
            .and_then(|(_, ext)| DumpFormat::from_extension(ext))
            .ok_or_else(|| RestoreError::InvalidArtifact(artifact.to_string()))?;
        let temp_path = self
            .restore_path(artifact)
            .ok_or_else(|| RestoreError::InvalidArtifact(artifact.to_string()))?;
        tokio::fs::create_dir_all(&self.temp_dir)
            .await
            .map_err(RestoreError::from)?;
        let bytes = self
            .deps
            .remote
            .download(artifact, &temp_path, &self.cancel)
            .await
            .map_err(RestoreError::from)?;
        self.deps
            .restorer
            .restore(&temp_path, format, &self.cancel)
            .await?;
        Ok(bytes)
    }

    async fn finalize(&self, mut attempt: BackupAttempt, result: RunResult, temp_path: Option<&Path>) -> BackupOutcome {
        match &result {
            RunResult::Completed { message, .. } => {
                tracing::info!(artifact = %attempt.artifact_name, "{}", message);
            }
            RunResult::Failed { reason, failure } => {
                tracing::error!(artifact = %attempt.artifact_name, ?failure, reason = %reason, "run failed");
                attempt.mark_failed(reason.clone());
            }
        }

        attempt.id = self.deps.history.record(&attempt).await;

        if let Some(path) = temp_path {
            remove_local_artifact(path).await;
        }

        BackupOutcome { attempt, result }
    }
}

async fn remove_local_artifact(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => tracing::debug!(path = %path.display(), "removed local artifact"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => tracing::warn!(path = %path.display(), error = %e, "failed to remove local artifact"),
    }
}
