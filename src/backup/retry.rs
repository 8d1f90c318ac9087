//! Bounded retry with exponential backoff at the upload boundary.
//!
//! Every attempt re-sends the whole artifact. Cancellation and missing objects
//! are never retried.

use async_trait::async_trait;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::backup::remote::{RemoteStore, UploadReceipt};
use crate::config::UploadRetryConfig;
use crate::errors::UploadError;

pub struct RetryingStore {
    inner: Arc<dyn RemoteStore>,
    config: UploadRetryConfig,
}

impl RetryingStore {
    pub fn new(inner: Arc<dyn RemoteStore>, config: UploadRetryConfig) -> Self {
        Self { inner, config }
    }

    fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.config
            .initial_delay
            .saturating_mul(factor)
            .min(self.config.max_delay)
    }
}

fn is_retryable(err: &UploadError) -> bool {
    match err {
        UploadError::Cancelled | UploadError::NotFound(_) | UploadError::Io(_) => false,
        UploadError::Rejected { status, .. } => *status >= 500 || *status == 429 || *status == 408,
        UploadError::Auth { .. }
        | UploadError::NotCompleted(_)
        | UploadError::Network(_)
        | UploadError::S3(_) => true,
    }
}

#[async_trait]
impl RemoteStore for RetryingStore {
    fn describe(&self) -> String {
        self.inner.describe()
    }

    async fn upload(
        &self,
        local_path: &Path,
        name: &str,
        cancel: &CancellationToken,
    ) -> Result<UploadReceipt, UploadError> {
        let mut attempt = 1;
        loop {
            match self.inner.upload(local_path, name, cancel).await {
                Ok(receipt) => return Ok(receipt),
                Err(e) if attempt < self.config.max_attempts && is_retryable(&e) => {
                    let delay = self.delay_for(attempt);
                    tracing::warn!(
                        name,
                        attempt,
                        max_attempts = self.config.max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "upload failed, retrying"
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = cancel.cancelled() => return Err(UploadError::Cancelled),
                    }
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn download(
        &self,
        name: &str,
        dest: &Path,
        cancel: &CancellationToken,
    ) -> Result<u64, UploadError> {
        self.inner.download(name, dest, cancel).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backup::remote::test_support::MemoryStore;
    use std::sync::atomic::Ordering;

    fn config(max_attempts: u32) -> UploadRetryConfig {
        UploadRetryConfig {
            max_attempts,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
        }
    }

    fn artifact() -> (tempfile::TempDir, std::path::PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("backup_20240101_000000.sql");
        std::fs::write(&path, "SELECT 1;").unwrap();
        (dir, path)
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let store = RetryingStore::new(Arc::new(MemoryStore::default()), config(5));
        assert_eq!(store.delay_for(1), Duration::from_millis(1));
        assert_eq!(store.delay_for(2), Duration::from_millis(2));
        assert_eq!(store.delay_for(3), Duration::from_millis(4));
        assert_eq!(store.delay_for(4), Duration::from_millis(5));
    }

    #[tokio::test]
    async fn test_client_rejection_is_not_retried() {
        let (_dir, path) = artifact();
        let inner = Arc::new(MemoryStore::failing_times("permission denied", 2));
        let store = RetryingStore::new(inner.clone(), config(3));
        let err = store.upload(&path, "a.sql", &CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, UploadError::Rejected { status: 403, .. }));
        assert_eq!(inner.calls.load(Ordering::SeqCst), 1);
    }

    struct FlakyStore {
        inner: MemoryStore,
        failures_left: std::sync::atomic::AtomicU32,
    }

    #[async_trait]
    impl RemoteStore for FlakyStore {
        fn describe(&self) -> String {
            "flaky".to_string()
        }

        async fn upload(
            &self,
            local_path: &Path,
            name: &str,
            cancel: &CancellationToken,
        ) -> Result<UploadReceipt, UploadError> {
            if self.failures_left.load(Ordering::SeqCst) > 0 {
                self.failures_left.fetch_sub(1, Ordering::SeqCst);
                return Err(UploadError::Rejected {
                    status: 503,
                    detail: "backend error".to_string(),
                });
            }
            self.inner.upload(local_path, name, cancel).await
        }

        async fn download(
            &self,
            name: &str,
            dest: &Path,
            cancel: &CancellationToken,
        ) -> Result<u64, UploadError> {
            self.inner.download(name, dest, cancel).await
        }
    }

    #[tokio::test]
    async fn test_server_errors_retry_until_success() {
        let (_dir, path) = artifact();
        let flaky = Arc::new(FlakyStore {
            inner: MemoryStore::default(),
            failures_left: std::sync::atomic::AtomicU32::new(2),
        });
        let store = RetryingStore::new(flaky.clone(), config(3));
        let receipt = store.upload(&path, "a.sql", &CancellationToken::new()).await.unwrap();
        assert_eq!(receipt.size_bytes, 9);
        assert_eq!(flaky.inner.names(), vec!["a.sql".to_string()]);
    }

    #[tokio::test]
    async fn test_gives_up_after_max_attempts() {
        let (_dir, path) = artifact();
        let flaky = Arc::new(FlakyStore {
            inner: MemoryStore::default(),
            failures_left: std::sync::atomic::AtomicU32::new(10),
        });
        let store = RetryingStore::new(flaky.clone(), config(3));
        let err = store.upload(&path, "a.sql", &CancellationToken::new()).await.unwrap_err();
        assert!(err.to_string().contains("backend error"));
        assert_eq!(flaky.failures_left.load(Ordering::SeqCst), 7);
    }
}
