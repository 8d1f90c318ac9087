// backupd/src/backup/remote.rs
use async_trait::async_trait;
use serde::Serialize;
use std::path::Path;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::backup::drive_upload::DriveStore;
use crate::backup::retry::RetryingStore;
use crate::backup::s3_upload::SpacesStore;
use crate::config::{RemoteConfig, UploadRetryConfig};
use crate::errors::UploadError;

/// Confirmation returned by the remote service for a completed upload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadReceipt {
    pub remote_id: String,
    pub name: String,
    pub size_bytes: u64,
}

/// Remote destination for snapshot artifacts. Local files are only ever read by `upload`.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// Human-readable destination for logs, e.g. `google-drive:folder/abc`.
    fn describe(&self) -> String;

    async fn upload(
        &self,
        local_path: &Path,
        name: &str,
        cancel: &CancellationToken,
    ) -> Result<UploadReceipt, UploadError>;

    /// Streams the object called `name` into `dest`, returning the byte count.
    async fn download(
        &self,
        name: &str,
        dest: &Path,
        cancel: &CancellationToken,
    ) -> Result<u64, UploadError>;
}

pub fn build_remote_store(
    remote: &RemoteConfig,
    retry: &UploadRetryConfig,
) -> Result<Arc<dyn RemoteStore>, UploadError> {
    let store: Arc<dyn RemoteStore> = match remote {
        RemoteConfig::Drive(cfg) => Arc::new(DriveStore::new(cfg.clone())?),
        RemoteConfig::Spaces(cfg) => Arc::new(SpacesStore::new(cfg.clone())),
    };
    if retry.max_attempts > 1 {
        Ok(Arc::new(RetryingStore::new(store, retry.clone())))
    } else {
        Ok(store)
    }
}
