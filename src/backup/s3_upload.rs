// backupd/src/backup/s3_upload.rs
use async_trait::async_trait;
use aws_sdk_s3 as s3;
use s3::config::Region;
use s3::primitives::ByteStream;
use std::path::Path;
use tokio::io::AsyncWriteExt;
use tokio::sync::OnceCell;
use tokio_util::sync::CancellationToken;

use crate::backup::remote::{RemoteStore, UploadReceipt};
use crate::config::SpacesConfig;
use crate::errors::UploadError;

/// S3-compatible destination (DigitalOcean Spaces, MinIO, AWS).
pub struct SpacesStore {
    config: SpacesConfig,
    client: OnceCell<s3::Client>,
}

impl SpacesStore {
    pub fn new(config: SpacesConfig) -> Self {
        Self {
            config,
            client: OnceCell::new(),
        }
    }

    async fn client(&self) -> &s3::Client {
        self.client
            .get_or_init(|| async {
                let sdk_config = aws_config::defaults(s3::config::BehaviorVersion::latest())
                    .endpoint_url(&self.config.endpoint_url)
                    .region(Region::new(self.config.region.clone()))
                    .credentials_provider(s3::config::Credentials::new(
                        &self.config.access_key_id,
                        &self.config.secret_access_key,
                        None,     // session_token
                        None,     // expiry
                        "Static", // provider_name
                    ))
                    .load()
                    .await;
                s3::Client::new(&sdk_config)
            })
            .await
    }

    fn object_key(&self, name: &str) -> String {
        object_key(self.config.folder_prefix.as_deref(), name)
    }

    async fn upload_inner(&self, local_path: &Path, name: &str) -> Result<UploadReceipt, UploadError> {
        let size_bytes = tokio::fs::metadata(local_path).await?.len();
        let key = self.object_key(name);
        let body = ByteStream::from_path(local_path)
            .await
            .map_err(|e| UploadError::S3(format!("failed to read {}: {}", local_path.display(), e)))?;

        let output = self
            .client()
            .await
            .put_object()
            .bucket(&self.config.bucket_name)
            .key(&key)
            .body(body)
            .send()
            .await
            .map_err(|e| UploadError::S3(s3::error::DisplayErrorContext(e).to_string()))?;

        Ok(UploadReceipt {
            remote_id: output.e_tag().map(|t| t.trim_matches('"').to_string()).unwrap_or_else(|| key.clone()),
            name: name.to_string(),
            size_bytes,
        })
    }

    async fn download_inner(&self, name: &str, dest: &Path) -> Result<u64, UploadError> {
        let key = self.object_key(name);
        let mut object = self
            .client()
            .await
            .get_object()
            .bucket(&self.config.bucket_name)
            .key(&key)
            .send()
            .await
            .map_err(|e| {
                if e.as_service_error().map(|se| se.is_no_such_key()).unwrap_or(false) {
                    UploadError::NotFound(name.to_string())
                } else {
                    UploadError::S3(s3::error::DisplayErrorContext(e).to_string())
                }
            })?;

        let mut output_file = tokio::fs::File::create(dest).await?;
        let mut total_bytes_downloaded = 0u64;
        while let Some(bytes_chunk) = object
            .body
            .try_next()
            .await
            .map_err(|e| UploadError::S3(format!("failed reading object body: {}", e)))?
        {
            output_file.write_all(&bytes_chunk).await?;
            total_bytes_downloaded += bytes_chunk.len() as u64;
        }
        output_file.flush().await?;
        Ok(total_bytes_downloaded)
    }
}

fn object_key(prefix: Option<&str>, name: &str) -> String {
    match prefix.map(|p| p.trim_matches('/')).filter(|p| !p.is_empty()) {
        Some(prefix) => format!("{}/{}", prefix, name),
        None => name.to_string(),
    }
}

#[async_trait]
impl RemoteStore for SpacesStore {
    fn describe(&self) -> String {
        format!("s3://{}/{}", self.config.bucket_name, self.object_key(""))
    }

    async fn upload(
        &self,
        local_path: &Path,
        name: &str,
        cancel: &CancellationToken,
    ) -> Result<UploadReceipt, UploadError> {
        tracing::info!(
            file = %local_path.display(),
            bucket = %self.config.bucket_name,
            key = %self.object_key(name),
            "uploading artifact to S3"
        );
        tokio::select! {
            result = self.upload_inner(local_path, name) => result,
            _ = cancel.cancelled() => Err(UploadError::Cancelled),
        }
    }

    async fn download(
        &self,
        name: &str,
        dest: &Path,
        cancel: &CancellationToken,
    ) -> Result<u64, UploadError> {
        tracing::info!(
            bucket = %self.config.bucket_name,
            key = %self.object_key(name),
            dest = %dest.display(),
            "downloading artifact from S3"
        );
        tokio::select! {
            result = self.download_inner(name, dest) => result,
            _ = cancel.cancelled() => Err(UploadError::Cancelled),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_object_key_prefixing() {
        assert_eq!(object_key(None, "backup_20240101_000000.sql"), "backup_20240101_000000.sql");
        assert_eq!(object_key(Some(""), "a.sql"), "a.sql");
        assert_eq!(object_key(Some("exams/db/"), "a.sql"), "exams/db/a.sql");
        assert_eq!(object_key(Some("/exams"), "a.sql"), "exams/a.sql");
    }

    #[test]
    fn test_describe_names_bucket_and_prefix() {
        let store = SpacesStore::new(SpacesConfig {
            endpoint_url: "https://fra1.digitaloceanspaces.com".to_string(),
            region: "fra1".to_string(),
            access_key_id: "key".to_string(),
            secret_access_key: "secret".to_string(),
            bucket_name: "backups".to_string(),
            folder_prefix: Some("exams".to_string()),
        });
        assert_eq!(store.describe(), "s3://backups/exams/");
    }
}
