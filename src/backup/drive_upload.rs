// backupd/src/backup/drive_upload.rs
//! Google Drive destination authenticated with a stored OAuth2 refresh token.
//!
//! The refresh token is the only long-lived secret: every transfer exchanges it
//! for a short-lived access token, and no consent flow ever runs here. Uploads
//! use a resumable session so the body can be streamed from disk, but a broken
//! session is never resumed; the whole upload is simply failed.

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::header::{CONTENT_LENGTH, LOCATION};
use reqwest::{Client, Response, StatusCode};
use serde::Deserialize;
use serde_json::json;
use std::path::Path;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio_util::io::ReaderStream;
use tokio_util::sync::CancellationToken;

use crate::backup::remote::{RemoteStore, UploadReceipt};
use crate::config::DriveConfig;
use crate::errors::UploadError;

const MAX_ERROR_BODY_CHARS: usize = 500;

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
}

#[derive(Deserialize)]
struct DriveFile {
    id: String,
    name: Option<String>,
    size: Option<String>,
}

#[derive(Deserialize)]
struct FileList {
    #[serde(default)]
    files: Vec<DriveFile>,
}

pub struct DriveStore {
    config: DriveConfig,
    http: Client,
}

impl DriveStore {
    pub fn new(config: DriveConfig) -> Result<Self, UploadError> {
        let http = Client::builder()
            .connect_timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self { config, http })
    }

    async fn access_token(&self) -> Result<String, UploadError> {
        let response = self
            .http
            .post(&self.config.token_url)
            .form(&[
                ("client_id", self.config.client_id.as_str()),
                ("client_secret", self.config.client_secret.as_str()),
                ("refresh_token", self.config.refresh_token.as_str()),
                ("grant_type", "refresh_token"),
            ])
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            return Err(UploadError::Auth {
                detail: service_error_text(&body).unwrap_or_else(|| format!("HTTP {}", status)),
            });
        }
        let token: TokenResponse = serde_json::from_str(&body).map_err(|e| UploadError::Auth {
            detail: format!("malformed token response: {}", e),
        })?;
        Ok(token.access_token)
    }

    async fn upload_inner(&self, local_path: &Path, name: &str) -> Result<UploadReceipt, UploadError> {
        let size_bytes = tokio::fs::metadata(local_path).await?.len();
        let token = self.access_token().await?;

        let init_url = format!(
            "{}/upload/drive/v3/files?uploadType=resumable&fields=id,name,size",
            self.config.api_base_url
        );
        let metadata = json!({ "name": name, "parents": [self.config.folder_id] });
        let session = self
            .http
            .post(&init_url)
            .bearer_auth(&token)
            .header("X-Upload-Content-Type", "application/octet-stream")
            .header("X-Upload-Content-Length", size_bytes)
            .json(&metadata)
            .send()
            .await?;
        let session = ensure_success(session).await?;
        let session_url = session
            .headers()
            .get(LOCATION)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
            .ok_or_else(|| UploadError::NotCompleted("no upload session location returned".to_string()))?;

        let file = tokio::fs::File::open(local_path).await?;
        let body = reqwest::Body::wrap_stream(ReaderStream::new(file));
        let response = self
            .http
            .put(&session_url)
            .bearer_auth(&token)
            .header(CONTENT_LENGTH, size_bytes)
            .body(body)
            .send()
            .await?;

        let status = response.status();
        if !matches!(status, StatusCode::OK | StatusCode::CREATED) {
            let body = response.text().await.unwrap_or_default();
            return Err(UploadError::Rejected {
                status: status.as_u16(),
                detail: service_error_text(&body).unwrap_or_else(|| format!("HTTP {}", status)),
            });
        }

        let uploaded: DriveFile = response.json().await?;
        let reported_size = uploaded.size.as_deref().and_then(|s| s.parse::<u64>().ok());
        if let Some(reported) = reported_size {
            if reported != size_bytes {
                return Err(UploadError::NotCompleted(format!(
                    "remote size {} does not match local size {}",
                    reported, size_bytes
                )));
            }
        }

        Ok(UploadReceipt {
            remote_id: uploaded.id,
            name: uploaded.name.unwrap_or_else(|| name.to_string()),
            size_bytes,
        })
    }

    async fn find_file_id(&self, token: &str, name: &str) -> Result<String, UploadError> {
        let query = format!(
            "name = '{}' and '{}' in parents and trashed = false",
            escape_query(name),
            escape_query(&self.config.folder_id)
        );
        let response = self
            .http
            .get(format!("{}/drive/v3/files", self.config.api_base_url))
            .bearer_auth(token)
            .query(&[
                ("q", query.as_str()),
                ("fields", "files(id,name,size)"),
                ("pageSize", "10"),
            ])
            .send()
            .await?;
        let listing: FileList = ensure_success(response).await?.json().await?;
        listing
            .files
            .into_iter()
            .next()
            .map(|f| f.id)
            .ok_or_else(|| UploadError::NotFound(name.to_string()))
    }

    async fn download_inner(&self, name: &str, dest: &Path) -> Result<u64, UploadError> {
        let token = self.access_token().await?;
        let file_id = self.find_file_id(&token, name).await?;

        let response = self
            .http
            .get(format!("{}/drive/v3/files/{}", self.config.api_base_url, file_id))
            .bearer_auth(&token)
            .query(&[("alt", "media")])
            .send()
            .await?;
        let response = ensure_success(response).await?;

        let mut output = tokio::fs::File::create(dest).await?;
        let mut stream = response.bytes_stream();
        let mut total = 0u64;
        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            output.write_all(&chunk).await?;
            total += chunk.len() as u64;
        }
        output.flush().await?;
        Ok(total)
    }
}

#[async_trait]
impl RemoteStore for DriveStore {
    fn describe(&self) -> String {
        format!("google-drive:folder/{}", self.config.folder_id)
    }

    async fn upload(
        &self,
        local_path: &Path,
        name: &str,
        cancel: &CancellationToken,
    ) -> Result<UploadReceipt, UploadError> {
        tracing::info!(
            file = %local_path.display(),
            name,
            folder = %self.config.folder_id,
            "uploading artifact to Google Drive"
        );
        let receipt = tokio::select! {
            result = self.upload_inner(local_path, name) => result?,
            _ = cancel.cancelled() => return Err(UploadError::Cancelled),
        };
        tracing::info!(name, remote_id = %receipt.remote_id, size_bytes = receipt.size_bytes, "upload completed");
        Ok(receipt)
    }

    async fn download(
        &self,
        name: &str,
        dest: &Path,
        cancel: &CancellationToken,
    ) -> Result<u64, UploadError> {
        tracing::info!(name, dest = %dest.display(), "downloading artifact from Google Drive");
        tokio::select! {
            result = self.download_inner(name, dest) => result,
            _ = cancel.cancelled() => Err(UploadError::Cancelled),
        }
    }
}

async fn ensure_success(response: Response) -> Result<Response, UploadError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    let detail = service_error_text(&body).unwrap_or_else(|| format!("HTTP {}", status));
    if status == StatusCode::UNAUTHORIZED {
        return Err(UploadError::Auth { detail });
    }
    Err(UploadError::Rejected {
        status: status.as_u16(),
        detail,
    })
}

/// Pulls the service's own message out of an OAuth2 or Drive API error body.
fn service_error_text(body: &str) -> Option<String> {
    if let Ok(value) = serde_json::from_str::<serde_json::Value>(body) {
        if let Some(message) = value.pointer("/error/message").and_then(|v| v.as_str()) {
            return Some(message.to_string());
        }
        if let Some(description) = value.get("error_description").and_then(|v| v.as_str()) {
            let code = value.get("error").and_then(|v| v.as_str()).unwrap_or("error");
            return Some(format!("{}: {}", code, description));
        }
        if let Some(code) = value.get("error").and_then(|v| v.as_str()) {
            return Some(code.to_string());
        }
    }
    let trimmed = body.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.chars().take(MAX_ERROR_BODY_CHARS).collect())
    }
}

fn escape_query(value: &str) -> String {
    value.replace('\\', "\\\\").replace('\'', "\\'")
}
