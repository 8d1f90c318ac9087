use std::path::PathBuf;
use std::process::ExitStatus;

use thiserror::Error;

/// Why the external dump utility did not leave a usable artifact behind.
#[derive(Error, Debug)]
pub enum SnapshotError {
    #[error("dump tool exited with {status}: {stderr}")]
    NonZeroExit { status: ExitStatus, stderr: String },

    #[error("dump tool reported success but produced an empty or missing artifact at {path}")]
    EmptyArtifact { path: PathBuf },

    #[error("dump tool '{tool}' could not be started: {reason}")]
    ToolUnavailable { tool: String, reason: String },

    #[error("dump did not finish within {0} seconds")]
    TimedOut(u64),

    #[error("dump cancelled before completion")]
    Cancelled,

    #[error("I/O error while dumping: {0}")]
    Io(#[from] std::io::Error),
}

/// Failures talking to the remote object store.
#[derive(Error, Debug)]
pub enum UploadError {
    #[error("authentication with remote storage failed: {detail}")]
    Auth { detail: String },

    #[error("remote storage rejected the request ({status}): {detail}")]
    Rejected { status: u16, detail: String },

    #[error("upload did not complete: {0}")]
    NotCompleted(String),

    #[error("object '{0}' not found in remote storage")]
    NotFound(String),

    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("S3 error: {0}")]
    S3(String),

    #[error("transfer cancelled before completion")]
    Cancelled,

    #[error("I/O error during transfer: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Error, Debug)]
pub enum HistoryError {
    #[error("history database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("history write timed out after {0} seconds")]
    TimedOut(u64),

    #[error("history store unavailable: {0}")]
    Unavailable(String),
}

#[derive(Error, Debug)]
pub enum RestoreError {
    #[error("artifact download failed: {0}")]
    Download(#[from] UploadError),

    #[error("'{0}' is not a valid backup artifact name")]
    InvalidArtifact(String),

    #[error("restore tool exited with {status}: {stderr}")]
    NonZeroExit { status: ExitStatus, stderr: String },

    #[error("restore tool '{tool}' could not be started: {reason}")]
    ToolUnavailable { tool: String, reason: String },

    #[error("restore did not finish within {0} seconds")]
    TimedOut(u64),

    #[error("restore cancelled before completion")]
    Cancelled,

    #[error("I/O error during restore: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },

    #[error("missing required setting: {0}")]
    Missing(&'static str),

    #[error("invalid setting {field}: {reason}")]
    Invalid { field: &'static str, reason: String },

    #[error("invalid database URL: {0}")]
    UrlParse(#[from] url::ParseError),
}

/// Returned instead of starting a run while another one holds the orchestrator lock.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("a backup or restore is already in progress")]
pub struct OrchestratorBusy;

#[derive(Error, Debug)]
pub enum AppError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("History store error: {0}")]
    History(#[from] HistoryError),

    #[error("Invalid input: {0}")]
    InvalidInput(String),
}

pub type Result<T> = std::result::Result<T, AppError>;
