// backupd/src/backup/db_dump.rs
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::config::{DbConnection, DumpConfig, DumpFormat};
use crate::errors::SnapshotError;
use crate::utils::{ToolCommand, deadline, find_executable, stderr_tail};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotInfo {
    pub path: PathBuf,
    pub size_bytes: u64,
}

/// Produces one database snapshot at a caller-chosen path.
///
/// The file at `dest` belongs to the caller afterwards, whether or not this
/// returns an error; implementations never delete it.
#[async_trait]
pub trait SnapshotProducer: Send + Sync {
    fn extension(&self) -> &'static str;

    async fn produce(
        &self,
        dest: &Path,
        cancel: &CancellationToken,
    ) -> Result<SnapshotInfo, SnapshotError>;
}

pub(crate) fn password_env(cmd: ToolCommand, conn: &DbConnection) -> ToolCommand {
    match &conn.password {
        Some(pw) => cmd.env("PGPASSWORD", pw.clone()),
        None => cmd,
    }
}

/// `pg_dump` on this host, talking to the server over TCP.
pub fn local_dump_command(pg_dump: PathBuf, conn: &DbConnection, format: DumpFormat) -> ToolCommand {
    let cmd = ToolCommand::new(pg_dump).args([
        format.pg_dump_flag().to_string(),
        "--no-password".to_string(),
        "--host".to_string(),
        conn.host.clone(),
        "--port".to_string(),
        conn.port.to_string(),
        "--username".to_string(),
        conn.user.clone(),
        "--dbname".to_string(),
        conn.database.clone(),
    ]);
    password_env(cmd, conn)
}

/// `pg_dump` inside the database container. The password is forwarded by name
/// (`-e PGPASSWORD`) so it never appears on the docker command line.
pub fn docker_dump_command(
    docker: PathBuf,
    container: &str,
    conn: &DbConnection,
    format: DumpFormat,
) -> ToolCommand {
    let mut cmd = ToolCommand::new(docker).args(["exec"]);
    if conn.password.is_some() {
        cmd = cmd.args(["-e", "PGPASSWORD"]);
    }
    let cmd = cmd.args([
        container.to_string(),
        "pg_dump".to_string(),
        format.pg_dump_flag().to_string(),
        "--no-password".to_string(),
        "--username".to_string(),
        conn.user.clone(),
        "--dbname".to_string(),
        conn.database.clone(),
    ]);
    password_env(cmd, conn)
}

pub fn dump_command_from_config(config: &DumpConfig) -> Result<ToolCommand, SnapshotError> {
    let unavailable = |tool: &str| {
        let tool = tool.to_string();
        move |reason: String| SnapshotError::ToolUnavailable { tool, reason }
    };
    match &config.container {
        Some(container) => {
            let docker = find_executable("docker", None).map_err(unavailable("docker"))?;
            Ok(docker_dump_command(docker, container, &config.connection, config.format))
        }
        None => {
            let pg_dump = find_executable("pg_dump", config.pg_dump_path.as_deref())
                .map_err(unavailable("pg_dump"))?;
            Ok(local_dump_command(pg_dump, &config.connection, config.format))
        }
    }
}

enum CommandSource {
    Config(DumpConfig),
    Fixed(ToolCommand),
}

/// Snapshot producer backed by `pg_dump`, either local or inside a container.
pub struct PgDumpProducer {
    source: CommandSource,
    format: DumpFormat,
    timeout: Option<Duration>,
}

impl PgDumpProducer {
    pub fn new(config: DumpConfig) -> Self {
        let format = config.format;
        let timeout = config.timeout;
        Self {
            source: CommandSource::Config(config),
            format,
            timeout,
        }
    }

    /// Runs `command` verbatim instead of deriving one from configuration.
    pub fn with_command(command: ToolCommand, format: DumpFormat, timeout: Option<Duration>) -> Self {
        Self {
            source: CommandSource::Fixed(command),
            format,
            timeout,
        }
    }

    // Resolved per run so a tool installed after startup is still picked up.
    fn resolve(&self) -> Result<ToolCommand, SnapshotError> {
        match &self.source {
            CommandSource::Config(config) => dump_command_from_config(config),
            CommandSource::Fixed(command) => Ok(command.clone()),
        }
    }
}

#[async_trait]
impl SnapshotProducer for PgDumpProducer {
    fn extension(&self) -> &'static str {
        self.format.extension()
    }

    async fn produce(
        &self,
        dest: &Path,
        cancel: &CancellationToken,
    ) -> Result<SnapshotInfo, SnapshotError> {
        let command = self.resolve()?;
        tracing::info!(
            program = %command.program.display(),
            dest = %dest.display(),
            "starting database dump"
        );
        run_dump(&command, dest, self.timeout, cancel).await
    }
}

async fn run_dump(
    command: &ToolCommand,
    dest: &Path,
    timeout: Option<Duration>,
    cancel: &CancellationToken,
) -> Result<SnapshotInfo, SnapshotError> {
    let output_file = tokio::fs::File::create(dest).await?.into_std().await;

    let mut cmd = command.build();
    cmd.stdin(Stdio::null())
        .stdout(Stdio::from(output_file))
        .stderr(Stdio::piped());

    let child = cmd.spawn().map_err(|e| SnapshotError::ToolUnavailable {
        tool: command.program_name(),
        reason: e.to_string(),
    })?;

    // Dropping the wait future drops the child, and kill_on_drop reaps it.
    let output = tokio::select! {
        output = child.wait_with_output() => output?,
        _ = cancel.cancelled() => {
            tracing::warn!(dest = %dest.display(), "dump cancelled, terminating child process");
            return Err(SnapshotError::Cancelled);
        }
        _ = deadline(timeout) => {
            let secs = timeout.map(|d| d.as_secs()).unwrap_or_default();
            tracing::warn!(dest = %dest.display(), secs, "dump timed out, terminating child process");
            return Err(SnapshotError::TimedOut(secs));
        }
    };

    if !output.status.success() {
        return Err(SnapshotError::NonZeroExit {
            status: output.status,
            stderr: stderr_tail(&output.stderr),
        });
    }

    let size_bytes = match tokio::fs::metadata(dest).await {
        Ok(meta) => meta.len(),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => 0,
        Err(e) => return Err(e.into()),
    };
    if size_bytes == 0 {
        return Err(SnapshotError::EmptyArtifact {
            path: dest.to_path_buf(),
        });
    }

    tracing::info!(dest = %dest.display(), size_bytes, "database dump completed");
    Ok(SnapshotInfo {
        path: dest.to_path_buf(),
        size_bytes,
    })
}

#[cfg(all(test, unix))]
pub(crate) mod test_support {
    use super::*;

    pub fn sh(script: &str) -> ToolCommand {
        ToolCommand::new("sh").args(["-c", script])
    }

    pub fn sh_producer(script: &str) -> PgDumpProducer {
        PgDumpProducer::with_command(sh(script), DumpFormat::Plain, None)
    }
}
