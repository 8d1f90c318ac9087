// backupd/src/restore/db_restore.rs
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::backup::db_dump::password_env;
use crate::config::{DbConnection, DumpConfig, DumpFormat};
use crate::errors::RestoreError;
use crate::utils::{ToolCommand, deadline, find_executable, stderr_tail};

/// Loads a previously downloaded artifact back into the database.
#[async_trait]
pub trait RestoreExecutor: Send + Sync {
    async fn restore(
        &self,
        artifact: &Path,
        format: DumpFormat,
        cancel: &CancellationToken,
    ) -> Result<(), RestoreError>;
}

fn client_args(conn: &DbConnection, format: DumpFormat, with_host: bool) -> Vec<String> {
    let mut args = Vec::new();
    match format {
        // Plain SQL: stop at the first failing statement.
        DumpFormat::Plain => args.extend(
            ["-X", "-q", "-v", "ON_ERROR_STOP=1"].map(String::from),
        ),
        DumpFormat::Custom => args.extend(
            ["--clean", "--if-exists", "--no-owner"].map(String::from),
        ),
    }
    args.push("--no-password".to_string());
    if with_host {
        args.extend([
            "--host".to_string(),
            conn.host.clone(),
            "--port".to_string(),
            conn.port.to_string(),
        ]);
    }
    args.extend([
        "--username".to_string(),
        conn.user.clone(),
        "--dbname".to_string(),
        conn.database.clone(),
    ]);
    args
}

fn restore_tool(format: DumpFormat) -> &'static str {
    match format {
        DumpFormat::Plain => "psql",
        DumpFormat::Custom => "pg_restore",
    }
}

/// `psql` or `pg_restore` on this host. The artifact is fed on stdin.
pub fn local_restore_command(program: PathBuf, conn: &DbConnection, format: DumpFormat) -> ToolCommand {
    password_env(ToolCommand::new(program).args(client_args(conn, format, true)), conn)
}

/// Same tool run inside the container with `docker exec -i` so stdin is attached.
pub fn docker_restore_command(
    docker: PathBuf,
    container: &str,
    conn: &DbConnection,
    format: DumpFormat,
) -> ToolCommand {
    let mut cmd = ToolCommand::new(docker).args(["exec", "-i"]);
    if conn.password.is_some() {
        cmd = cmd.args(["-e", "PGPASSWORD"]);
    }
    let cmd = cmd
        .args([container, restore_tool(format)])
        .args(client_args(conn, format, false));
    password_env(cmd, conn)
}

enum CommandSource {
    Config(DumpConfig),
    Fixed(ToolCommand),
}

pub struct PgRestoreExecutor {
    source: CommandSource,
    timeout: Option<Duration>,
}

impl PgRestoreExecutor {
    pub fn new(config: DumpConfig) -> Self {
        let timeout = config.timeout;
        Self {
            source: CommandSource::Config(config),
            timeout,
        }
    }

    pub fn with_command(command: ToolCommand, timeout: Option<Duration>) -> Self {
        Self {
            source: CommandSource::Fixed(command),
            timeout,
        }
    }

    fn resolve(&self, format: DumpFormat) -> Result<ToolCommand, RestoreError> {
        let config = match &self.source {
            CommandSource::Fixed(command) => return Ok(command.clone()),
            CommandSource::Config(config) => config,
        };
        let unavailable = |tool: &str| {
            let tool = tool.to_string();
            move |reason: String| RestoreError::ToolUnavailable { tool, reason }
        };
        match &config.container {
            Some(container) => {
                let docker = find_executable("docker", None).map_err(unavailable("docker"))?;
                Ok(docker_restore_command(docker, container, &config.connection, format))
            }
            None => {
                let tool = restore_tool(format);
                // A configured pg_dump path points at the client tools directory.
                let explicit = config
                    .pg_dump_path
                    .as_deref()
                    .and_then(Path::parent)
                    .map(|dir| dir.join(tool));
                let program =
                    find_executable(tool, explicit.as_deref()).map_err(unavailable(tool))?;
                Ok(local_restore_command(program, &config.connection, format))
            }
        }
    }
}

#[async_trait]
impl RestoreExecutor for PgRestoreExecutor {
    async fn restore(
        &self,
        artifact: &Path,
        format: DumpFormat,
        cancel: &CancellationToken,
    ) -> Result<(), RestoreError> {
        let command = self.resolve(format)?;
        tracing::info!(
            program = %command.program.display(),
            artifact = %artifact.display(),
            "starting database restore"
        );

        let input = tokio::fs::File::open(artifact).await?.into_std().await;
        let mut cmd = command.build();
        cmd.stdin(Stdio::from(input))
            .stdout(Stdio::null())
            .stderr(Stdio::piped());

        let child = cmd.spawn().map_err(|e| RestoreError::ToolUnavailable {
            tool: command.program_name(),
            reason: e.to_string(),
        })?;

        let output = tokio::select! {
            output = child.wait_with_output() => output?,
            _ = cancel.cancelled() => {
                tracing::warn!(artifact = %artifact.display(), "restore cancelled, terminating child process");
                return Err(RestoreError::Cancelled);
            }
            _ = deadline(self.timeout) => {
                let secs = self.timeout.map(|d| d.as_secs()).unwrap_or_default();
                tracing::warn!(artifact = %artifact.display(), secs, "restore timed out, terminating child process");
                return Err(RestoreError::TimedOut(secs));
            }
        };

        if !output.status.success() {
            return Err(RestoreError::NonZeroExit {
                status: output.status,
                stderr: stderr_tail(&output.stderr),
            });
        }
        tracing::info!(artifact = %artifact.display(), "database restore completed");
        Ok(())
    }
}

#[cfg(all(test, unix))]
pub(crate) mod test_support {
    use super::*;

    pub fn sh_restorer(script: &str) -> PgRestoreExecutor {
        PgRestoreExecutor::with_command(ToolCommand::new("sh").args(["-c", script]), None)
    }
}
