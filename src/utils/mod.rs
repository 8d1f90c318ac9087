pub mod shutdown;

use std::path::{Path, PathBuf};
use which::which;

/// Captured stderr is cut to its tail so a chatty tool cannot flood the history table.
const MAX_STDERR_CHARS: usize = 4000;

/// A fully resolved external tool invocation (`pg_dump`, `psql`, `docker exec ...`).
#[derive(Clone, PartialEq, Eq)]
pub struct ToolCommand {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub envs: Vec<(String, String)>,
}

// Env values are credentials; only their names are printed.
impl std::fmt::Debug for ToolCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let env_names: Vec<&str> = self.envs.iter().map(|(k, _)| k.as_str()).collect();
        f.debug_struct("ToolCommand")
            .field("program", &self.program)
            .field("args", &self.args)
            .field("envs", &env_names)
            .finish()
    }
}

impl ToolCommand {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            envs: Vec::new(),
        }
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.envs.push((key.into(), value.into()));
        self
    }

    pub fn program_name(&self) -> String {
        self.program.display().to_string()
    }

    /// A `tokio` command with args and env applied; stdio is left to the caller.
    pub fn build(&self) -> tokio::process::Command {
        let mut cmd = tokio::process::Command::new(&self.program);
        cmd.args(&self.args)
            .envs(self.envs.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .kill_on_drop(true);
        cmd
    }
}

/// Finds an executable in PATH unless an explicit location is configured.
pub fn find_executable(name: &str, explicit: Option<&Path>) -> Result<PathBuf, String> {
    if let Some(path) = explicit {
        return Ok(path.to_path_buf());
    }
    which(name).map_err(|e| {
        format!(
            "{} executable not found in PATH ({}). Please ensure PostgreSQL client tools are installed and in your PATH.",
            name, e
        )
    })
}

pub fn stderr_tail(raw: &[u8]) -> String {
    let text = String::from_utf8_lossy(raw);
    let trimmed = text.trim();
    let count = trimmed.chars().count();
    if count <= MAX_STDERR_CHARS {
        return trimmed.to_string();
    }
    let tail: String = trimmed.chars().skip(count - MAX_STDERR_CHARS).collect();
    format!("...{}", tail)
}

/// Sleeps for `limit`, or forever when there is no limit.
pub async fn deadline(limit: Option<std::time::Duration>) {
    match limit {
        Some(limit) => tokio::time::sleep(limit).await,
        None => std::future::pending::<()>().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_explicit_executable_skips_path_lookup() {
        let path = find_executable("pg_dump", Some(Path::new("/opt/pg/bin/pg_dump"))).unwrap();
        assert_eq!(path, PathBuf::from("/opt/pg/bin/pg_dump"));
    }

    #[test]
    fn test_missing_executable_reports_name() {
        let err = find_executable("definitely-not-a-real-tool-xyz", None).unwrap_err();
        assert!(err.contains("definitely-not-a-real-tool-xyz"));
    }

    #[test]
    fn test_stderr_tail_truncates_from_front() {
        let long = "x".repeat(MAX_STDERR_CHARS + 10) + "connection refused";
        let tail = stderr_tail(long.as_bytes());
        assert!(tail.starts_with("..."));
        assert!(tail.ends_with("connection refused"));
        assert_eq!(stderr_tail(b"  short\n"), "short");
    }

    #[test]
    fn test_debug_hides_env_values() {
        let cmd = ToolCommand::new("pg_dump").args(["--dbname", "examdb"]).env("PGPASSWORD", "hunter2");
        let rendered = format!("{:?}", cmd);
        assert!(rendered.contains("PGPASSWORD"));
        assert!(!rendered.contains("hunter2"));
    }
}
