// pgbackup/src/backup/db_dump.rs
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::process::Command;
use tracing::{debug, info};
use which::which;

use crate::config::ConnectionParams;
use crate::errors::DumpError;

/// Produces a full dump of one database into a single file.
///
/// The pipeline blocks on `dump` and checks the output afterwards, so an
/// implementation only has to report how the external mechanism exited.
#[async_trait]
pub trait DumpProducer: Send + Sync {
    async fn dump(&self, params: &ConnectionParams, output: &Path) -> Result<(), DumpError>;
}

/// Runs the `pg_dump` client. The password travels in `PGPASSWORD`, never on
/// the command line.
#[derive(Debug, Clone)]
pub struct PgDump {
    executable: PathBuf,
}

impl PgDump {
    pub fn new(executable: impl Into<PathBuf>) -> Self {
        PgDump {
            executable: executable.into(),
        }
    }

    /// Looks `pg_dump` up in PATH.
    pub fn locate() -> Result<Self, DumpError> {
        let executable = which("pg_dump").map_err(|e| {
            DumpError::ExecutableNotFound(format!(
                "pg_dump not found in PATH ({}). Please ensure PostgreSQL client tools are installed.",
                e
            ))
        })?;
        info!(path = %executable.display(), "Found pg_dump executable");
        Ok(PgDump::new(executable))
    }

    fn command(&self, params: &ConnectionParams, output: &Path) -> Command {
        let mut cmd = Command::new(&self.executable);
        cmd.arg("-h")
            .arg(&params.host)
            .arg("-p")
            .arg(params.port.to_string())
            .arg("-U")
            .arg(&params.user)
            .arg("-d")
            .arg(&params.database)
            .arg("-f")
            .arg(output)
            .arg("--no-password")
            .env("PGPASSWORD", &params.password)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            // A timed-out dump is dropped by the pipeline; take the child with it.
            .kill_on_drop(true);
        cmd
    }
}

#[async_trait]
impl DumpProducer for PgDump {
    async fn dump(&self, params: &ConnectionParams, output: &Path) -> Result<(), DumpError> {
        info!(
            host = %params.host,
            port = params.port,
            database = %params.database,
            output = %output.display(),
            "Dumping database with pg_dump"
        );

        let result = self
            .command(params, output)
            .output()
            .await
            .map_err(DumpError::Spawn)?;

        let stderr = String::from_utf8_lossy(&result.stderr).trim().to_string();
        if !result.status.success() {
            return Err(DumpError::Exit {
                status: result.status.to_string(),
                stderr,
            });
        }
        if !stderr.is_empty() {
            debug!(stderr = %stderr, "pg_dump diagnostics");
        }
        Ok(())
    }
}

/// Refuses a dump that is missing or empty even when the tool exited 0;
/// pg_dump can do that on auth or permission problems.
pub async fn verify_dump_output(output: &Path) -> Result<u64, DumpError> {
    match tokio::fs::metadata(output).await {
        Ok(meta) if meta.is_file() && meta.len() > 0 => Ok(meta.len()),
        Ok(meta) if meta.is_file() => Err(DumpError::EmptyOutput(output.to_path_buf())),
        Ok(_) => Err(DumpError::MissingOutput(output.to_path_buf())),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            Err(DumpError::MissingOutput(output.to_path_buf()))
        }
        Err(e) => Err(DumpError::Output(e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params() -> ConnectionParams {
        ConnectionParams {
            host: "db.internal".to_string(),
            port: 6432,
            user: "backup".to_string(),
            password: "hunter2".to_string(),
            database: "app".to_string(),
        }
    }

    #[test]
    fn test_pg_dump_command_keeps_password_out_of_args() {
        let cmd = PgDump::new("/usr/bin/pg_dump").command(&params(), Path::new("/tmp/out.sql"));
        let std_cmd = cmd.as_std();

        let args: Vec<String> = std_cmd
            .get_args()
            .map(|a| a.to_string_lossy().into_owned())
            .collect();
        assert_eq!(
            args,
            [
                "-h", "db.internal", "-p", "6432", "-U", "backup", "-d", "app", "-f",
                "/tmp/out.sql", "--no-password"
            ]
        );
        assert!(!args.iter().any(|a| a.contains("hunter2")));

        let password = std_cmd
            .get_envs()
            .find(|(k, _)| *k == "PGPASSWORD")
            .and_then(|(_, v)| v);
        assert_eq!(password.map(|v| v.to_string_lossy().into_owned()), Some("hunter2".into()));
    }

    #[tokio::test]
    async fn test_verify_dump_output() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let missing = dir.path().join("missing.sql");
        assert!(matches!(
            verify_dump_output(&missing).await,
            Err(DumpError::MissingOutput(_))
        ));

        let empty = dir.path().join("empty.sql");
        std::fs::write(&empty, b"")?;
        assert!(matches!(
            verify_dump_output(&empty).await,
            Err(DumpError::EmptyOutput(_))
        ));

        let full = dir.path().join("full.sql");
        std::fs::write(&full, b"CREATE TABLE t ();\n")?;
        assert_eq!(verify_dump_output(&full).await?, 19);
        Ok(())
    }

    #[tokio::test]
    async fn test_missing_executable_is_a_spawn_error() {
        let dump = PgDump::new("/nonexistent/pg_dump");
        let result = dump.dump(&params(), Path::new("/tmp/never.sql")).await;
        assert!(matches!(result, Err(DumpError::Spawn(_))));
    }
}
