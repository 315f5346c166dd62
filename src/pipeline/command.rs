//! Thin wrapper over external tool invocations.

use std::ffi::OsStr;
use std::fmt;
use std::process::Stdio;
use tokio::process::Command;
use tracing::debug;

/// How an external tool failed.
#[derive(Debug)]
pub enum ToolError {
    /// The binary could not be started at all
    Spawn { program: String, source: std::io::Error },
    /// The tool ran and exited unsuccessfully
    Failed { program: String, status: String, stderr: String },
}

impl fmt::Display for ToolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ToolError::Spawn { program, source } => write!(f, "failed to start {}: {}", program, source),
            ToolError::Failed { program, status, stderr } => {
                write!(f, "{} exited with {}: {}", program, status, stderr)
            }
        }
    }
}

impl std::error::Error for ToolError {}

/// Longest stderr tail kept in an error.
const STDERR_TAIL: usize = 512;

/// Run a tool to completion and return its stdout.
///
/// The child is killed if the returned future is dropped, so a cancelled job
/// never leaves a download or encode running.
pub async fn run_tool<I, S>(program: &str, args: I) -> Result<Vec<u8>, ToolError>
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    let args: Vec<_> = args.into_iter().map(|arg| arg.as_ref().to_os_string()).collect();
    debug!(program, args = ?args, "Running external tool");

    let output = Command::new(program)
        .args(&args)
        .stdin(Stdio::null())
        .kill_on_drop(true)
        .output()
        .await
        .map_err(|source| ToolError::Spawn {
            program: program.to_string(),
            source,
        })?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        let stderr = stderr.trim();
        let tail_start = stderr
            .char_indices()
            .rev()
            .nth(STDERR_TAIL)
            .map_or(0, |(index, _)| index);
        return Err(ToolError::Failed {
            program: program.to_string(),
            status: output.status.to_string(),
            stderr: stderr[tail_start..].to_string(),
        });
    }

    Ok(output.stdout)
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_returns_stdout() {
        let out = run_tool("sh", ["-c", "printf hello"]).await.unwrap();
        assert_eq!(out, b"hello");
    }

    #[tokio::test]
    async fn test_reports_failure_with_stderr() {
        let err = run_tool("sh", ["-c", "echo boom >&2; exit 3"]).await.unwrap_err();
        match err {
            ToolError::Failed { stderr, .. } => assert_eq!(stderr, "boom"),
            other => panic!("unexpected error: {}", other),
        }
    }

    #[tokio::test]
    async fn test_reports_missing_binary() {
        let err = run_tool("definitely-not-a-real-binary-7f3a", ["--version"]).await.unwrap_err();
        assert!(matches!(err, ToolError::Spawn { .. }));
    }
}
