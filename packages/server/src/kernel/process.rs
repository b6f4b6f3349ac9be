//! External tool runner shared by the stage executors.
//!
//! Tools are spawned directly (never through a shell) with piped output and
//! `kill_on_drop`, so a stage future that is dropped by the coordinator's
//! deadline also takes its child process down.

use std::ffi::OsStr;
use std::path::Path;
use std::process::Stdio;
use std::time::{Duration, Instant};

use tokio::process::Command;
use tracing::{debug, warn};

use super::traits::StageFailure;

#[derive(Debug, Clone)]
pub struct ToolOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
    pub duration_ms: u64,
}

impl ToolOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// Trailing stderr lines, for error messages that stay readable.
    pub fn stderr_tail(&self, lines: usize) -> String {
        let all: Vec<&str> = self.stderr.lines().filter(|l| !l.trim().is_empty()).collect();
        let start = all.len().saturating_sub(lines);
        all[start..].join("\n")
    }
}

/// Run `program` with `args` in `work_dir`.
///
/// A missing binary is an internal error. Hitting `timeout` kills the child
/// and reports a transient failure.
pub async fn run_tool<I, S>(
    program: &str,
    args: I,
    work_dir: &Path,
    timeout: Duration,
) -> Result<ToolOutput, StageFailure>
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    let start = Instant::now();

    let mut cmd = Command::new(program);
    cmd.args(args)
        .current_dir(work_dir)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    debug!(program, work_dir = %work_dir.display(), "spawning tool");

    let child = cmd
        .spawn()
        .map_err(|e| StageFailure::internal(format!("failed to spawn {program}: {e}")))?;

    let output = match tokio::time::timeout(timeout, child.wait_with_output()).await {
        Ok(result) => {
            result.map_err(|e| StageFailure::internal(format!("{program} wait failed: {e}")))?
        }
        Err(_) => {
            warn!(program, timeout_secs = timeout.as_secs(), "tool timed out");
            return Err(StageFailure::transient(format!(
                "{program} timed out after {}s",
                timeout.as_secs()
            )));
        }
    };

    let duration_ms = u64::try_from(start.elapsed().as_millis()).unwrap_or(u64::MAX);
    let exit_code = output.status.code().unwrap_or(-1);

    debug!(program, exit_code, duration_ms, "tool finished");

    Ok(ToolOutput {
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        exit_code,
        duration_ms,
    })
}
