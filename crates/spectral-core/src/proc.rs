//! Subprocess execution with a hard deadline, shared by the sandbox gates
//! and the shell-flavored tool adapters.

use anyhow::{anyhow, Result};
use std::io::Write;
use std::path::Path;
use std::process::{Command, Stdio};
use std::time::{Duration, Instant};
use wait_timeout::ChildExt;

#[derive(Debug, Clone)]
pub struct ExecOutput {
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub timed_out: bool,
    pub duration: Duration,
}

impl ExecOutput {
    pub fn success(&self) -> bool {
        !self.timed_out && self.exit_code == Some(0)
    }

    /// stderr when present, stdout otherwise; for error reporting.
    pub fn detail(&self) -> &str {
        if self.stderr.trim().is_empty() {
            self.stdout.trim()
        } else {
            self.stderr.trim()
        }
    }
}

/// Run a program with the given working directory, a hard deadline, and
/// optional stdin fed as one blob. The child is killed on deadline expiry;
/// the timeout is reported in the output, not raised as an error.
pub fn run_program(
    program: &str,
    args: &[&str],
    cwd: &Path,
    timeout: Duration,
    stdin_data: Option<&str>,
) -> Result<ExecOutput> {
    let started = Instant::now();
    let mut command = Command::new(program);
    command
        .args(args)
        .current_dir(cwd)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    command.stdin(if stdin_data.is_some() {
        Stdio::piped()
    } else {
        Stdio::null()
    });

    let mut child = command.spawn().map_err(|err| {
        anyhow!("failed to spawn '{program}' in '{}': {err}", cwd.display())
    })?;
    if let Some(data) = stdin_data {
        if let Some(mut stdin) = child.stdin.take() {
            // A closed pipe on early exit is fine; callers read the exit
            // code, not this write.
            let _ = stdin.write_all(data.as_bytes());
        }
    }

    let status = child.wait_timeout(timeout)?;
    if status.is_none() {
        child.kill()?;
        let output = child.wait_with_output()?;
        return Ok(ExecOutput {
            exit_code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            timed_out: true,
            duration: started.elapsed(),
        });
    }

    let output = child.wait_with_output()?;
    Ok(ExecOutput {
        exit_code: output.status.code(),
        stdout: String::from_utf8_lossy(&output.stdout).to_string(),
        stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        timed_out: false,
        duration: started.elapsed(),
    })
}
