use anyhow::Result;
use spectral_core::proc::{run_program, ExecOutput};
use std::path::Path;
use std::time::Duration;

/// Seam for the shell-flavored adapter families; scripted runners stand in
/// during tests.
pub trait ShellRunner: Send + Sync {
    fn run(&self, cmd: &str, cwd: &Path, timeout: Duration) -> Result<ExecOutput>;
}

/// Runs a command line through the host's shell with the process-execution
/// deadline machinery from `spectral_core::proc`.
#[derive(Debug, Default)]
pub struct PlatformShellRunner;

#[cfg(target_os = "windows")]
const SHELL: (&str, &str) = ("cmd", "/C");
#[cfg(not(target_os = "windows"))]
const SHELL: (&str, &str) = ("sh", "-c");

impl ShellRunner for PlatformShellRunner {
    fn run(&self, cmd: &str, cwd: &Path, timeout: Duration) -> Result<ExecOutput> {
        let (program, flag) = SHELL;
        let cwd = if cwd.exists() { cwd } else { Path::new(".") };
        run_program(program, &[flag, cmd], cwd, timeout, None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn runner_executes_command() {
        let runner = PlatformShellRunner;
        let out = runner
            .run("echo spectral", Path::new("."), Duration::from_secs(5))
            .expect("run command");
        assert!(!out.timed_out);
        assert!(out.stdout.to_lowercase().contains("spectral"));
    }

    #[test]
    fn missing_cwd_falls_back_to_current_dir() {
        let runner = PlatformShellRunner;
        let out = runner
            .run(
                "echo ok",
                Path::new("/definitely/not/a/real/dir"),
                Duration::from_secs(5),
            )
            .expect("run command");
        assert!(out.success());
    }

    #[cfg(not(target_os = "windows"))]
    #[test]
    fn runner_times_out_and_kills() {
        let runner = PlatformShellRunner;
        let out = runner
            .run("sleep 5", Path::new("."), Duration::from_millis(100))
            .expect("run command");
        assert!(out.timed_out);
        assert!(!out.success());
    }
}
