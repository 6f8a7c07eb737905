use crate::params::{optional_u64, require_str};
use crate::shell::ShellRunner;
use serde_json::json;
use spectral_core::proc::ExecOutput;
use spectral_core::ActionResult;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

const DEFAULT_TIMEOUT_SECONDS: u64 = 30;

fn timeout_from(params: &serde_json::Value) -> Duration {
    Duration::from_secs(optional_u64(params, "timeout_seconds").unwrap_or(DEFAULT_TIMEOUT_SECONDS))
}

fn run_to_result(action: &str, message: &str, run: anyhow::Result<ExecOutput>) -> ActionResult {
    match run {
        Ok(out) if out.timed_out => {
            ActionResult::fail(action, format!("{message} timed out"))
        }
        Ok(out) if out.success() => {
            ActionResult::ok(action, message.to_string()).with_data(json!({
                "stdout": out.stdout,
                "stderr": out.stderr,
                "exit_code": out.exit_code,
            }))
        }
        Ok(out) => ActionResult::fail(
            action,
            format!(
                "{message} failed (exit {:?}): {}",
                out.exit_code,
                out.detail()
            ),
        ),
        Err(err) => ActionResult::fail(action, err.to_string()),
    }
}

/// PowerShell-flavored shell family. Commands are wrapped for `pwsh` when
/// available; system-information helpers fall back to portable commands so
/// the family stays usable off Windows.
pub struct PowershellActions {
    runner: Arc<dyn ShellRunner>,
}

impl PowershellActions {
    pub fn new(runner: Arc<dyn ShellRunner>) -> Self {
        Self { runner }
    }

    fn powershell_wrap(command: &str) -> String {
        if cfg!(target_os = "windows") {
            format!("powershell -NoLogo -NoProfile -Command \"{command}\"")
        } else {
            format!("pwsh -NoLogo -NoProfile -Command \"{command}\"")
        }
    }

    pub fn execute(&self, params: &serde_json::Value) -> ActionResult {
        const ACTION: &str = "powershell_execute";
        let command = match require_str(params, &["command", "script"]) {
            Ok(c) => c,
            Err(err) => return ActionResult::fail(ACTION, err),
        };
        let wrapped = Self::powershell_wrap(&command);
        let run = self
            .runner
            .run(&wrapped, Path::new("."), timeout_from(params));
        let result = run_to_result(ACTION, &format!("powershell: {command}"), run);
        if result.success {
            return result;
        }
        // pwsh missing is common off Windows; surface it as a permanent
        // condition instead of a generic spawn failure.
        let error = result.error.clone().unwrap_or_default();
        if error.contains("failed to spawn") || error.contains("not found") {
            return ActionResult::fail(ACTION, "powershell is not installed on this host");
        }
        result
    }

    pub fn get_system_info(&self, params: &serde_json::Value) -> ActionResult {
        const ACTION: &str = "powershell_get_system_info";
        let command = if cfg!(target_os = "windows") {
            "systeminfo".to_string()
        } else {
            "uname -a".to_string()
        };
        let run = self.runner.run(&command, Path::new("."), timeout_from(params));
        match run_to_result(ACTION, "system info", run) {
            mut result if result.success => {
                if let Some(data) = result.data.as_mut() {
                    data["os"] = json!(std::env::consts::OS);
                    data["arch"] = json!(std::env::consts::ARCH);
                }
                result
            }
            result => result,
        }
    }

    pub fn get_processes(&self, params: &serde_json::Value) -> ActionResult {
        const ACTION: &str = "powershell_get_processes";
        let command = if cfg!(target_os = "windows") {
            "tasklist"
        } else {
            "ps -eo pid,comm"
        };
        let run = self.runner.run(command, Path::new("."), timeout_from(params));
        run_to_result(ACTION, "process list", run)
    }

    pub fn get_services(&self, params: &serde_json::Value) -> ActionResult {
        const ACTION: &str = "powershell_get_services";
        let command = if cfg!(target_os = "windows") {
            "sc query state= all"
        } else {
            "systemctl list-units --type=service --no-pager --no-legend 2>/dev/null || service --status-all"
        };
        let run = self.runner.run(command, Path::new("."), timeout_from(params));
        run_to_result(ACTION, "service list", run)
    }
}

/// Plain subprocess family: arbitrary commands and application launching.
pub struct SubprocessActions {
    runner: Arc<dyn ShellRunner>,
}

impl SubprocessActions {
    pub fn new(runner: Arc<dyn ShellRunner>) -> Self {
        Self { runner }
    }

    pub fn execute(&self, params: &serde_json::Value) -> ActionResult {
        const ACTION: &str = "subprocess_execute";
        let command = match require_str(params, &["command"]) {
            Ok(c) => c,
            Err(err) => return ActionResult::fail(ACTION, err),
        };
        let run = self.runner.run(&command, Path::new("."), timeout_from(params));
        run_to_result(ACTION, &format!("command: {command}"), run)
    }

    pub fn open_application(&self, params: &serde_json::Value) -> ActionResult {
        const ACTION: &str = "subprocess_open_application";
        let app = match require_str(params, &["application_path", "application", "app"]) {
            Ok(a) => a,
            Err(err) => return ActionResult::fail(ACTION, err),
        };
        match std::process::Command::new(&app)
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null())
            .stdin(std::process::Stdio::null())
            .spawn()
        {
            Ok(child) => ActionResult::ok(ACTION, format!("Launched {app}"))
                .with_data(json!({"application": app, "pid": child.id()})),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                ActionResult::fail(ACTION, format!("application not found: {app}"))
            }
            Err(err) => ActionResult::fail(ACTION, err.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shell::PlatformShellRunner;

    fn subprocess() -> SubprocessActions {
        SubprocessActions::new(Arc::new(PlatformShellRunner))
    }

    #[test]
    fn subprocess_execute_captures_stdout() {
        let result = subprocess().execute(&json!({"command": "echo spectral-tools"}));
        assert!(result.success, "{:?}", result.error);
        assert!(result.data.expect("data")["stdout"]
            .as_str()
            .expect("stdout")
            .contains("spectral-tools"));
    }

    #[test]
    fn open_missing_application_is_not_found() {
        let result = subprocess()
            .open_application(&json!({"application_path": "definitely-not-a-real-binary-xyz"}));
        assert!(!result.success);
        assert!(result.error.expect("error").contains("not found"));
    }

    #[test]
    fn system_info_reports_host() {
        let ps = PowershellActions::new(Arc::new(PlatformShellRunner));
        let result = ps.get_system_info(&json!({}));
        assert!(result.success, "{:?}", result.error);
        assert_eq!(result.data.expect("data")["os"], std::env::consts::OS);
    }
}
