mod detect;

pub use detect::{detect_gui_mainloop, is_gui_program};
pub use spectral_core::proc::{run_program, ExecOutput};

use anyhow::Result;
use chrono::Utc;
use spectral_core::{GatesPassed, SandboxConfig, SandboxResult, SandboxStatus};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use uuid::Uuid;

/// Per-file test driver used when pytest is not installed: runs every
/// `test_*` function in every `tests/test_*.py` and reports pass/fail
/// counts in a pytest-like final line.
const FALLBACK_TEST_DRIVER: &str = r#"
import pathlib, runpy, sys, traceback
passed = failed = 0
for path in sorted(pathlib.Path("tests").glob("test_*.py")):
    module = runpy.run_path(str(path))
    for name, fn in sorted(module.items()):
        if name.startswith("test_") and callable(fn):
            try:
                fn()
                passed += 1
                print(f"{path}::{name} PASSED")
            except Exception:
                failed += 1
                traceback.print_exc()
                print(f"{path}::{name} FAILED")
print(f"{passed} passed, {failed} failed")
sys.exit(1 if failed else 0)
"#;

/// Isolated run directories and the three verification gates for generated
/// code. Each run owns `<root>/<run-id>/{code,tests,logs}` exclusively;
/// failed runs are cleaned up unless configured otherwise.
pub struct SandboxManager {
    root: PathBuf,
    cfg: SandboxConfig,
}

impl SandboxManager {
    pub fn new(cfg: SandboxConfig) -> Self {
        Self {
            root: spectral_core::sandbox_runs_dir(),
            cfg,
        }
    }

    pub fn with_root(root: PathBuf, cfg: SandboxConfig) -> Self {
        Self { root, cfg }
    }

    pub fn create_run(&self, run_id: Option<&str>) -> Result<String> {
        let run_id = run_id
            .map(str::to_string)
            .unwrap_or_else(|| format!("run-{}", Uuid::now_v7()));
        let path = self.run_path(&run_id);
        for sub in ["code", "tests", "logs"] {
            fs::create_dir_all(path.join(sub))?;
        }
        Ok(run_id)
    }

    pub fn run_path(&self, run_id: &str) -> PathBuf {
        self.root.join(run_id)
    }

    pub fn write_code(&self, run_id: &str, filename: &str, code: &str) -> Result<PathBuf> {
        let path = self.run_path(run_id).join("code").join(filename);
        fs::write(&path, code)?;
        Ok(path)
    }

    pub fn write_test(&self, run_id: &str, filename: &str, test_code: &str) -> Result<PathBuf> {
        let path = self.run_path(run_id).join("tests").join(filename);
        fs::write(&path, test_code)?;
        Ok(path)
    }

    /// Gate 1: byte-compile the program. Fails fast on non-zero exit.
    pub fn check_syntax(&self, run_id: &str, code_file: &Path) -> Result<(bool, Option<String>)> {
        let code_file = code_file.to_string_lossy();
        let out = run_program(
            &self.cfg.python_bin,
            &["-m", "py_compile", code_file.as_ref()],
            &self.run_path(run_id),
            Duration::from_secs(self.cfg.syntax_timeout_seconds),
            None,
        )?;
        self.append_log(run_id, "syntax.log", &out)?;
        if out.timed_out {
            return Ok((false, Some("syntax check timed out".to_string())));
        }
        if out.success() {
            return Ok((true, None));
        }
        let detail = if out.stderr.trim().is_empty() {
            out.stdout
        } else {
            out.stderr
        };
        Ok((false, Some(detail.trim().to_string())))
    }

    /// Gate 2: run the test harness over `tests/` and extract a summary.
    /// Skipped entirely for GUI programs by the pipeline. Hosts without
    /// pytest fall back to a minimal driver that calls each `test_*`
    /// function directly.
    pub fn run_tests(&self, run_id: &str) -> Result<(bool, String, bool)> {
        let timeout = Duration::from_secs(self.cfg.test_timeout_seconds);
        let out = run_program(
            &self.cfg.python_bin,
            &["-m", "pytest", "tests", "-q"],
            &self.run_path(run_id),
            timeout,
            None,
        )?;
        let pytest_missing = out.stderr.contains("No module named pytest")
            || out.stdout.contains("No module named pytest");
        let out = if pytest_missing {
            run_program(
                &self.cfg.python_bin,
                &["-c", FALLBACK_TEST_DRIVER],
                &self.run_path(run_id),
                timeout,
                None,
            )?
        } else {
            out
        };
        self.append_log(run_id, "tests.log", &out)?;
        let summary = parse_pytest_output(&out.stdout, &out.stderr);
        Ok((out.success(), summary, out.timed_out))
    }

    /// Gate 3: run the program itself (CLI programs only), optionally
    /// feeding stdin as one blob.
    pub fn run_smoke(
        &self,
        run_id: &str,
        code_file: &Path,
        stdin_data: Option<&str>,
    ) -> Result<ExecOutput> {
        let code_file = code_file.to_string_lossy();
        let out = run_program(
            &self.cfg.python_bin,
            &[code_file.as_ref()],
            &self.run_path(run_id),
            Duration::from_secs(self.cfg.smoke_timeout_seconds),
            stdin_data,
        )?;
        self.append_log(run_id, "smoke.log", &out)?;
        Ok(out)
    }

    /// Full pipeline: write the program, gate it, and return a structured
    /// result. GUI programs skip tests and smoke; GUI programs that would
    /// block on a top-level mainloop are rejected before any smoke
    /// execution.
    pub fn execute_pipeline(
        &self,
        code: &str,
        filename: &str,
        stdin_data: Option<&str>,
    ) -> Result<SandboxResult> {
        let started = Instant::now();
        let run_id = self.create_run(None)?;
        let code_path = self.write_code(&run_id, filename, code)?;
        let gui = is_gui_program(code);
        let mut result = SandboxResult {
            run_id: run_id.clone(),
            status: SandboxStatus::Created,
            code_path: Some(code_path.clone()),
            test_paths: Vec::new(),
            stdout: String::new(),
            stderr: String::new(),
            exit_code: None,
            pytest_summary: None,
            error_message: None,
            gates_passed: GatesPassed::default(),
            duration_seconds: 0.0,
        };

        // Gate 1: syntax.
        let (syntax_ok, syntax_err) = self.check_syntax(&run_id, &code_path)?;
        result.gates_passed.syntax = syntax_ok;
        if !syntax_ok {
            let timed_out = syntax_err.as_deref() == Some("syntax check timed out");
            result.status = if timed_out {
                SandboxStatus::Timeout
            } else {
                SandboxStatus::SyntaxError
            };
            result.error_message = syntax_err;
            return self.finish(result, started);
        }
        result.status = SandboxStatus::SyntaxChecked;

        // Gate 2: tests (skipped for GUI programs).
        if gui {
            result.gates_passed.tests = true;
            result.status = SandboxStatus::Tested;
        } else {
            let test_path = self.write_test(
                &run_id,
                &format!("test_{filename}"),
                &generate_basic_test(filename),
            )?;
            result.test_paths.push(test_path);
            let (tests_ok, summary, timed_out) = self.run_tests(&run_id)?;
            result.pytest_summary = Some(summary.clone());
            result.gates_passed.tests = tests_ok;
            if !tests_ok {
                result.status = if timed_out {
                    SandboxStatus::Timeout
                } else {
                    SandboxStatus::TestFailure
                };
                result.error_message = Some(summary);
                return self.finish(result, started);
            }
            result.status = SandboxStatus::Tested;
        }

        // Gate 3: smoke (CLI only). A GUI program with a blocking mainloop
        // at top level is rejected here without executing anything.
        if gui {
            if let Some(call) = detect_gui_mainloop(code) {
                result.status = SandboxStatus::Error;
                result.error_message = Some(format!(
                    "GUI program invokes blocking {call} at top level; refusing to execute"
                ));
                return self.finish(result, started);
            }
            // Windowed programs cannot be smoke-tested headlessly.
            result.gates_passed.smoke = true;
        } else {
            let out = self.run_smoke(&run_id, &code_path, stdin_data)?;
            result.stdout = out.stdout.clone();
            result.stderr = out.stderr.clone();
            result.exit_code = out.exit_code;
            result.gates_passed.smoke = out.success();
            if !out.success() {
                result.status = if out.timed_out {
                    SandboxStatus::Timeout
                } else {
                    SandboxStatus::Error
                };
                result.error_message = Some(if out.timed_out {
                    "smoke test timed out".to_string()
                } else {
                    format!(
                        "smoke test failed (exit {:?}): {}",
                        out.exit_code,
                        out.stderr.trim()
                    )
                });
                return self.finish(result, started);
            }
        }

        result.status = SandboxStatus::Success;
        self.finish(result, started)
    }

    fn finish(&self, mut result: SandboxResult, started: Instant) -> Result<SandboxResult> {
        result.duration_seconds = started.elapsed().as_secs_f64();
        self.save_run_metadata(&result.run_id, &result)?;
        if result.status.is_terminal_failure() && !self.cfg.keep_failed_runs {
            self.cleanup_run(&result.run_id)?;
        }
        Ok(result)
    }

    pub fn save_run_metadata(&self, run_id: &str, result: &SandboxResult) -> Result<()> {
        let path = self.run_path(run_id).join("run_metadata.json");
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let metadata = serde_json::json!({
            "run_id": result.run_id,
            "status": result.status,
            "gates_passed": result.gates_passed,
            "exit_code": result.exit_code,
            "duration_seconds": result.duration_seconds,
            "completed_at": Utc::now().to_rfc3339(),
        });
        fs::write(path, serde_json::to_vec_pretty(&metadata)?)?;
        Ok(())
    }

    pub fn cleanup_run(&self, run_id: &str) -> Result<()> {
        let path = self.run_path(run_id);
        if path.exists() {
            fs::remove_dir_all(path)?;
        }
        Ok(())
    }

    fn append_log(&self, run_id: &str, name: &str, out: &ExecOutput) -> Result<()> {
        let dir = self.run_path(run_id).join("logs");
        fs::create_dir_all(&dir)?;
        let body = format!(
            "exit={:?} timed_out={}\n--- stdout ---\n{}\n--- stderr ---\n{}\n",
            out.exit_code, out.timed_out, out.stdout, out.stderr
        );
        fs::write(dir.join(name), body)?;
        Ok(())
    }
}

/// Minimal auto-generated test: the program must import and byte-compile.
pub fn generate_basic_test(filename: &str) -> String {
    let module = filename.trim_end_matches(".py");
    format!(
        "import importlib.util\nimport pathlib\n\n\
         CODE = pathlib.Path(__file__).resolve().parent.parent / \"code\" / \"{filename}\"\n\n\n\
         def test_module_compiles():\n    \
             source = CODE.read_text()\n    \
             compile(source, str(CODE), \"exec\")\n\n\n\
         def test_module_imports():\n    \
             spec = importlib.util.spec_from_file_location(\"{module}\", CODE)\n    \
             assert spec is not None and spec.loader is not None\n"
    )
}

/// Keep only the informative pytest lines for a human-readable summary.
pub fn parse_pytest_output(stdout: &str, stderr: &str) -> String {
    let mut summary_lines = Vec::new();
    for line in stdout.lines().chain(stderr.lines()) {
        let line = line.trim();
        if ["FAILED", "ERROR", "PASSED", "passed", "failed", "error", "collected", "::"]
            .iter()
            .any(|kw| line.contains(kw))
        {
            summary_lines.push(line.to_string());
        }
    }
    if summary_lines.is_empty() {
        return "No test output available".to_string();
    }
    summary_lines.join("\n")
}
