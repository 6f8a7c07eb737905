//! Code-path scenarios: generation through the sandbox gates and export.
//! These run the real Python toolchain and skip when it is unavailable.

use spectral_agent::archive::CodeArchive;
use spectral_agent::codegen::DirectExecutor;
use spectral_core::cancel::CancelToken;
use spectral_core::{RetryConfig, SandboxConfig, SandboxStatus};
use spectral_memory::MemoryService;
use spectral_sandbox::SandboxManager;
use spectral_store::SqliteBackend;
use spectral_testkit::ScriptedLlm;
use std::sync::Arc;
use tempfile::TempDir;
use uuid::Uuid;

fn python_available() -> bool {
    std::process::Command::new("python3")
        .arg("--version")
        .output()
        .map(|o| o.status.success())
        .unwrap_or(false)
}

fn executor_for(store: &TempDir, llm: Arc<ScriptedLlm>) -> (DirectExecutor, Arc<MemoryService>) {
    let backend = SqliteBackend::open(store.path()).expect("backend");
    let memory = Arc::new(MemoryService::new(Arc::new(backend)));
    let executor = DirectExecutor::new(
        llm,
        SandboxManager::with_root(store.path().join("sandbox"), SandboxConfig::default()),
        memory.clone(),
        CodeArchive::with_root(store.path().join("archive")),
        RetryConfig::default(),
    );
    (executor, memory)
}

const PRIMES_PROGRAM: &str = "```python
def primes(n):
    found = []
    candidate = 2
    while len(found) < n:
        if all(candidate % p for p in found):
            found.append(candidate)
        candidate += 1
    return found


print(primes(5))
```";

#[test]
fn prime_program_passes_all_gates_and_is_exported() {
    if !python_available() {
        return;
    }
    let store = TempDir::new().expect("store");
    let llm = Arc::new(ScriptedLlm::new(vec![PRIMES_PROGRAM]));
    let (executor, memory) = executor_for(&store, llm);

    let mut progress = Vec::new();
    let report = executor
        .execute_request(
            "write a Python program that prints the first 5 primes",
            Uuid::now_v7(),
            &mut |chunk| progress.push(chunk),
            &CancelToken::new(),
        )
        .expect("execute");

    assert!(report.success, "progress: {}", progress.join(""));
    assert_eq!(report.attempts, 1);
    let sandbox = report.sandbox.expect("sandbox result");
    assert_eq!(sandbox.status, SandboxStatus::Success);
    assert!(sandbox.gates_passed.syntax);
    assert!(sandbox.gates_passed.tests);
    assert!(sandbox.gates_passed.smoke);
    assert!(sandbox.stdout.contains("2, 3, 5, 7, 11"));

    let exported = report.exported_path.expect("exported path");
    assert!(exported.exists());
    assert!(exported.to_string_lossy().contains("FINAL"));

    let joined = progress.join("");
    assert!(joined.contains("Syntax: ✅"));
    assert!(joined.contains("Tests: ✅"));
    assert!(joined.contains("Smoke: ✅"));

    let executions = memory
        .get_executions_by_tag("sandbox_verification", None)
        .expect("executions");
    assert_eq!(executions.len(), 1);
    assert!(executions[0].tags.contains(&"cli".to_string()));
    assert!(executions[0]
        .file_locations
        .iter()
        .any(|p| p.contains("FINAL")));
}

#[test]
fn fix_loop_recovers_from_syntax_error() {
    if !python_available() {
        return;
    }
    let store = TempDir::new().expect("store");
    let llm = Arc::new(ScriptedLlm::new(vec![
        "print('broken'",
        "print('fixed')",
    ]));
    let (executor, _memory) = executor_for(&store, llm.clone());

    let report = executor
        .execute_request(
            "write a program that prints fixed",
            Uuid::now_v7(),
            &mut |_| {},
            &CancelToken::new(),
        )
        .expect("execute");

    assert!(report.success);
    assert_eq!(report.attempts, 2);
    assert_eq!(llm.call_count(), 2);
    // The second prompt must carry the failing code and its error.
    let calls = llm.calls.lock().expect("calls");
    assert!(calls[1].contains("print('broken'"));
    assert!(calls[1].to_lowercase().contains("failed"));
}

#[test]
fn gui_mainloop_is_rejected_without_smoke_execution() {
    if !python_available() {
        return;
    }
    let store = TempDir::new().expect("store");
    // Respecting the request's "at most 1 attempts" directive keeps the
    // test to a single generation.
    let llm = Arc::new(ScriptedLlm::new(vec![
        "import tkinter as tk\nroot = tk.Tk()\nroot.mainloop()\n",
    ]));
    let (executor, _memory) = executor_for(&store, llm);

    let report = executor
        .execute_request(
            "write a tkinter window app, at most 1 attempts",
            Uuid::now_v7(),
            &mut |_| {},
            &CancelToken::new(),
        )
        .expect("execute");

    assert!(!report.success);
    let sandbox = report.sandbox.expect("sandbox result");
    assert_eq!(sandbox.status, SandboxStatus::Error);
    assert!(sandbox
        .error_message
        .expect("error")
        .contains("mainloop"));
    // Syntax gate ran; nothing was executed past it.
    assert!(sandbox.gates_passed.syntax);
    assert!(!sandbox.gates_passed.smoke);
    assert!(sandbox.stdout.is_empty());
}

#[test]
fn retry_directive_bounds_the_attempt_loop() {
    if !python_available() {
        return;
    }
    let store = TempDir::new().expect("store");
    // Every reply is syntactically broken; the loop must stop at the
    // directive's limit rather than the configured default of 10.
    let llm = Arc::new(ScriptedLlm::new(vec![
        "print('a'",
        "print('b'",
        "print('c'",
    ]));
    let (executor, _memory) = executor_for(&store, llm.clone());

    let report = executor
        .execute_request(
            "write a program, retry up to 2 times",
            Uuid::now_v7(),
            &mut |_| {},
            &CancelToken::new(),
        )
        .expect("execute");

    assert!(!report.success);
    assert_eq!(report.attempts, 2);
    assert_eq!(llm.call_count(), 2);
}
