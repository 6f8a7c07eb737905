use crate::archive::CodeArchive;
use anyhow::Result;
use chrono::Utc;
use regex::Regex;
use spectral_core::cancel::CancelToken;
use spectral_core::retry::{format_attempt_progress, parse_retry_limit};
use spectral_core::{ExecutionMemory, RetryConfig, SandboxResult, SandboxStatus};
use spectral_llm::LlmClient;
use spectral_memory::MemoryService;
use spectral_sandbox::{is_gui_program, SandboxManager};
use std::sync::{Arc, OnceLock};
use uuid::Uuid;

/// Outcome of one code-generation request across all sandbox attempts.
#[derive(Debug)]
pub struct CodeRunReport {
    pub success: bool,
    pub attempts: u32,
    pub final_code: String,
    pub exported_path: Option<std::path::PathBuf>,
    pub sandbox: Option<SandboxResult>,
    pub execution: Option<ExecutionMemory>,
}

/// The code path: request -> generated program -> sandbox gates -> export.
/// Gate failures feed a fix prompt (previous code + captured errors) back
/// to the model; attempts continue until success or the request's own
/// limit (configured ceiling otherwise).
pub struct DirectExecutor {
    llm: Arc<dyn LlmClient>,
    sandbox: SandboxManager,
    memory: Arc<MemoryService>,
    archive: CodeArchive,
    retry: RetryConfig,
}

impl DirectExecutor {
    pub fn new(
        llm: Arc<dyn LlmClient>,
        sandbox: SandboxManager,
        memory: Arc<MemoryService>,
        archive: CodeArchive,
        retry: RetryConfig,
    ) -> Self {
        Self {
            llm,
            sandbox,
            memory,
            archive,
            retry,
        }
    }

    pub fn execute_request(
        &self,
        user_request: &str,
        turn_id: Uuid,
        progress: &mut dyn FnMut(String),
        cancel: &CancelToken,
    ) -> Result<CodeRunReport> {
        let limit = parse_retry_limit(user_request).unwrap_or(self.retry.code_max_attempts);
        let request_id = format!("req-{}", Uuid::now_v7());
        let learned = self.learned_patterns();

        let mut previous: Option<(String, String)> = None;
        let mut last_sandbox: Option<SandboxResult> = None;
        let mut last_code = String::new();
        let mut attempts_done = 0u32;

        for attempt in 1..=limit {
            if cancel.is_cancelled() {
                progress("Cancelled.\n".to_string());
                break;
            }
            progress(format!(
                "{}\n",
                format_attempt_progress(attempt, Some(limit))
            ));

            let prompt = match &previous {
                None => build_generation_prompt(user_request, &learned),
                Some((code, error)) => build_fix_prompt(user_request, code, error),
            };

            let mut chunk_log = String::new();
            let raw = self.llm.generate_stream(&prompt, &mut |chunk| {
                chunk_log.push_str(chunk);
            })?;
            let mut code = strip_markdown(&raw);
            if detect_desktop_save_request(user_request) {
                code = rewrite_paths_to_desktop(&code);
            }
            let stdin_data = synthesize_stdin(&code);

            let result =
                self.sandbox
                    .execute_pipeline(&code, "main.py", stdin_data.as_deref())?;
            emit_gate_lines(&result, progress);

            let metadata = serde_json::json!({
                "request": user_request,
                "attempt": attempt,
                "status": result.status,
                "gates_passed": result.gates_passed,
                "error": result.error_message,
                "recorded_at": Utc::now().to_rfc3339(),
            });
            let succeeded = result.status == SandboxStatus::Success;
            self.archive
                .record_attempt(&request_id, attempt, &code, &metadata, &chunk_log, succeeded)?;

            attempts_done = attempt;
            last_code = code.clone();
            if succeeded {
                let exported = self.archive.record_final(&request_id, &code)?;
                progress(format!("Exported to {}\n", exported.display()));
                let execution = self.save_execution(
                    user_request,
                    &code,
                    &result,
                    &exported,
                    turn_id,
                )?;
                return Ok(CodeRunReport {
                    success: true,
                    attempts: attempt,
                    final_code: code,
                    exported_path: Some(exported),
                    sandbox: Some(result),
                    execution: Some(execution),
                });
            }

            let error = result
                .error_message
                .clone()
                .unwrap_or_else(|| format!("{:?}", result.status));
            progress(format!("Attempt {attempt} failed: {error}\n"));
            previous = Some((code, error));
            last_sandbox = Some(result);
        }

        Ok(CodeRunReport {
            success: false,
            attempts: attempts_done,
            final_code: last_code,
            exported_path: None,
            sandbox: last_sandbox,
            execution: None,
        })
    }

    fn save_execution(
        &self,
        user_request: &str,
        code: &str,
        result: &SandboxResult,
        exported: &std::path::Path,
        turn_id: Uuid,
    ) -> Result<ExecutionMemory> {
        let kind = if is_gui_program(code) { "gui" } else { "cli" };
        let mut file_locations = vec![exported.to_string_lossy().to_string()];
        if let Some(code_path) = &result.code_path {
            file_locations.push(code_path.to_string_lossy().to_string());
        }
        let execution = ExecutionMemory {
            execution_id: Uuid::now_v7(),
            timestamp: Utc::now(),
            user_request: user_request.to_string(),
            description: describe_generation(user_request),
            code_generated: code.to_string(),
            file_locations,
            output: result.stdout.clone(),
            success: true,
            tags: vec![
                "python".to_string(),
                "sandbox_verification".to_string(),
                kind.to_string(),
            ],
            execution_time_ms: Some((result.duration_seconds * 1000.0) as u64),
            error_message: None,
        };
        self.memory.save_execution(&execution, turn_id)?;
        Ok(execution)
    }

    /// Error messages from past failed generations, folded into the first
    /// prompt so recurrent mistakes are named up front.
    fn learned_patterns(&self) -> Vec<String> {
        let Ok(executions) = self
            .memory
            .get_executions_by_tag("sandbox_verification", Some(20))
        else {
            return Vec::new();
        };
        let mut patterns: Vec<String> = executions
            .into_iter()
            .filter(|e| !e.success)
            .filter_map(|e| e.error_message)
            .take(5)
            .collect();
        patterns.dedup();
        patterns
    }
}

fn emit_gate_lines(result: &SandboxResult, progress: &mut dyn FnMut(String)) {
    let mark = |ok: bool| if ok { "✅" } else { "❌" };
    progress(format!("Syntax: {}\n", mark(result.gates_passed.syntax)));
    progress(format!("Tests: {}\n", mark(result.gates_passed.tests)));
    progress(format!("Smoke: {}\n", mark(result.gates_passed.smoke)));
}

fn describe_generation(user_request: &str) -> String {
    let trimmed = user_request.trim();
    if trimmed.chars().count() <= 120 {
        format!("Generated and verified code for: {trimmed}")
    } else {
        let head: String = trimmed.chars().take(120).collect();
        format!("Generated and verified code for: {head}...")
    }
}

pub(crate) fn build_generation_prompt(user_request: &str, learned: &[String]) -> String {
    let mut prompt = format!(
        "Write a complete, runnable Python program for this request:\n\n\
         {user_request}\n\n\
         Requirements:\n\
         - Output ONLY Python code, no explanations or markdown\n\
         - The program must run as-is with `python main.py`\n\
         - Print results to stdout\n\
         - Handle its own errors; never crash on expected input\n"
    );
    if !learned.is_empty() {
        prompt.push_str("\nAvoid these mistakes seen in earlier attempts:\n");
        for pattern in learned {
            prompt.push_str(&format!("- {pattern}\n"));
        }
    }
    prompt
}

pub(crate) fn build_fix_prompt(user_request: &str, code: &str, error: &str) -> String {
    format!(
        "The following Python program was generated for this request but \
         failed verification.\n\n\
         Request: {user_request}\n\n\
         Program:\n```python\n{code}\n```\n\n\
         Failure output:\n{error}\n\n\
         Produce a corrected version. Output ONLY the full Python code, no \
         explanations or markdown.\n"
    )
}

/// Strip markdown fences the model wraps code in despite instructions.
pub(crate) fn strip_markdown(raw: &str) -> String {
    let trimmed = raw.trim();
    if let Some(start) = trimmed.find("```") {
        let after = &trimmed[start + 3..];
        let after = after
            .strip_prefix("python")
            .or_else(|| after.strip_prefix("py"))
            .unwrap_or(after);
        if let Some(end) = after.find("```") {
            return after[..end].trim().to_string();
        }
        return after.trim().to_string();
    }
    trimmed.to_string()
}

pub(crate) fn detect_desktop_save_request(user_request: &str) -> bool {
    let request = user_request.to_lowercase();
    request.contains("desktop") && ["save", "write", "create", "put"].iter().any(|w| request.contains(w))
}

/// Redirect relative `open(...)` targets to the desktop when the request
/// asked for a desktop save.
pub(crate) fn rewrite_paths_to_desktop(code: &str) -> String {
    static OPEN_CALL: OnceLock<Regex> = OnceLock::new();
    let re = OPEN_CALL.get_or_init(|| {
        Regex::new(r#"open\(\s*(['\x22])([^/\\'\x22][^'\x22]*)['\x22]"#).expect("open pattern")
    });
    if !re.is_match(code) {
        return code.to_string();
    }
    // The match consumes `open("name"`; closing the join here leaves the
    // original mode argument and `open`'s own closing paren intact:
    // `open("out.txt", "w")` -> `open(os.path.join(_DESKTOP, "out.txt"), "w")`.
    let rewritten = re.replace_all(code, |caps: &regex::Captures<'_>| {
        let quote = &caps[1];
        let name = &caps[2];
        format!("open(os.path.join(_DESKTOP, {quote}{name}{quote})")
    });
    let mut out = String::new();
    if !code.contains("import os") {
        out.push_str("import os\n");
    }
    out.push_str("_DESKTOP = os.path.join(os.path.expanduser(\"~\"), \"Desktop\")\n");
    out.push_str(&rewritten);
    out
}

/// Count `input()` calls and synthesize one stdin line per call: numeric
/// answers where the prompt suggests a number, plain text otherwise.
pub(crate) fn synthesize_stdin(code: &str) -> Option<String> {
    static INPUT_CALL: OnceLock<Regex> = OnceLock::new();
    let re = INPUT_CALL
        .get_or_init(|| Regex::new(r#"input\(([^)]*)\)"#).expect("input pattern"));
    let mut lines = Vec::new();
    for caps in re.captures_iter(code) {
        let prompt = caps.get(1).map(|m| m.as_str().to_lowercase()).unwrap_or_default();
        let numeric = ["number", "count", "age", "how many", "int", "digit"]
            .iter()
            .any(|w| prompt.contains(w));
        lines.push(if numeric { "42" } else { "test" });
    }
    if lines.is_empty() {
        return None;
    }
    Some(format!("{}\n", lines.join("\n")))
}
