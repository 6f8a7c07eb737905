use crate::codegen::DirectExecutor;
use crate::dispatcher::{DispatchSummary, Dispatcher};
use crate::intent::{classify_intent, Intent, ResponseGenerator};
use crate::planner::Planner;
use crate::PlanningError;
use chrono::Utc;
use spectral_core::cancel::CancelToken;
use spectral_core::{ConversationMemory, ExecutionMemory, Plan, StepOutcome};
use spectral_memory::MemoryService;
use spectral_observe::Observer;
use std::sync::Arc;
use uuid::Uuid;

/// Words that signal the user is pointing back at earlier work.
const REFERENCE_MARKERS: &[&str] = &[
    "that file",
    "that program",
    "the file you",
    "it again",
    "that again",
    "the one you",
    "previous",
    "last time",
    "that script",
];

/// The user-visible orchestration surface: one session owns the planner,
/// dispatcher, code path, and memory, and renders each turn as a
/// transcript. Streamed output keeps a fixed section order: planning
/// progress, blank line, `[Executing...]`, per-step output, an
/// `Execution Result:` summary, and a trailing conversational response.
pub struct AssistantSession {
    planner: Planner,
    dispatcher: Dispatcher,
    direct: DirectExecutor,
    memory: Arc<MemoryService>,
    responder: ResponseGenerator,
    observer: Arc<Observer>,
    context_turns: usize,
}

impl AssistantSession {
    pub fn new(
        planner: Planner,
        dispatcher: Dispatcher,
        direct: DirectExecutor,
        memory: Arc<MemoryService>,
        responder: ResponseGenerator,
        observer: Arc<Observer>,
        context_turns: usize,
    ) -> Self {
        Self {
            planner,
            dispatcher,
            direct,
            memory,
            responder,
            observer,
            context_turns,
        }
    }

    /// Blocking form: the full transcript of plan and outcomes.
    pub fn process_command(&self, text: &str) -> String {
        self.process_command_stream(text, &mut |_| {})
    }

    /// Streaming form: emits chunks in section order and returns the
    /// aggregated transcript.
    pub fn process_command_stream(&self, text: &str, emit: &mut dyn FnMut(String)) -> String {
        self.process_with_cancel(text, &CancelToken::new(), emit)
    }

    pub fn process_with_cancel(
        &self,
        text: &str,
        cancel: &CancelToken,
        emit: &mut dyn FnMut(String),
    ) -> String {
        let mut transcript = String::new();
        let mut emit_all = |chunk: String, transcript: &mut String| {
            transcript.push_str(&chunk);
            emit(chunk);
        };

        let intent = classify_intent(text);
        self.observer.verbose_log(&format!(
            "intent={} input={text}",
            intent.as_str()
        ));

        match intent {
            Intent::Casual => {
                let context = self.memory_context(text);
                let response = self
                    .responder
                    .generate_response(Intent::Casual, "", text, &context);
                emit_all(response.clone(), &mut transcript);
                self.save_turn(text, &transcript, Vec::new());
                transcript
            }
            Intent::LocationQuery => {
                let answer = self.handle_location_query(text).unwrap_or_else(|| {
                    "I could not find a saved file matching that description.".to_string()
                });
                emit_all(answer, &mut transcript);
                self.save_turn(text, &transcript, Vec::new());
                transcript
            }
            Intent::CodeGeneration => self.run_code_path(text, cancel, &mut emit_all),
            Intent::Action => self.run_action_path(text, cancel, &mut emit_all),
        }
    }

    fn run_action_path(
        &self,
        text: &str,
        cancel: &CancelToken,
        emit_all: &mut dyn FnMut(String, &mut String),
    ) -> String {
        let mut transcript = String::new();

        // Resolve references to prior work before planning so the plan
        // can target the remembered files.
        let referenced = self.resolve_memory_reference(text);
        let planning_input = match &referenced {
            Some(execution) => {
                emit_all(
                    format!("Found reference to: {}\n", execution.description),
                    &mut transcript,
                );
                if !execution.file_locations.is_empty() {
                    emit_all(
                        format!("Files: {}\n", execution.file_locations.join(", ")),
                        &mut transcript,
                    );
                }
                format!(
                    "{text} (referring to earlier work: {}; files: {})",
                    execution.description,
                    execution.file_locations.join(", ")
                )
            }
            None => text.to_string(),
        };

        // Planning progress section.
        let mut plan = match self.planner.plan_actions_stream(&planning_input, &mut |chunk| {
            emit_all(chunk, &mut transcript)
        }) {
            Ok(plan) => plan,
            Err(PlanningError::EmptyInput) => {
                let message = "Error: user input is empty".to_string();
                emit_all(message, &mut transcript);
                return transcript;
            }
            Err(err) => {
                emit_all(format!("Error: {err}"), &mut transcript);
                self.save_turn(text, &transcript, Vec::new());
                return transcript;
            }
        };
        if let Some(execution) = &referenced {
            inject_reference_paths(&mut plan, &execution.file_locations);
        }
        let _ = self.observer.record_event(
            "plan_created",
            &serde_json::json!({"plan_id": plan.plan_id, "steps": plan.steps.len()}),
        );

        if !plan.is_valid() {
            let issues = plan
                .validation_result
                .as_ref()
                .map(|v| v.issues.join("; "))
                .unwrap_or_default();
            emit_all(
                format!("\nError: plan validation failed: {issues}\n"),
                &mut transcript,
            );
            self.save_turn(text, &transcript, Vec::new());
            return transcript;
        }

        // Execution section. A "retry up to N times" directive in the
        // request overrides the configured retry budget for this plan.
        emit_all("\n".to_string(), &mut transcript);
        emit_all("[Executing...]\n".to_string(), &mut transcript);
        let retry_limit = spectral_core::retry::parse_retry_limit(text);
        let (summary, outcomes) = self.dispatcher.dispatch_stream_with_retry_limit(
            &plan,
            cancel,
            &mut |chunk| emit_all(chunk, &mut transcript),
            retry_limit,
        );
        for (step, outcome) in plan.steps.iter_mut().zip(&outcomes) {
            step.status = crate::dispatcher::status_for_outcome(outcome);
        }
        let _ = self.observer.record_event(
            "plan_executed",
            &serde_json::json!({"plan_id": plan.plan_id, "success": summary.success}),
        );

        emit_all("\nExecution Result:\n".to_string(), &mut transcript);
        emit_all(format_summary(&summary, &outcomes), &mut transcript);

        // Trailing conversational response, generated even when nothing
        // was executed.
        let execution = execution_from_outcomes(text, &plan, &summary, &outcomes);
        let result_json = serde_json::to_string(&summary).unwrap_or_default();
        let context = self.memory_context(text);
        let response =
            self.responder
                .generate_response(Intent::Action, &result_json, text, &context);
        emit_all(format!("\n💬 Response: {response}"), &mut transcript);

        self.save_turn(text, &transcript, vec![execution]);
        transcript
    }

    fn run_code_path(
        &self,
        text: &str,
        cancel: &CancelToken,
        emit_all: &mut dyn FnMut(String, &mut String),
    ) -> String {
        let mut transcript = String::new();
        let turn_id = Uuid::now_v7();
        emit_all("[Executing...]\n".to_string(), &mut transcript);

        let report = self
            .direct
            .execute_request(text, turn_id, &mut |chunk| emit_all(chunk, &mut transcript), cancel);

        let executions = match &report {
            Ok(report) => {
                emit_all("\nExecution Result:\n".to_string(), &mut transcript);
                emit_all(
                    format!(
                        "Code generation {} after {} attempt(s)\n",
                        if report.success { "succeeded" } else { "failed" },
                        report.attempts
                    ),
                    &mut transcript,
                );
                report.execution.clone().into_iter().collect()
            }
            Err(err) => {
                emit_all(format!("Error: {err}\n"), &mut transcript);
                Vec::new()
            }
        };

        let context = self.memory_context(text);
        let result_text = transcript.clone();
        let response = self.responder.generate_response(
            Intent::CodeGeneration,
            &result_text,
            text,
            &context,
        );
        emit_all(format!("\n💬 Response: {response}"), &mut transcript);

        self.save_turn_with_id(turn_id, text, &transcript, executions);
        transcript
    }

    /// Best-matching prior execution for messages that point back at
    /// earlier work. The matcher is deliberately coarse (substring + name
    /// similarity); see DESIGN notes.
    fn resolve_memory_reference(&self, text: &str) -> Option<ExecutionMemory> {
        let text_lc = text.to_lowercase();
        let words: Vec<&str> = text_lc.split_whitespace().collect();
        let is_reference = REFERENCE_MARKERS.iter().any(|m| text_lc.contains(m))
            || (words.len() <= 8 && words.iter().any(|w| *w == "that" || *w == "it"));
        if !is_reference {
            return None;
        }
        self.memory
            .search_by_description(text, 1)
            .ok()?
            .into_iter()
            .next()
    }

    fn handle_location_query(&self, text: &str) -> Option<String> {
        let locations = self.memory.get_file_locations(text).ok()?;
        if locations.is_empty() {
            return None;
        }
        Some(format!("The files are at: {}", locations.join(", ")))
    }

    fn memory_context(&self, query: &str) -> String {
        let mut context = self
            .memory
            .get_recent_context(self.context_turns)
            .unwrap_or_default();
        if let Ok(executions) = self.memory.search_by_description(query, 2) {
            for execution in executions {
                context.push_str(&format!(
                    "\nPast execution: {} (files: {})",
                    execution.description,
                    execution.file_locations.join(", ")
                ));
            }
        }
        context
    }

    fn save_turn(&self, user: &str, assistant: &str, executions: Vec<ExecutionMemory>) {
        self.save_turn_with_id(Uuid::now_v7(), user, assistant, executions);
    }

    fn save_turn_with_id(
        &self,
        turn_id: Uuid,
        user: &str,
        assistant: &str,
        executions: Vec<ExecutionMemory>,
    ) {
        let conversation = ConversationMemory {
            turn_id,
            timestamp: Utc::now(),
            user_message: user.to_string(),
            assistant_response: assistant.to_string(),
            execution_history: executions,
            context_tags: Vec::new(),
            session_id: None,
            embedding: None,
        };
        if let Err(err) = self.memory.save_conversation_turn(&conversation) {
            self.observer.warn_log(&format!("failed to save turn: {err}"));
        }
    }
}

/// Rewrite file-family steps that mention no concrete path to target the
/// referenced execution's files.
fn inject_reference_paths(plan: &mut Plan, files: &[String]) {
    let Some(first_file) = files.first() else {
        return;
    };
    for step in &mut plan.steps {
        let is_file_step = step
            .required_tools
            .first()
            .is_some_and(|t| t.starts_with("file_"));
        if is_file_step && !step.description.contains('/') && !step.description.contains('\\') {
            step.description = format!("{} {first_file}", step.description);
        }
    }
}

/// One ExecutionMemory per action turn, linking the turn to what actually
/// happened on disk.
fn execution_from_outcomes(
    text: &str,
    plan: &Plan,
    summary: &DispatchSummary,
    outcomes: &[StepOutcome],
) -> ExecutionMemory {
    let mut file_locations = Vec::new();
    for outcome in outcomes {
        if let Some(data) = &outcome.data {
            for key in ["path", "destination"] {
                if let Some(path) = data.get(key).and_then(|v| v.as_str()) {
                    if !file_locations.iter().any(|p| p == path) {
                        file_locations.push(path.to_string());
                    }
                }
            }
        }
    }
    let output = outcomes
        .iter()
        .map(|o| format!("Step {}: {}", o.step_number, o.message))
        .collect::<Vec<_>>()
        .join("\n");
    let error_message = outcomes
        .iter()
        .filter_map(|o| o.error.clone())
        .next_back();

    ExecutionMemory {
        execution_id: Uuid::now_v7(),
        timestamp: Utc::now(),
        user_request: text.to_string(),
        description: format!("{} ({})", plan.description, text),
        code_generated: String::new(),
        file_locations,
        output,
        success: summary.success,
        tags: vec!["plan_execution".to_string()],
        execution_time_ms: Some(summary.total_execution_time_ms),
        error_message: if summary.success { None } else { error_message },
    }
}

fn format_summary(summary: &DispatchSummary, outcomes: &[StepOutcome]) -> String {
    let mut out = format!(
        "Steps: {} | Succeeded: {} | Failed: {} | Skipped: {} | Retries: {} | Time: {}ms\n",
        summary.total_steps,
        summary.completed,
        summary.failed,
        summary.skipped,
        summary.total_retries,
        summary.total_execution_time_ms
    );
    for outcome in outcomes {
        let mark = if outcome.success { "✅" } else { "❌" };
        out.push_str(&format!(
            "  {mark} Step {}: {}",
            outcome.step_number, outcome.step_description
        ));
        if let Some(error) = &outcome.error {
            out.push_str(&format!(" — {error}"));
        }
        if outcome.verified && outcome.success {
            out.push_str(" (verified)");
        }
        out.push('\n');
    }
    out
}
