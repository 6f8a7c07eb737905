mod heuristics;
mod parsing;
mod prompt;
mod validate;

use crate::PlanningError;
use chrono::Utc;
use spectral_core::{MemoryKind, Plan, PlanStep};
use spectral_llm::LlmClient;
use spectral_rag::RagService;
use spectral_tools::ActionHost;
use std::collections::BTreeSet;
use std::sync::Arc;

const RAG_MEMORY_KINDS: &[MemoryKind] = &[
    MemoryKind::ToolKnowledge,
    MemoryKind::TaskHistory,
    MemoryKind::UserPreference,
];

/// Turns a free-form request into a validated `Plan`: prompt composition
/// (tool catalog + RAG enrichment), one LLM call, defensive parsing, tool
/// validation with heuristic injection, fallback synthesis, and the four
/// verification checks.
pub struct Planner {
    llm: Arc<dyn LlmClient>,
    tools: Arc<dyn ActionHost>,
    rag: Option<Arc<RagService>>,
    rag_top_k: usize,
    safety_validation_enabled: bool,
}

impl Planner {
    pub fn new(llm: Arc<dyn LlmClient>, tools: Arc<dyn ActionHost>) -> Self {
        Self {
            llm,
            tools,
            rag: None,
            rag_top_k: 3,
            safety_validation_enabled: true,
        }
    }

    pub fn with_rag(mut self, rag: Arc<RagService>, top_k: usize) -> Self {
        self.rag = Some(rag);
        self.rag_top_k = top_k;
        self
    }

    pub fn with_safety_validation(mut self, enabled: bool) -> Self {
        self.safety_validation_enabled = enabled;
        self
    }

    pub fn plan_actions(&self, user_input: &str) -> Result<Plan, PlanningError> {
        self.plan_inner(user_input, &mut |_| {})
    }

    /// Streaming variant: emits human-readable progress markers while the
    /// single planning pass runs, then returns the same `Plan`. Callers
    /// must not plan twice to get both.
    pub fn plan_actions_stream(
        &self,
        user_input: &str,
        progress: &mut dyn FnMut(String),
    ) -> Result<Plan, PlanningError> {
        self.plan_inner(user_input, progress)
    }

    fn plan_inner(
        &self,
        user_input: &str,
        progress: &mut dyn FnMut(String),
    ) -> Result<Plan, PlanningError> {
        let user_input = user_input.trim();
        if user_input.is_empty() {
            return Err(PlanningError::EmptyInput);
        }

        progress("Planning...\n".to_string());
        let prompt = self.build_prompt(user_input);
        let response = self.llm.generate(&prompt)?;

        let raw = match parsing::parse_planning_response(&response) {
            Ok(raw) => raw,
            Err(_) => parsing::RawPlanResponse {
                description: "Plan for execution".to_string(),
                steps: Vec::new(),
            },
        };

        let available = self.available_tools();
        let mut steps = self.validate_and_inject_tools(raw.steps, user_input, &available);
        if steps.is_empty() {
            steps = heuristics::generate_fallback_plan(user_input, &available);
        }

        for step in &steps {
            progress(format!(
                "  Step {}: {}\n",
                step.step_number, step.description
            ));
        }

        let mut plan = Plan::new(user_input, &raw.description, steps);
        let validation = validate::verify_plan(&plan, self.safety_validation_enabled);
        plan.is_safe = validation.safety_concerns.is_empty();
        progress(format!("Safe: {}\n", if plan.is_safe { "✓" } else { "✗" }));
        plan.validation_result = Some(validation);
        plan.verified_at = Some(Utc::now());
        Ok(plan)
    }

    fn build_prompt(&self, user_input: &str) -> String {
        let catalog = prompt::format_tool_catalog(&self.tools.list_available_actions());
        let base = prompt::build_planning_prompt(user_input, &catalog);
        if let Some(rag) = &self.rag {
            if let Ok(enriched) =
                rag.enrich_prompt(&base, user_input, RAG_MEMORY_KINDS, self.rag_top_k)
            {
                return enriched;
            }
        }
        base
    }

    fn available_tools(&self) -> BTreeSet<String> {
        self.tools.tool_names().into_iter().collect()
    }

    /// Drop unknown tool names, then heuristically inject tools into steps
    /// left without any, rewriting their descriptions to lead with the
    /// injected tool.
    fn validate_and_inject_tools(
        &self,
        mut steps: Vec<PlanStep>,
        user_input: &str,
        available: &BTreeSet<String>,
    ) -> Vec<PlanStep> {
        for step in &mut steps {
            step.required_tools.retain(|tool| available.contains(tool));
            if step.required_tools.is_empty() {
                let injected = heuristics::inject_tools_by_heuristics(
                    &step.description,
                    user_input,
                    available,
                );
                if !injected.is_empty() {
                    step.description =
                        heuristics::make_description_concrete(&step.description, &injected);
                    step.required_tools = injected;
                }
            }
        }
        steps
    }
}
