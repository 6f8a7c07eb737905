use crate::PlanningError;
use serde_json::Value;
use spectral_core::{PlanStep, SafetyFlag, StepStatus};
use spectral_llm::json::parse_lenient;

/// Planning payload as extracted from the model reply, before tool
/// validation and verification.
#[derive(Debug)]
pub(crate) struct RawPlanResponse {
    pub(crate) description: String,
    pub(crate) steps: Vec<PlanStep>,
}

/// Parse a free-form model reply into steps. A bare array is treated as
/// `steps`; missing `description`/`steps` are defaulted. Individual
/// malformed steps are dropped rather than failing the whole plan.
pub(crate) fn parse_planning_response(text: &str) -> Result<RawPlanResponse, PlanningError> {
    if text.trim().is_empty() {
        return Err(PlanningError::UnparseableResponse(
            "empty response from LLM".to_string(),
        ));
    }
    let value = parse_lenient(text)
        .map_err(|e| PlanningError::UnparseableResponse(e.to_string()))?;

    let (description, steps_value) = match value {
        Value::Array(steps) => ("Plan for execution".to_string(), Value::Array(steps)),
        Value::Object(mut map) => {
            let description = map
                .remove("description")
                .and_then(|v| v.as_str().map(str::to_string))
                .filter(|d| !d.trim().is_empty())
                .unwrap_or_else(|| "Plan for execution".to_string());
            let steps = map.remove("steps").unwrap_or(Value::Array(Vec::new()));
            (description, steps)
        }
        other => {
            return Err(PlanningError::UnparseableResponse(format!(
                "unexpected JSON structure: {other}"
            )))
        }
    };

    let mut steps = Vec::new();
    if let Value::Array(entries) = steps_value {
        for entry in entries {
            if let Some(step) = parse_step(&entry, steps.len() as u32 + 1) {
                steps.push(step);
            }
        }
    }

    // Coerce numbering to contiguous 1..n. Dependencies written against
    // the model's original numbering are remapped, then clamped to
    // strictly earlier steps.
    let renumbering: std::collections::HashMap<u32, u32> = steps
        .iter()
        .enumerate()
        .map(|(idx, step)| (step.step_number, idx as u32 + 1))
        .collect();
    for (idx, step) in steps.iter_mut().enumerate() {
        let number = idx as u32 + 1;
        step.step_number = number;
        step.dependencies = step
            .dependencies
            .iter()
            .filter_map(|d| renumbering.get(d).copied())
            .filter(|d| *d >= 1 && *d < number)
            .collect();
        step.dependencies.sort_unstable();
        step.dependencies.dedup();
    }

    Ok(RawPlanResponse { description, steps })
}

fn parse_step(entry: &Value, fallback_number: u32) -> Option<PlanStep> {
    let map = entry.as_object()?;
    let description = map
        .get("description")
        .and_then(|v| v.as_str())
        .unwrap_or_default()
        .trim()
        .to_string();

    let required_tools = string_array(map.get("required_tools"));
    let dependencies = number_array(map.get("dependencies"));
    // Unrecognized safety flags are dropped, not errors.
    let safety_flags = string_array(map.get("safety_flags"))
        .iter()
        .filter_map(|f| SafetyFlag::parse(f))
        .collect();

    Some(PlanStep {
        step_number: map
            .get("step_number")
            .and_then(coerce_u32)
            .unwrap_or(fallback_number),
        description,
        required_tools,
        dependencies,
        safety_flags,
        estimated_duration: map
            .get("estimated_duration")
            .and_then(|v| v.as_str())
            .map(str::to_string),
        status: StepStatus::Pending,
    })
}

fn string_array(value: Option<&Value>) -> Vec<String> {
    value
        .and_then(|v| v.as_array())
        .map(|arr| {
            arr.iter()
                .filter_map(|v| v.as_str())
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect()
        })
        .unwrap_or_default()
}

fn number_array(value: Option<&Value>) -> Vec<u32> {
    value
        .and_then(|v| v.as_array())
        .map(|arr| arr.iter().filter_map(coerce_u32).collect())
        .unwrap_or_default()
}

/// Models emit numbers as integers or quoted strings interchangeably.
fn coerce_u32(value: &Value) -> Option<u32> {
    match value {
        Value::Number(n) => n.as_u64().and_then(|n| u32::try_from(n).ok()),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}
