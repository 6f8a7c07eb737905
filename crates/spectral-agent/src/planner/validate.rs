use spectral_core::{Plan, PlanValidationResult, SafetyFlag};

/// The four verification checks: dependency sanity, step-number sequence,
/// non-blocking warnings, and safety concerns. Issues block execution;
/// warnings and safety concerns do not.
pub(crate) fn verify_plan(plan: &Plan, safety_validation_enabled: bool) -> PlanValidationResult {
    let mut issues = Vec::new();
    let mut warnings = Vec::new();
    let mut safety_concerns = Vec::new();

    let numbers: Vec<u32> = plan.steps.iter().map(|s| s.step_number).collect();

    // (a) Dependencies must exist and point strictly backwards.
    for step in &plan.steps {
        for dep in &step.dependencies {
            if !numbers.contains(dep) {
                issues.push(format!(
                    "Step {} depends on non-existent step {}",
                    step.step_number, dep
                ));
            } else if dep >= &step.step_number {
                issues.push(format!(
                    "Step {} depends on later step {}",
                    step.step_number, dep
                ));
            }
        }
    }

    // (b) Step numbers must be exactly 1..n with no gaps.
    let expected: Vec<u32> = (1..=plan.steps.len() as u32).collect();
    if numbers != expected {
        issues.push(format!(
            "Step numbers are not contiguous 1..{} (found {:?})",
            plan.steps.len(),
            numbers
        ));
    }

    // (c) Warnings.
    for step in &plan.steps {
        if step.description.trim().is_empty() {
            warnings.push(format!("Step {} has an empty description", step.step_number));
        }
    }
    if let Some(first) = plan.steps.first() {
        if !first.dependencies.is_empty() {
            warnings.push("Step 1 has dependencies".to_string());
        }
    }

    // (d) Safety concerns.
    if safety_validation_enabled {
        for step in &plan.steps {
            for flag in &step.safety_flags {
                match flag {
                    SafetyFlag::Destructive => safety_concerns.push(format!(
                        "Step {} performs a destructive operation",
                        step.step_number
                    )),
                    SafetyFlag::SystemCommand => safety_concerns.push(format!(
                        "Step {} runs a system command",
                        step.step_number
                    )),
                    SafetyFlag::FileModification => safety_concerns.push(format!(
                        "Step {} modifies the filesystem",
                        step.step_number
                    )),
                    _ => {}
                }
            }
        }
    }

    PlanValidationResult {
        is_valid: issues.is_empty(),
        issues,
        warnings,
        safety_concerns,
    }
}
