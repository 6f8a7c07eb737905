use crate::executor::{ExecutionRecord, ExecutorServer};
use serde_json::{Map, Value};
use spectral_core::cancel::{CancelToken, Sleeper, TokenSleeper};
use spectral_core::{AttemptResult, Plan, PlanStep, RetryConfig, StepOutcome, StepStatus};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Error-message substrings that mark an adapter failure permanent: no
/// amount of retrying will fix them.
const PERMANENT_ADAPTER_MARKERS: &[&str] = &[
    "not found",
    "no such file",
    "permission denied",
    "access denied",
    "not installed",
    "does not exist",
];

/// Same idea for verifier disagreements.
const PERMANENT_VERIFIER_MARKERS: &[&str] = &[
    "does not exist",
    "not found",
    "locked",
    "permission denied",
];

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub backoff_base_seconds: f64,
    /// Static substitution table: failing action type -> alternative.
    pub alternatives: BTreeMap<String, String>,
}

impl RetryPolicy {
    pub fn from_config(cfg: &RetryConfig) -> Self {
        Self {
            max_retries: cfg.action_max_retries,
            backoff_base_seconds: cfg.backoff_base_seconds,
            alternatives: cfg.alternatives.clone(),
        }
    }

    fn backoff_for_attempt(&self, attempt: u32) -> Duration {
        Duration::from_secs_f64(
            self.backoff_base_seconds * 2f64.powi(attempt.saturating_sub(1) as i32),
        )
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&RetryConfig::default())
    }
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct DispatchSummary {
    pub total_steps: usize,
    pub completed: usize,
    pub failed: usize,
    pub skipped: usize,
    pub total_retries: usize,
    pub total_execution_time_ms: u64,
    pub success: bool,
}

type StepCallback = Box<dyn Fn(&StepOutcome) + Send + Sync>;

/// Walks a validated plan in order, retrying failed steps with exponential
/// backoff and alternative actions, stopping early on permanent errors,
/// and skipping steps whose dependencies failed.
pub struct Dispatcher {
    executor: Arc<ExecutorServer>,
    policy: RetryPolicy,
    sleeper: Arc<dyn Sleeper>,
    subscribers: Mutex<Vec<StepCallback>>,
}

impl Dispatcher {
    pub fn new(executor: Arc<ExecutorServer>, policy: RetryPolicy) -> Self {
        Self {
            executor,
            policy,
            sleeper: Arc::new(TokenSleeper),
            subscribers: Mutex::new(Vec::new()),
        }
    }

    pub fn with_sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }

    /// Observe each StepOutcome as it completes, in plan order. A callback
    /// that panics never interrupts dispatch.
    pub fn subscribe(&self, callback: impl Fn(&StepOutcome) + Send + Sync + 'static) {
        self.subscribers
            .lock()
            .expect("subscriber lock poisoned")
            .push(Box::new(callback));
    }

    pub fn dispatch(&self, plan: &Plan, cancel: &CancelToken) -> (DispatchSummary, Vec<StepOutcome>) {
        self.dispatch_inner(plan, cancel, &mut |_| {}, None)
    }

    /// Streaming variant: emits per-retry/per-step progress text through
    /// `progress` and returns the same outcomes from the same walk.
    pub fn dispatch_stream(
        &self,
        plan: &Plan,
        cancel: &CancelToken,
        progress: &mut dyn FnMut(String),
    ) -> (DispatchSummary, Vec<StepOutcome>) {
        self.dispatch_inner(plan, cancel, progress, None)
    }

    /// Same walk with the retry budget overridden for this plan only, for
    /// requests that embed their own directive ("retry up to N times").
    pub fn dispatch_stream_with_retry_limit(
        &self,
        plan: &Plan,
        cancel: &CancelToken,
        progress: &mut dyn FnMut(String),
        max_retries: Option<u32>,
    ) -> (DispatchSummary, Vec<StepOutcome>) {
        self.dispatch_inner(plan, cancel, progress, max_retries)
    }

    fn dispatch_inner(
        &self,
        plan: &Plan,
        cancel: &CancelToken,
        progress: &mut dyn FnMut(String),
        max_retries_override: Option<u32>,
    ) -> (DispatchSummary, Vec<StepOutcome>) {
        let mut outcomes: Vec<StepOutcome> = Vec::new();
        let mut context: Map<String, Value> = Map::new();
        let mut failed_steps: BTreeSet<u32> = BTreeSet::new();
        let mut aborted = false;

        for step in &plan.steps {
            if aborted || cancel.is_cancelled() {
                let outcome = skipped_outcome(step, "plan aborted");
                self.emit(&outcome);
                outcomes.push(outcome);
                continue;
            }

            // Skip steps depending on a failed step; record as skipped.
            if let Some(failed_dep) = step.dependencies.iter().find(|d| failed_steps.contains(d)) {
                let outcome = skipped_outcome(
                    step,
                    &format!("skipped because step {failed_dep} failed"),
                );
                progress(format!(
                    "Step {}: skipped (depends on failed step {failed_dep})\n",
                    step.step_number
                ));
                failed_steps.insert(step.step_number);
                self.emit(&outcome);
                outcomes.push(outcome);
                continue;
            }

            progress(format!(
                "Step {}/{}: {}\n",
                step.step_number,
                plan.steps.len(),
                step.description
            ));
            let outcome = self.execute_step_with_retries(
                step,
                &context,
                cancel,
                progress,
                max_retries_override,
            );

            if outcome.success {
                if let Some(data) = &outcome.data {
                    context.insert(format!("step_{}_result", step.step_number), data.clone());
                }
                progress(format!("Step {}: ✅ completed\n", step.step_number));
            } else {
                failed_steps.insert(step.step_number);
                progress(format!(
                    "Step {}: ❌ failed{}\n",
                    step.step_number,
                    outcome
                        .error
                        .as_deref()
                        .map(|e| format!(" ({e})"))
                        .unwrap_or_default()
                ));
                // Fatal errors stop the remaining plan.
                if outcome
                    .error
                    .as_deref()
                    .is_some_and(|e| e.to_lowercase().contains("fatal"))
                {
                    progress("Fatal error: aborting remaining steps\n".to_string());
                    aborted = true;
                }
            }

            self.emit(&outcome);
            outcomes.push(outcome);
        }

        (summarize(&outcomes), outcomes)
    }

    fn execute_step_with_retries(
        &self,
        step: &PlanStep,
        context: &Map<String, Value>,
        cancel: &CancelToken,
        progress: &mut dyn FnMut(String),
        max_retries_override: Option<u32>,
    ) -> StepOutcome {
        let max_attempts = max_retries_override.unwrap_or(self.policy.max_retries) + 1;
        let mut attempts: Vec<AttemptResult> = Vec::new();
        let mut last: Option<ExecutionRecord> = None;

        for attempt in 1..=max_attempts {
            // An alternative applies from the second attempt on, keyed by
            // the previous failure's action type. Once substituted it stays
            // in force for the remaining retries of this step.
            let alternative = if attempt > 1 {
                last.as_ref()
                    .and_then(|record| self.policy.alternatives.get(&record.action_type))
                    .cloned()
                    .or_else(|| {
                        attempts
                            .last()
                            .and_then(|a| a.alternative_action.clone())
                    })
            } else {
                None
            };
            if attempt > 1 {
                match &alternative {
                    Some(alt) => progress(format!(
                        "Retry {attempt}/{max_attempts}: using alternative action {alt}\n"
                    )),
                    None => progress(format!("Retry {attempt}/{max_attempts}\n")),
                }
            }

            let record =
                self.executor
                    .execute_step(step, context, alternative.as_deref(), None);

            attempts.push(AttemptResult {
                attempt_number: attempt,
                success: record.success,
                verified: record.verified,
                action_type: record.action_type.clone(),
                used_alternative: alternative.is_some(),
                alternative_action: alternative.clone(),
                error: record.error.clone(),
                execution_time_ms: record.execution_time_ms,
            });

            let permanent = !record.success && is_permanent(&record);
            let succeeded = record.success;
            last = Some(record);

            if succeeded {
                break;
            }
            if permanent {
                progress(format!(
                    "Step {}: permanent error, not retrying\n",
                    step.step_number
                ));
                break;
            }
            if attempt < max_attempts {
                let backoff = self.policy.backoff_for_attempt(attempt);
                progress(format!(
                    "Waiting {:.1}s before retry...\n",
                    backoff.as_secs_f64()
                ));
                if self.sleeper.sleep(backoff, cancel) {
                    // Cancelled mid-backoff; stop the retry loop.
                    break;
                }
            }
        }

        let total_time: u64 = attempts.iter().map(|a| a.execution_time_ms).sum();
        match last {
            Some(record) => StepOutcome {
                step_number: step.step_number,
                step_description: step.description.clone(),
                success: record.success,
                message: record.message,
                data: record.data,
                error: record.error,
                execution_time_ms: total_time,
                verified: record.verified,
                verification_message: record.verification_message,
                attempts,
            },
            None => StepOutcome {
                step_number: step.step_number,
                step_description: step.description.clone(),
                success: false,
                message: "no attempt was executed".to_string(),
                data: None,
                error: Some("no attempt was executed".to_string()),
                execution_time_ms: 0,
                verified: false,
                verification_message: None,
                attempts,
            },
        }
    }

    fn emit(&self, outcome: &StepOutcome) {
        let subscribers = self.subscribers.lock().expect("subscriber lock poisoned");
        for callback in subscribers.iter() {
            let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                callback(outcome);
            }));
            if result.is_err() {
                // Subscriber failures never interrupt dispatch.
            }
        }
    }
}

/// Classify a failed attempt. Adapter failures consult the adapter marker
/// list on the error text; verification failures consult the verifier list
/// on the verification message.
fn is_permanent(record: &ExecutionRecord) -> bool {
    if !record.adapter_success {
        let error = record.error.as_deref().unwrap_or_default().to_lowercase();
        return PERMANENT_ADAPTER_MARKERS
            .iter()
            .any(|marker| error.contains(marker));
    }
    if !record.verified {
        let message = record
            .verification_message
            .as_deref()
            .unwrap_or_default()
            .to_lowercase();
        return PERMANENT_VERIFIER_MARKERS
            .iter()
            .any(|marker| message.contains(marker));
    }
    false
}

fn skipped_outcome(step: &PlanStep, reason: &str) -> StepOutcome {
    StepOutcome {
        step_number: step.step_number,
        step_description: step.description.clone(),
        success: false,
        message: reason.to_string(),
        data: None,
        error: Some(reason.to_string()),
        execution_time_ms: 0,
        verified: false,
        verification_message: None,
        attempts: Vec::new(),
    }
}

fn summarize(outcomes: &[StepOutcome]) -> DispatchSummary {
    let completed = outcomes.iter().filter(|o| o.success).count();
    let skipped = outcomes
        .iter()
        .filter(|o| o.attempts.is_empty() && !o.success)
        .count();
    let failed = outcomes.len() - completed - skipped;
    let total_retries = outcomes
        .iter()
        .map(|o| o.attempts.len().saturating_sub(1))
        .sum();
    DispatchSummary {
        total_steps: outcomes.len(),
        completed,
        failed,
        skipped,
        total_retries,
        total_execution_time_ms: outcomes.iter().map(|o| o.execution_time_ms).sum(),
        success: failed == 0 && skipped == 0,
    }
}

/// Mark step status from an outcome, used by callers that keep the plan.
pub fn status_for_outcome(outcome: &StepOutcome) -> StepStatus {
    if outcome.success {
        StepStatus::Completed
    } else if outcome.attempts.is_empty() {
        StepStatus::Skipped
    } else {
        StepStatus::Failed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::verifier::StepVerifier;
    use spectral_core::ActionResult;
    use spectral_testkit::{RecordingSleeper, ScriptedHost};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn plan_of(steps: Vec<PlanStep>) -> Plan {
        Plan::new("test", "test", steps)
    }

    fn step(number: u32, tool: &str) -> PlanStep {
        let mut step = PlanStep::new(number, &format!("Use {tool} for step {number}"));
        step.required_tools = vec![tool.to_string()];
        step
    }

    fn dispatcher_with(
        host: Arc<ScriptedHost>,
        policy: RetryPolicy,
        sleeper: Arc<RecordingSleeper>,
    ) -> Dispatcher {
        let executor = Arc::new(
            ExecutorServer::new(host, StepVerifier::new()).with_verification(false),
        );
        Dispatcher::new(executor, policy).with_sleeper(sleeper)
    }

    #[test]
    fn zero_max_retries_yields_exactly_one_attempt() {
        let host = Arc::new(ScriptedHost::with_standard_catalog());
        host.script(
            "typing_type_text",
            ActionResult::fail("typing_type_text", "transient glitch"),
        );
        let sleeper = Arc::new(RecordingSleeper::default());
        let policy = RetryPolicy {
            max_retries: 0,
            backoff_base_seconds: 1.0,
            alternatives: BTreeMap::new(),
        };
        let dispatcher = dispatcher_with(host, policy, sleeper.clone());
        let plan = plan_of(vec![step(1, "typing_type_text")]);
        let (summary, outcomes) = dispatcher.dispatch(&plan, &CancelToken::new());
        assert_eq!(outcomes[0].attempts.len(), 1);
        assert!(!summary.success);
        assert!(sleeper.sleeps().is_empty());
    }

    #[test]
    fn backoff_sleeps_double_per_attempt() {
        let host = Arc::new(ScriptedHost::with_standard_catalog());
        for _ in 0..4 {
            host.script(
                "typing_type_text",
                ActionResult::fail("typing_type_text", "transient glitch"),
            );
        }
        let sleeper = Arc::new(RecordingSleeper::default());
        let policy = RetryPolicy {
            max_retries: 3,
            backoff_base_seconds: 1.0,
            alternatives: BTreeMap::new(),
        };
        let dispatcher = dispatcher_with(host, policy, sleeper.clone());
        let plan = plan_of(vec![step(1, "typing_type_text")]);
        let (_, outcomes) = dispatcher.dispatch(&plan, &CancelToken::new());
        assert_eq!(outcomes[0].attempts.len(), 4);
        assert_eq!(
            sleeper.sleeps(),
            vec![
                Duration::from_secs(1),
                Duration::from_secs(2),
                Duration::from_secs(4)
            ]
        );
    }

    #[test]
    fn alternative_action_is_used_from_second_attempt() {
        let host = Arc::new(ScriptedHost::with_standard_catalog());
        host.script(
            "file_create",
            ActionResult::fail("file_create", "transient disk pressure"),
        );
        host.script(
            "powershell_execute",
            ActionResult::fail("powershell_execute", "transient shell hiccup"),
        );
        host.script(
            "powershell_execute",
            ActionResult::ok("powershell_execute", "created via shell"),
        );
        let sleeper = Arc::new(RecordingSleeper::default());
        let mut alternatives = BTreeMap::new();
        alternatives.insert("file_create".to_string(), "powershell_execute".to_string());
        let policy = RetryPolicy {
            max_retries: 3,
            backoff_base_seconds: 1.0,
            alternatives,
        };
        let dispatcher = dispatcher_with(host.clone(), policy, sleeper.clone());
        let mut s = step(1, "file_create");
        s.description = "Use file_create to create /tmp/s/hello.txt with contents 'hi'".to_string();
        let plan = plan_of(vec![s]);
        let (summary, outcomes) = dispatcher.dispatch(&plan, &CancelToken::new());

        assert!(summary.success);
        let attempts = &outcomes[0].attempts;
        assert_eq!(attempts.len(), 3);
        assert!(!attempts[0].used_alternative);
        assert!(attempts[1].used_alternative);
        assert_eq!(
            attempts[1].alternative_action.as_deref(),
            Some("powershell_execute")
        );
        assert!(attempts[2].used_alternative);
        assert!(attempts[2].success);
        assert_eq!(
            sleeper.sleeps(),
            vec![Duration::from_secs(1), Duration::from_secs(2)]
        );
    }

    #[test]
    fn permanent_error_halts_retries_without_backoff() {
        let host = Arc::new(ScriptedHost::with_standard_catalog());
        host.script(
            "file_delete",
            ActionResult::fail("file_delete", "permission denied"),
        );
        let sleeper = Arc::new(RecordingSleeper::default());
        let dispatcher = dispatcher_with(host, RetryPolicy::default(), sleeper.clone());
        let plan = plan_of(vec![step(1, "file_delete")]);
        let (summary, outcomes) = dispatcher.dispatch(&plan, &CancelToken::new());

        assert!(!summary.success);
        assert_eq!(outcomes[0].attempts.len(), 1);
        assert!(sleeper.sleeps().is_empty());
    }

    #[test]
    fn fatal_error_aborts_remaining_steps_as_skipped() {
        let host = Arc::new(ScriptedHost::with_standard_catalog());
        for _ in 0..3 {
            host.script(
                "typing_type_text",
                ActionResult::fail("typing_type_text", "fatal: device on fire"),
            );
        }
        let dispatcher = dispatcher_with(
            host,
            RetryPolicy {
                max_retries: 2,
                backoff_base_seconds: 1.0,
                alternatives: BTreeMap::new(),
            },
            Arc::new(RecordingSleeper::default()),
        );
        let plan = plan_of(vec![step(1, "typing_type_text"), step(2, "file_list")]);
        let (summary, outcomes) = dispatcher.dispatch(&plan, &CancelToken::new());

        assert_eq!(summary.skipped, 1);
        assert!(!outcomes[1].success);
        assert!(outcomes[1].attempts.is_empty());
    }

    #[test]
    fn dependent_step_is_skipped_when_dependency_fails() {
        let host = Arc::new(ScriptedHost::with_standard_catalog());
        host.script(
            "file_delete",
            ActionResult::fail("file_delete", "permission denied"),
        );
        let dispatcher = dispatcher_with(
            host,
            RetryPolicy::default(),
            Arc::new(RecordingSleeper::default()),
        );
        let mut dependent = step(2, "file_list");
        dependent.dependencies = vec![1];
        let plan = plan_of(vec![step(1, "file_delete"), dependent]);
        let (summary, outcomes) = dispatcher.dispatch(&plan, &CancelToken::new());

        assert_eq!(summary.failed, 1);
        assert_eq!(summary.skipped, 1);
        assert_eq!(status_for_outcome(&outcomes[1]), StepStatus::Skipped);
        assert!(outcomes[1].message.contains("step 1 failed"));
    }

    #[test]
    fn independent_step_continues_after_failure() {
        let host = Arc::new(ScriptedHost::with_standard_catalog());
        host.script(
            "file_delete",
            ActionResult::fail("file_delete", "permission denied"),
        );
        let dispatcher = dispatcher_with(
            host,
            RetryPolicy::default(),
            Arc::new(RecordingSleeper::default()),
        );
        let plan = plan_of(vec![step(1, "file_delete"), step(2, "file_list")]);
        let (summary, outcomes) = dispatcher.dispatch(&plan, &CancelToken::new());
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.completed, 1);
        assert!(outcomes[1].success);
    }

    #[test]
    fn subscribers_observe_outcomes_in_order_and_panics_are_contained() {
        let host = Arc::new(ScriptedHost::with_standard_catalog());
        let dispatcher = dispatcher_with(
            host,
            RetryPolicy::default(),
            Arc::new(RecordingSleeper::default()),
        );
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_clone = seen.clone();
        dispatcher.subscribe(move |outcome| {
            seen_clone
                .lock()
                .expect("seen lock")
                .push(outcome.step_number);
        });
        dispatcher.subscribe(|_| panic!("bad subscriber"));

        let plan = plan_of(vec![step(1, "file_list"), step(2, "typing_type_text")]);
        let (summary, _) = dispatcher.dispatch(&plan, &CancelToken::new());
        assert!(summary.success);
        assert_eq!(*seen.lock().expect("seen lock"), vec![1, 2]);
    }

    #[test]
    fn cancellation_during_backoff_stops_the_loop() {
        let host = Arc::new(ScriptedHost::with_standard_catalog());
        for _ in 0..4 {
            host.script(
                "typing_type_text",
                ActionResult::fail("typing_type_text", "transient"),
            );
        }
        struct CancellingSleeper(AtomicUsize);
        impl Sleeper for CancellingSleeper {
            fn sleep(&self, _d: Duration, _cancel: &CancelToken) -> bool {
                self.0.fetch_add(1, Ordering::SeqCst);
                true // report cancellation on first backoff
            }
        }
        let executor = Arc::new(
            ExecutorServer::new(host, StepVerifier::new()).with_verification(false),
        );
        let dispatcher = Dispatcher::new(
            executor,
            RetryPolicy {
                max_retries: 3,
                backoff_base_seconds: 1.0,
                alternatives: BTreeMap::new(),
            },
        )
        .with_sleeper(Arc::new(CancellingSleeper(AtomicUsize::new(0))));
        let plan = plan_of(vec![step(1, "typing_type_text")]);
        let (_, outcomes) = dispatcher.dispatch(&plan, &CancelToken::new());
        assert_eq!(outcomes[0].attempts.len(), 1);
    }

    #[test]
    fn streaming_dispatch_reports_retries() {
        let host = Arc::new(ScriptedHost::with_standard_catalog());
        host.script_flaky("typing_type_text", 1, "transient glitch");
        let dispatcher = dispatcher_with(
            host,
            RetryPolicy {
                max_retries: 2,
                backoff_base_seconds: 1.0,
                alternatives: BTreeMap::new(),
            },
            Arc::new(RecordingSleeper::default()),
        );
        let plan = plan_of(vec![step(1, "typing_type_text")]);
        let mut chunks = Vec::new();
        let (summary, _) =
            dispatcher.dispatch_stream(&plan, &CancelToken::new(), &mut |c| chunks.push(c));
        assert!(summary.success);
        let joined = chunks.join("");
        assert!(joined.contains("Retry 2/3"));
        assert!(joined.contains("✅ completed"));
    }
}
