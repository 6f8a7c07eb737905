use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;
use uuid::Uuid;

pub mod cancel;
pub mod proc;
pub mod retry;

pub type Result<T> = anyhow::Result<T>;

/// Memory category names used across the storage layer.
pub const CATEGORY_CONVERSATIONS: &str = "conversations";
pub const CATEGORY_EXECUTIONS: &str = "executions";
pub const CATEGORY_KNOWLEDGE_CHUNKS: &str = "knowledge_chunks";
pub const CATEGORY_PREFERENCES: &str = "preferences";
pub const CATEGORY_TASKS: &str = "tasks";

pub fn home_dir() -> Option<PathBuf> {
    std::env::var("HOME")
        .ok()
        .or_else(|| std::env::var("USERPROFILE").ok())
        .map(PathBuf::from)
}

/// Root for persistent state. `SPECTRAL_DATA_DIR` overrides the default
/// `<home>/.spectral` so tests can redirect everything into a temp dir.
pub fn data_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("SPECTRAL_DATA_DIR") {
        return PathBuf::from(dir);
    }
    home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".spectral")
}

pub fn memory_dir() -> PathBuf {
    data_dir().join("persistent_memory")
}

pub fn tool_knowledge_dir() -> PathBuf {
    data_dir().join("tool_knowledge")
}

pub fn sandbox_runs_dir() -> PathBuf {
    data_dir().join("sandbox_runs")
}

/// Archive root for exported code generations:
/// `<home>/Desktop/spectral` (or under the data dir when redirected).
pub fn archive_root() -> PathBuf {
    if let Ok(dir) = std::env::var("SPECTRAL_DATA_DIR") {
        return PathBuf::from(dir).join("Desktop").join("spectral");
    }
    home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("Desktop")
        .join("spectral")
}

// ── Memory entries ──────────────────────────────────────────────────────────

/// Where an entry came from and when it was touched. `updated_at` moves only
/// through the update path.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Provenance {
    pub module: String,
    pub task_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Provenance {
    pub fn new(module: &str, task_id: Option<&str>) -> Self {
        let now = Utc::now();
        Self {
            module: module.to_string(),
            task_id: task_id.map(str::to_string),
            created_at: now,
            updated_at: now,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MemoryEntry {
    pub id: Uuid,
    pub category: String,
    /// Semantic name, unique within a category.
    pub key: String,
    pub value: serde_json::Value,
    pub entity_type: String,
    pub entity_id: Option<String>,
    pub tags: Vec<String>,
    pub timestamp: DateTime<Utc>,
    pub provenance: Provenance,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationMemory {
    pub turn_id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub user_message: String,
    pub assistant_response: String,
    #[serde(default)]
    pub execution_history: Vec<ExecutionMemory>,
    #[serde(default)]
    pub context_tags: Vec<String>,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub embedding: Option<Vec<f32>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionMemory {
    pub execution_id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub user_request: String,
    /// Semantic summary used by the memory-reference resolver.
    pub description: String,
    #[serde(default)]
    pub code_generated: String,
    #[serde(default)]
    pub file_locations: Vec<String>,
    #[serde(default)]
    pub output: String,
    pub success: bool,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub execution_time_ms: Option<u64>,
    #[serde(default)]
    pub error_message: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemoryKind {
    ToolKnowledge,
    TaskHistory,
    UserPreference,
}

impl MemoryKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ToolKnowledge => "tool_knowledge",
            Self::TaskHistory => "task_history",
            Self::UserPreference => "user_preference",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim() {
            "tool_knowledge" => Some(Self::ToolKnowledge),
            "task_history" => Some(Self::TaskHistory),
            "user_preference" => Some(Self::UserPreference),
            _ => None,
        }
    }
}

/// A sentence-aligned, overlapping slice of an ingested document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocumentChunk {
    pub chunk_id: Uuid,
    pub content: String,
    pub chunk_index: usize,
    pub source_doc: String,
    pub memory_type: MemoryKind,
    #[serde(default)]
    pub metadata: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

// ── Plans ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StepStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
    Skipped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SafetyFlag {
    Destructive,
    NetworkAccess,
    FileModification,
    SystemCommand,
    ExternalDependency,
}

impl SafetyFlag {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim() {
            "destructive" => Some(Self::Destructive),
            "network_access" => Some(Self::NetworkAccess),
            "file_modification" => Some(Self::FileModification),
            "system_command" => Some(Self::SystemCommand),
            "external_dependency" => Some(Self::ExternalDependency),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Destructive => "destructive",
            Self::NetworkAccess => "network_access",
            Self::FileModification => "file_modification",
            Self::SystemCommand => "system_command",
            Self::ExternalDependency => "external_dependency",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanStep {
    /// 1-based and contiguous after validation.
    pub step_number: u32,
    pub description: String,
    pub required_tools: Vec<String>,
    /// Strictly smaller step numbers.
    pub dependencies: Vec<u32>,
    #[serde(default)]
    pub safety_flags: Vec<SafetyFlag>,
    #[serde(default)]
    pub estimated_duration: Option<String>,
    pub status: StepStatus,
}

impl PlanStep {
    pub fn new(step_number: u32, description: &str) -> Self {
        Self {
            step_number,
            description: description.to_string(),
            required_tools: Vec::new(),
            dependencies: Vec::new(),
            safety_flags: Vec::new(),
            estimated_duration: None,
            status: StepStatus::Pending,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PlanValidationResult {
    pub is_valid: bool,
    #[serde(default)]
    pub issues: Vec<String>,
    #[serde(default)]
    pub warnings: Vec<String>,
    #[serde(default)]
    pub safety_concerns: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Plan {
    /// Unique, monotone-prefixed (UUIDv7 carries the timestamp ordering).
    pub plan_id: String,
    pub user_input: String,
    pub description: String,
    pub steps: Vec<PlanStep>,
    #[serde(default)]
    pub validation_result: Option<PlanValidationResult>,
    pub is_safe: bool,
    pub generated_at: DateTime<Utc>,
    #[serde(default)]
    pub verified_at: Option<DateTime<Utc>>,
}

impl Plan {
    pub fn new(user_input: &str, description: &str, steps: Vec<PlanStep>) -> Self {
        Self {
            plan_id: format!("plan-{}", Uuid::now_v7()),
            user_input: user_input.to_string(),
            description: description.to_string(),
            steps,
            validation_result: None,
            is_safe: true,
            generated_at: Utc::now(),
            verified_at: None,
        }
    }

    pub fn is_valid(&self) -> bool {
        self.validation_result
            .as_ref()
            .map(|v| v.is_valid)
            .unwrap_or(false)
    }

    pub fn is_valid_and_safe(&self) -> bool {
        self.is_valid() && self.is_safe
    }
}

// ── Execution outcomes ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttemptResult {
    /// 1-based.
    pub attempt_number: u32,
    pub success: bool,
    pub verified: bool,
    pub action_type: String,
    pub used_alternative: bool,
    #[serde(default)]
    pub alternative_action: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
    pub execution_time_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepOutcome {
    pub step_number: u32,
    pub step_description: String,
    pub success: bool,
    pub message: String,
    #[serde(default)]
    pub data: Option<serde_json::Value>,
    #[serde(default)]
    pub error: Option<String>,
    pub execution_time_ms: u64,
    pub verified: bool,
    #[serde(default)]
    pub verification_message: Option<String>,
    #[serde(default)]
    pub attempts: Vec<AttemptResult>,
}

// ── Tool adapter contract ───────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionResult {
    pub success: bool,
    pub action_type: String,
    pub message: String,
    #[serde(default)]
    pub data: Option<serde_json::Value>,
    #[serde(default)]
    pub error: Option<String>,
    pub execution_time_ms: u64,
}

impl ActionResult {
    pub fn ok(action_type: &str, message: impl Into<String>) -> Self {
        Self {
            success: true,
            action_type: action_type.to_string(),
            message: message.into(),
            data: None,
            error: None,
            execution_time_ms: 0,
        }
    }

    pub fn fail(action_type: &str, error: impl Into<String>) -> Self {
        let error = error.into();
        Self {
            success: false,
            action_type: action_type.to_string(),
            message: format!("{action_type} failed"),
            data: None,
            error: Some(error),
            execution_time_ms: 0,
        }
    }

    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = Some(data);
        self
    }

    pub fn with_elapsed_ms(mut self, elapsed: u64) -> Self {
        self.execution_time_ms = elapsed;
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerificationResult {
    pub verified: bool,
    pub action_type: String,
    pub message: String,
    #[serde(default)]
    pub details: Option<serde_json::Value>,
    #[serde(default)]
    pub error: Option<String>,
}

impl VerificationResult {
    pub fn pass(action_type: &str, message: impl Into<String>) -> Self {
        Self {
            verified: true,
            action_type: action_type.to_string(),
            message: message.into(),
            details: None,
            error: None,
        }
    }

    pub fn fail(action_type: &str, error: impl Into<String>) -> Self {
        let error = error.into();
        Self {
            verified: false,
            action_type: action_type.to_string(),
            message: format!("verification failed for {action_type}"),
            details: None,
            error: Some(error),
        }
    }

    /// Verification does not apply to this action type or platform.
    pub fn skip(action_type: &str, reason: impl Into<String>) -> Self {
        Self {
            verified: true,
            action_type: action_type.to_string(),
            message: reason.into(),
            details: Some(serde_json::json!({"skipped": true})),
            error: None,
        }
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }
}

// ── Sandbox runs ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SandboxStatus {
    Created,
    SyntaxChecked,
    Tested,
    Smoked,
    Success,
    SyntaxError,
    TestFailure,
    Timeout,
    Error,
}

impl SandboxStatus {
    pub fn is_terminal_failure(&self) -> bool {
        matches!(
            self,
            Self::SyntaxError | Self::TestFailure | Self::Timeout | Self::Error
        )
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct GatesPassed {
    pub syntax: bool,
    pub tests: bool,
    pub smoke: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxResult {
    pub run_id: String,
    pub status: SandboxStatus,
    #[serde(default)]
    pub code_path: Option<PathBuf>,
    #[serde(default)]
    pub test_paths: Vec<PathBuf>,
    #[serde(default)]
    pub stdout: String,
    #[serde(default)]
    pub stderr: String,
    #[serde(default)]
    pub exit_code: Option<i32>,
    #[serde(default)]
    pub pytest_summary: Option<String>,
    #[serde(default)]
    pub error_message: Option<String>,
    #[serde(default)]
    pub gates_passed: GatesPassed,
    pub duration_seconds: f64,
}

// ── Configuration ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub llm: LlmConfig,
    pub retry: RetryConfig,
    pub paths: PathPolicyConfig,
    pub rag: RagConfig,
    pub sandbox: SandboxConfig,
    pub memory: MemoryConfig,
    pub safety: SafetyConfig,
}

impl AppConfig {
    pub fn config_path() -> PathBuf {
        data_dir().join("config.toml")
    }

    pub fn load() -> Result<Self> {
        let path = Self::config_path();
        if !path.exists() {
            return Ok(Self::default());
        }
        let raw = fs::read_to_string(path)?;
        Ok(toml::from_str(&raw)?)
    }

    pub fn ensure() -> Result<Self> {
        let path = Self::config_path();
        if path.exists() {
            return Self::load();
        }
        let cfg = Self::default();
        cfg.save()?;
        Ok(cfg)
    }

    pub fn save(&self) -> Result<()> {
        let path = Self::config_path();
        fs::create_dir_all(
            path.parent()
                .ok_or_else(|| anyhow::anyhow!("invalid config path"))?,
        )?;
        fs::write(path, toml::to_string_pretty(self)?)?;
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    pub model: String,
    pub endpoint: String,
    pub api_key_env: String,
    pub temperature: f32,
    pub max_tokens: u32,
    pub timeout_seconds: u64,
    pub max_retries: u8,
    pub retry_base_ms: u64,
    pub stream: bool,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            model: "spectral-chat".to_string(),
            endpoint: "http://127.0.0.1:11434/v1/chat/completions".to_string(),
            api_key_env: "SPECTRAL_API_KEY".to_string(),
            temperature: 0.2,
            max_tokens: 4096,
            timeout_seconds: 60,
            max_retries: 3,
            retry_base_ms: 400,
            stream: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Max retries per plan step (attempts = max_retries + 1).
    pub action_max_retries: u32,
    /// Base backoff in seconds; actual backoff is `base * 2^(attempt-1)`.
    pub backoff_base_seconds: f64,
    /// Attempt ceiling for the code-generation path.
    pub code_max_attempts: u32,
    /// Static alternative-action table, keyed by failing action type.
    pub alternatives: BTreeMap<String, String>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        let mut alternatives = BTreeMap::new();
        alternatives.insert(
            "file_create".to_string(),
            "powershell_execute".to_string(),
        );
        alternatives.insert(
            "subprocess_open_application".to_string(),
            "powershell_execute".to_string(),
        );
        Self {
            action_max_retries: 3,
            backoff_base_seconds: 1.0,
            code_max_attempts: 10,
            alternatives,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct PathPolicyConfig {
    /// Allowed filesystem roots for adapters. Empty allows nothing.
    pub allow: Vec<String>,
    /// Denied roots; deny takes precedence over allow.
    pub deny: Vec<String>,
    pub dry_run: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RagConfig {
    pub chunk_size: usize,
    pub chunk_overlap: usize,
    pub top_k: usize,
    pub snippet_len: usize,
}

impl Default for RagConfig {
    fn default() -> Self {
        Self {
            chunk_size: 500,
            chunk_overlap: 50,
            top_k: 3,
            snippet_len: 150,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxConfig {
    pub python_bin: String,
    pub syntax_timeout_seconds: u64,
    pub test_timeout_seconds: u64,
    pub smoke_timeout_seconds: u64,
    pub keep_failed_runs: bool,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            python_bin: "python3".to_string(),
            syntax_timeout_seconds: 5,
            test_timeout_seconds: 30,
            smoke_timeout_seconds: 5,
            keep_failed_runs: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryConfig {
    /// `sqlite` or `json`.
    pub backend: String,
    pub conversation_context_turns: usize,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            backend: "sqlite".to_string(),
            conversation_context_turns: 5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SafetyConfig {
    pub enable_safety_validation: bool,
    pub enable_verification: bool,
}

impl Default for SafetyConfig {
    fn default() -> Self {
        Self {
            enable_safety_validation: true,
            enable_verification: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plan_ids_are_monotone() {
        let a = Plan::new("one", "", vec![]);
        let b = Plan::new("two", "", vec![]);
        assert!(a.plan_id < b.plan_id, "{} !< {}", a.plan_id, b.plan_id);
    }

    #[test]
    fn safety_flags_round_trip() {
        for flag in [
            SafetyFlag::Destructive,
            SafetyFlag::NetworkAccess,
            SafetyFlag::FileModification,
            SafetyFlag::SystemCommand,
            SafetyFlag::ExternalDependency,
        ] {
            assert_eq!(SafetyFlag::parse(flag.as_str()), Some(flag));
        }
        assert_eq!(SafetyFlag::parse("telepathy"), None);
    }

    #[test]
    fn step_status_serializes_kebab_case() {
        let json = serde_json::to_string(&StepStatus::InProgress).expect("serialize");
        assert_eq!(json, "\"in-progress\"");
    }

    #[test]
    fn memory_entry_round_trips_losslessly() {
        let entry = MemoryEntry {
            id: Uuid::now_v7(),
            category: CATEGORY_EXECUTIONS.to_string(),
            key: "exec-1".to_string(),
            value: serde_json::json!({"code_generated": "print(1)", "nested": {"k": [1, 2]}}),
            entity_type: "execution".to_string(),
            entity_id: Some("abc".to_string()),
            tags: vec!["python".to_string(), "cli".to_string()],
            timestamp: Utc::now(),
            provenance: Provenance::new("memory", Some("task-9")),
        };
        let json = serde_json::to_string(&entry).expect("serialize");
        let back: MemoryEntry = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(entry, back);
    }

    #[test]
    fn default_config_round_trips_through_toml() {
        let cfg = AppConfig::default();
        let raw = toml::to_string_pretty(&cfg).expect("serialize");
        let back: AppConfig = toml::from_str(&raw).expect("deserialize");
        assert_eq!(back.retry.action_max_retries, 3);
        assert_eq!(back.retry.code_max_attempts, 10);
        assert_eq!(back.rag.chunk_size, 500);
        assert!(back.safety.enable_verification);
    }

    #[test]
    fn data_dir_honors_env_override() {
        // Serialize with the other env-dependent tests by using a scoped var.
        let dir = std::env::temp_dir().join(format!("spectral-core-{}", Uuid::now_v7()));
        // SAFETY: test-only environment mutation.
        std::env::set_var("SPECTRAL_DATA_DIR", &dir);
        assert_eq!(data_dir(), dir);
        assert!(memory_dir().starts_with(&dir));
        assert!(sandbox_runs_dir().starts_with(&dir));
        std::env::remove_var("SPECTRAL_DATA_DIR");
    }
}
