use crate::verifier::StepVerifier;
use regex::Regex;
use serde_json::{json, Map, Value};
use spectral_core::PlanStep;
use spectral_tools::ActionHost;
use std::sync::{Arc, OnceLock};

/// Result of executing one step attempt: the adapter outcome joined with
/// the verification outcome. `success` is the conjunction of adapter
/// success and (verification disabled or verified); advisory verification
/// mismatches do not demote success.
#[derive(Debug, Clone)]
pub struct ExecutionRecord {
    pub success: bool,
    pub adapter_success: bool,
    pub action_type: String,
    pub message: String,
    pub data: Option<Value>,
    pub error: Option<String>,
    pub execution_time_ms: u64,
    pub verified: bool,
    pub verification_message: Option<String>,
}

/// Maps a plan step to a concrete registry call: picks the action from
/// `required_tools[0]` (or the dispatcher's alternative), synthesizes
/// params from the step description and execution context, routes, and
/// verifies the side effect.
pub struct ExecutorServer {
    tools: Arc<dyn ActionHost>,
    verifier: StepVerifier,
    verification_enabled: bool,
}

impl ExecutorServer {
    pub fn new(tools: Arc<dyn ActionHost>, verifier: StepVerifier) -> Self {
        Self {
            tools,
            verifier,
            verification_enabled: true,
        }
    }

    pub fn with_verification(mut self, enabled: bool) -> Self {
        self.verification_enabled = enabled;
        self
    }

    pub fn execute_step(
        &self,
        step: &PlanStep,
        context: &Map<String, Value>,
        action_override: Option<&str>,
        param_overrides: Option<&Value>,
    ) -> ExecutionRecord {
        let original_action = step.required_tools.first().map(String::as_str);
        let action_type = action_override.or(original_action);
        let Some(action_type) = action_type else {
            return ExecutionRecord {
                success: false,
                adapter_success: false,
                action_type: "unknown".to_string(),
                message: "step has no required tools".to_string(),
                data: None,
                error: Some("step has no required tools".to_string()),
                execution_time_ms: 0,
                verified: false,
                verification_message: None,
            };
        };

        let params = synthesize_params(
            action_type,
            original_action,
            &step.description,
            context,
            param_overrides,
        );
        let result = self.tools.route(action_type, &params);

        let (verified, verification_message, advisory) =
            if self.verification_enabled && result.success {
                let vr = self
                    .verifier
                    .verify(action_type, result.data.as_ref(), &params);
                let advisory = vr
                    .details
                    .as_ref()
                    .and_then(|d| d.get("advisory"))
                    .and_then(Value::as_bool)
                    .unwrap_or(false);
                let message = vr.error.clone().unwrap_or_else(|| vr.message.clone());
                (vr.verified, Some(message), advisory)
            } else {
                (result.success, None, false)
            };

        ExecutionRecord {
            success: result.success && (!self.verification_enabled || verified || advisory),
            adapter_success: result.success,
            action_type: result.action_type,
            message: result.message,
            data: result.data,
            error: result.error,
            execution_time_ms: result.execution_time_ms,
            verified,
            verification_message,
        }
    }
}

fn quoted_strings(text: &str) -> Vec<String> {
    static QUOTED: OnceLock<Regex> = OnceLock::new();
    let re = QUOTED.get_or_init(|| Regex::new(r#"'([^']*)'|"([^"]*)""#).expect("quote pattern"));
    re.captures_iter(text)
        .filter_map(|caps| {
            caps.get(1)
                .or_else(|| caps.get(2))
                .map(|m| m.as_str().to_string())
        })
        .collect()
}

fn absolute_paths(text: &str) -> Vec<String> {
    static PATHS: OnceLock<Regex> = OnceLock::new();
    let re = PATHS.get_or_init(|| {
        Regex::new(r"(?:[A-Za-z]:\\[^\s'\x22,;]+|/[^\s'\x22,;]+)").expect("path pattern")
    });
    re.find_iter(text)
        .map(|m| m.as_str().trim_end_matches(['.', ':']).to_string())
        .collect()
}

fn coordinates(text: &str) -> Option<(i64, i64)> {
    static COORDS: OnceLock<Regex> = OnceLock::new();
    let re = COORDS
        .get_or_init(|| Regex::new(r"\((\d+)\s*,\s*(\d+)\)").expect("coordinate pattern"));
    let caps = re.captures(text)?;
    Some((caps[1].parse().ok()?, caps[2].parse().ok()?))
}

/// First path mentioned in the description, falling back to any `path`
/// carried by prior step results in the context.
fn path_from_description(description: &str, context: &Map<String, Value>) -> Option<String> {
    if let Some(path) = absolute_paths(description).into_iter().next() {
        return Some(path);
    }
    for value in context.values() {
        if let Some(path) = value.get("path").and_then(Value::as_str) {
            return Some(path.to_string());
        }
    }
    None
}

/// Content payload: a quoted string that is not itself the path.
fn content_from_description(description: &str, path: Option<&str>) -> Option<String> {
    quoted_strings(description)
        .into_iter()
        .find(|candidate| Some(candidate.as_str()) != path)
}

pub(crate) fn synthesize_params(
    action_type: &str,
    original_action: Option<&str>,
    description: &str,
    context: &Map<String, Value>,
    overrides: Option<&Value>,
) -> Value {
    let mut params = Map::new();
    let path = path_from_description(description, context);

    match action_type {
        "file_create" | "file_read" | "file_delete" | "file_create_directory"
        | "file_delete_directory" => {
            if let Some(path) = &path {
                params.insert("path".to_string(), json!(path));
            }
            if action_type == "file_create" {
                if let Some(content) = content_from_description(description, path.as_deref()) {
                    params.insert("content".to_string(), json!(content));
                }
            }
        }
        "file_list" => {
            let directory = path.clone().unwrap_or_else(|| {
                spectral_core::home_dir()
                    .unwrap_or_else(std::env::temp_dir)
                    .to_string_lossy()
                    .to_string()
            });
            params.insert("directory".to_string(), json!(directory));
        }
        "file_move" | "file_copy" => {
            let paths = absolute_paths(description);
            if let Some(source) = paths.first() {
                params.insert("source".to_string(), json!(source));
            }
            if let Some(destination) = paths.get(1) {
                params.insert("destination".to_string(), json!(destination));
            }
        }
        "gui_move_mouse" | "gui_click_mouse" => {
            if let Some((x, y)) = coordinates(description) {
                params.insert("x".to_string(), json!(x));
                params.insert("y".to_string(), json!(y));
            }
        }
        "typing_type_text" => {
            if let Some(text) = quoted_strings(description).into_iter().next() {
                params.insert("text".to_string(), json!(text));
            } else {
                params.insert("text".to_string(), json!(description));
            }
        }
        "powershell_execute" | "subprocess_execute" => {
            let command =
                alternative_command(action_type, original_action, description, path.as_deref())
                    .or_else(|| quoted_strings(description).into_iter().next())
                    .unwrap_or_else(|| description.to_string());
            params.insert("command".to_string(), json!(command));
        }
        "subprocess_open_application" => {
            let application = quoted_strings(description)
                .into_iter()
                .next()
                .or_else(|| known_application(description))
                .unwrap_or_else(|| description.to_string());
            params.insert("application_path".to_string(), json!(application));
        }
        "ocr_extract_text" => {
            if let Some(path) = &path {
                params.insert("image_path".to_string(), json!(path));
            }
        }
        _ => {}
    }

    // Dispatcher overrides always win.
    if let Some(Value::Object(overrides)) = overrides {
        for (key, value) in overrides {
            params.insert(key.clone(), value.clone());
        }
    }
    Value::Object(params)
}

/// When a shell tool substitutes for a failed file action, synthesize the
/// equivalent command from the original step's parameters, in the dialect
/// of the substituting shell.
fn alternative_command(
    action_type: &str,
    original_action: Option<&str>,
    description: &str,
    path: Option<&str>,
) -> Option<String> {
    let path = path?;
    let powershell = action_type == "powershell_execute";
    match original_action? {
        "file_create" => {
            let content = content_from_description(description, Some(path)).unwrap_or_default();
            Some(if powershell {
                format!("Set-Content -Path '{path}' -Value '{content}'")
            } else {
                format!("printf '%s' '{content}' > '{path}'")
            })
        }
        "file_delete" => Some(if powershell {
            format!("Remove-Item -Path '{path}' -Force")
        } else {
            format!("rm -f '{path}'")
        }),
        "file_create_directory" => Some(if powershell {
            format!("New-Item -ItemType Directory -Path '{path}' -Force")
        } else {
            format!("mkdir -p '{path}'")
        }),
        _ => None,
    }
}

fn known_application(description: &str) -> Option<String> {
    let description = description.to_lowercase();
    for app in ["notepad", "calculator", "calc", "explorer", "firefox", "chrome"] {
        if description.contains(app) {
            return Some(app.to_string());
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use spectral_core::StepStatus;
    use spectral_testkit::ScriptedHost;

    fn step_with(description: &str, tools: &[&str]) -> PlanStep {
        PlanStep {
            step_number: 1,
            description: description.to_string(),
            required_tools: tools.iter().map(|t| t.to_string()).collect(),
            dependencies: vec![],
            safety_flags: vec![],
            estimated_duration: None,
            status: StepStatus::Pending,
        }
    }

    #[test]
    fn synthesizes_path_and_content_for_file_create() {
        let params = synthesize_params(
            "file_create",
            Some("file_create"),
            "Use file_create to create the file /tmp/sandbox/hello.txt with contents 'hi'",
            &Map::new(),
            None,
        );
        assert_eq!(params["path"], "/tmp/sandbox/hello.txt");
        assert_eq!(params["content"], "hi");
    }

    #[test]
    fn synthesizes_coordinates_for_gui() {
        let params = synthesize_params(
            "gui_click_mouse",
            Some("gui_click_mouse"),
            "Use gui_click_mouse to click at coordinates (100, 200)",
            &Map::new(),
            None,
        );
        assert_eq!(params["x"], 100);
        assert_eq!(params["y"], 200);
    }

    #[test]
    fn move_takes_two_paths_in_order() {
        let params = synthesize_params(
            "file_move",
            Some("file_move"),
            "Use file_move to move /tmp/a.txt to /tmp/b.txt",
            &Map::new(),
            None,
        );
        assert_eq!(params["source"], "/tmp/a.txt");
        assert_eq!(params["destination"], "/tmp/b.txt");
    }

    #[test]
    fn alternative_shell_command_reconstructs_file_create() {
        let params = synthesize_params(
            "powershell_execute",
            Some("file_create"),
            "Use file_create to create /tmp/x.txt with contents 'data'",
            &Map::new(),
            None,
        );
        let command = params["command"].as_str().expect("command");
        assert!(command.contains("/tmp/x.txt"));
        assert!(command.contains("data"));
    }

    #[test]
    fn overrides_win_over_synthesis() {
        let params = synthesize_params(
            "file_create",
            Some("file_create"),
            "create /tmp/a.txt",
            &Map::new(),
            Some(&json!({"path": "/tmp/override.txt"})),
        );
        assert_eq!(params["path"], "/tmp/override.txt");
    }

    #[test]
    fn context_supplies_path_when_description_has_none() {
        let mut context = Map::new();
        context.insert(
            "step_1_result".to_string(),
            json!({"path": "/tmp/from-context.txt"}),
        );
        let params = synthesize_params(
            "file_delete",
            Some("file_delete"),
            "delete that file",
            &context,
            None,
        );
        assert_eq!(params["path"], "/tmp/from-context.txt");
    }

    #[test]
    fn step_without_tools_fails_cleanly() {
        let host = Arc::new(ScriptedHost::with_standard_catalog());
        let server = ExecutorServer::new(host, StepVerifier::new());
        let record = server.execute_step(&step_with("do nothing", &[]), &Map::new(), None, None);
        assert!(!record.success);
        assert!(record.error.expect("error").contains("no required tools"));
    }

    #[test]
    fn success_requires_verification_when_enabled() {
        // Scripted host claims success for file_create, but no file exists
        // on disk, so verification fails and the record is unsuccessful.
        let host = Arc::new(ScriptedHost::with_standard_catalog());
        let server = ExecutorServer::new(host.clone(), StepVerifier::new());
        let step = step_with(
            "Use file_create to create /tmp/definitely-missing-spectral/x.txt",
            &["file_create"],
        );
        let record = server.execute_step(&step, &Map::new(), None, None);
        assert!(record.adapter_success);
        assert!(!record.verified);
        assert!(!record.success);

        // With verification disabled the adapter result stands.
        let server = ExecutorServer::new(host, StepVerifier::new()).with_verification(false);
        let record = server.execute_step(&step, &Map::new(), None, None);
        assert!(record.success);
    }
}
