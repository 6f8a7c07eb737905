use serde_json::{json, Value};
use spectral_core::VerificationResult;
use spectral_tools::{PointerState, RegistryHive};
use std::path::Path;

/// Pointer checks pass when the live position is within this many pixels
/// of the requested coordinates.
const POINTER_TOLERANCE_PX: i64 = 5;

/// Confirms an action's real-world side effect after execution. Dispatch
/// is a match on the action type; actions without a rule pass as
/// not-applicable.
pub struct StepVerifier {
    pointer: Option<PointerState>,
    registry: Option<RegistryHive>,
}

impl StepVerifier {
    pub fn new() -> Self {
        Self {
            pointer: None,
            registry: None,
        }
    }

    pub fn with_pointer(mut self, pointer: PointerState) -> Self {
        self.pointer = Some(pointer);
        self
    }

    pub fn with_registry(mut self, registry: RegistryHive) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn verify(
        &self,
        action_type: &str,
        result_data: Option<&Value>,
        params: &Value,
    ) -> VerificationResult {
        match action_type {
            "file_create" | "create_file" => self.verify_file_created(action_type, result_data, params),
            "file_create_directory" | "create_directory" => {
                self.verify_directory_created(action_type, result_data, params)
            }
            "file_delete" | "delete_file" => self.verify_absent(action_type, result_data, params, "file"),
            "file_delete_directory" | "delete_directory" => {
                self.verify_absent(action_type, result_data, params, "directory")
            }
            "file_move" | "move_file" => self.verify_moved(action_type, result_data, params),
            "file_copy" | "copy_file" => self.verify_copied(action_type, result_data, params),
            "registry_write_value" => self.verify_registry_write(action_type, params),
            "registry_delete_value" => self.verify_registry_delete(action_type, params),
            "gui_move_mouse" | "gui_click_mouse" => self.verify_pointer(action_type, params),
            other => VerificationResult::skip(other, "verification not applicable"),
        }
    }

    fn path_from(result_data: Option<&Value>, params: &Value, keys: &[&str]) -> Option<String> {
        for source in [result_data, Some(params)].into_iter().flatten() {
            for key in keys {
                if let Some(path) = source.get(key).and_then(Value::as_str) {
                    if !path.trim().is_empty() {
                        return Some(path.trim().to_string());
                    }
                }
            }
        }
        None
    }

    fn verify_file_created(
        &self,
        action: &str,
        result_data: Option<&Value>,
        params: &Value,
    ) -> VerificationResult {
        let Some(path) = Self::path_from(result_data, params, &["path", "file_path"]) else {
            return VerificationResult::fail(action, "no path available to verify");
        };
        let path_ref = Path::new(&path);
        if !path_ref.exists() {
            return VerificationResult::fail(action, format!("file does not exist: {path}"));
        }
        if !path_ref.is_file() {
            return VerificationResult::fail(action, format!("path is not a file: {path}"));
        }
        let size = std::fs::metadata(path_ref).map(|m| m.len()).unwrap_or(0);
        VerificationResult::pass(action, format!("file exists: {path} ({size} bytes)"))
            .with_details(json!({"path": path, "size_bytes": size}))
    }

    fn verify_directory_created(
        &self,
        action: &str,
        result_data: Option<&Value>,
        params: &Value,
    ) -> VerificationResult {
        let Some(path) = Self::path_from(result_data, params, &["path", "directory"]) else {
            return VerificationResult::fail(action, "no path available to verify");
        };
        let path_ref = Path::new(&path);
        if path_ref.is_dir() {
            VerificationResult::pass(action, format!("directory exists: {path}"))
                .with_details(json!({"path": path}))
        } else {
            VerificationResult::fail(action, format!("directory does not exist: {path}"))
        }
    }

    fn verify_absent(
        &self,
        action: &str,
        result_data: Option<&Value>,
        params: &Value,
        kind: &str,
    ) -> VerificationResult {
        let Some(path) = Self::path_from(result_data, params, &["path", "file_path", "directory"])
        else {
            return VerificationResult::fail(action, "no path available to verify");
        };
        if Path::new(&path).exists() {
            VerificationResult::fail(action, format!("{kind} still exists: {path}"))
        } else {
            VerificationResult::pass(action, format!("{kind} is gone: {path}"))
                .with_details(json!({"path": path}))
        }
    }

    fn verify_moved(
        &self,
        action: &str,
        result_data: Option<&Value>,
        params: &Value,
    ) -> VerificationResult {
        let source = Self::path_from(result_data, params, &["source", "from"]);
        let destination = Self::path_from(result_data, params, &["destination", "to"]);
        let (Some(source), Some(destination)) = (source, destination) else {
            return VerificationResult::fail(action, "source/destination unavailable to verify");
        };
        let source_gone = !Path::new(&source).exists();
        let destination_present = Path::new(&destination).exists();
        if source_gone && destination_present {
            VerificationResult::pass(action, format!("moved {source} -> {destination}"))
                .with_details(json!({"source": source, "destination": destination}))
        } else if !source_gone {
            VerificationResult::fail(action, format!("source still exists: {source}"))
        } else {
            VerificationResult::fail(
                action,
                format!("destination does not exist: {destination}"),
            )
        }
    }

    fn verify_copied(
        &self,
        action: &str,
        result_data: Option<&Value>,
        params: &Value,
    ) -> VerificationResult {
        let source = Self::path_from(result_data, params, &["source", "from"]);
        let destination = Self::path_from(result_data, params, &["destination", "to"]);
        let (Some(source), Some(destination)) = (source, destination) else {
            return VerificationResult::fail(action, "source/destination unavailable to verify");
        };
        let source_present = Path::new(&source).exists();
        let destination_present = Path::new(&destination).exists();
        if source_present && destination_present {
            VerificationResult::pass(action, format!("copied {source} -> {destination}"))
                .with_details(json!({"source": source, "destination": destination}))
        } else if !source_present {
            VerificationResult::fail(action, format!("source does not exist: {source}"))
        } else {
            VerificationResult::fail(
                action,
                format!("destination does not exist: {destination}"),
            )
        }
    }

    fn verify_registry_write(&self, action: &str, params: &Value) -> VerificationResult {
        if !cfg!(target_os = "windows") {
            return VerificationResult::skip(action, "skipped (non-Windows platform)");
        }
        let Some(registry) = &self.registry else {
            return VerificationResult::skip(action, "registry unavailable");
        };
        let key = params.get("key").and_then(Value::as_str).unwrap_or_default();
        let name = params.get("name").and_then(Value::as_str).unwrap_or_default();
        let expected = params.get("value").and_then(Value::as_str);
        match registry.get(key, name) {
            Some(actual) => match expected {
                Some(expected) if actual != expected => VerificationResult::fail(
                    action,
                    format!("value mismatch at {key}\\{name}: expected {expected}, found {actual}"),
                ),
                _ => VerificationResult::pass(action, format!("value present at {key}\\{name}"))
                    .with_details(json!({"key": key, "name": name, "value": actual})),
            },
            None => VerificationResult::fail(
                action,
                format!("registry value does not exist: {key}\\{name}"),
            ),
        }
    }

    fn verify_registry_delete(&self, action: &str, params: &Value) -> VerificationResult {
        if !cfg!(target_os = "windows") {
            return VerificationResult::skip(action, "skipped (non-Windows platform)");
        }
        let Some(registry) = &self.registry else {
            return VerificationResult::skip(action, "registry unavailable");
        };
        let key = params.get("key").and_then(Value::as_str).unwrap_or_default();
        let name = params.get("name").and_then(Value::as_str).unwrap_or_default();
        if registry.get(key, name).is_some() {
            VerificationResult::fail(action, format!("registry value still exists: {key}\\{name}"))
        } else {
            VerificationResult::pass(action, format!("registry value is gone: {key}\\{name}"))
        }
    }

    /// Pointer-position check. Inherently racy, so the result is marked
    /// advisory and never treated as an authoritative step failure.
    fn verify_pointer(&self, action: &str, params: &Value) -> VerificationResult {
        let Some(pointer) = &self.pointer else {
            return VerificationResult::skip(action, "pointer unavailable");
        };
        let Some(position) = pointer.position() else {
            return VerificationResult::skip(action, "pointer position unknown");
        };
        let (Some(x), Some(y)) = (
            params.get("x").and_then(Value::as_i64),
            params.get("y").and_then(Value::as_i64),
        ) else {
            return VerificationResult::skip(action, "no target coordinates to verify");
        };
        let (px, py) = position;
        let within = (px - x).abs() <= POINTER_TOLERANCE_PX && (py - y).abs() <= POINTER_TOLERANCE_PX;
        if within {
            VerificationResult::pass(
                action,
                format!("pointer at ({px}, {py}), within ±{POINTER_TOLERANCE_PX} px of ({x}, {y})"),
            )
            .with_details(json!({"x": px, "y": py, "advisory": true}))
        } else {
            let mut result = VerificationResult::fail(
                action,
                format!("pointer at ({px}, {py}), outside ±{POINTER_TOLERANCE_PX} px of ({x}, {y})"),
            );
            result.details = Some(json!({"x": px, "y": py, "advisory": true}));
            result
        }
    }
}

impl Default for StepVerifier {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn create_file_verifies_existence_and_records_size() {
        let dir = TempDir::new().expect("tempdir");
        let path = dir.path().join("hello.txt");
        std::fs::write(&path, "hi").expect("seed");
        let result = StepVerifier::new().verify(
            "file_create",
            None,
            &json!({"path": path.to_string_lossy()}),
        );
        assert!(result.verified);
        assert_eq!(result.details.expect("details")["size_bytes"], 2);
    }

    #[test]
    fn create_file_fails_when_missing() {
        let dir = TempDir::new().expect("tempdir");
        let result = StepVerifier::new().verify(
            "file_create",
            None,
            &json!({"path": dir.path().join("ghost.txt").to_string_lossy()}),
        );
        assert!(!result.verified);
        assert!(result.error.expect("error").contains("does not exist"));
    }

    #[test]
    fn delete_file_verifies_absence() {
        let dir = TempDir::new().expect("tempdir");
        let gone = dir.path().join("gone.txt");
        let verifier = StepVerifier::new();
        let ok = verifier.verify("file_delete", None, &json!({"path": gone.to_string_lossy()}));
        assert!(ok.verified);

        std::fs::write(&gone, "still here").expect("seed");
        let bad = verifier.verify("file_delete", None, &json!({"path": gone.to_string_lossy()}));
        assert!(!bad.verified);
    }

    #[test]
    fn move_requires_source_gone_and_destination_present() {
        let dir = TempDir::new().expect("tempdir");
        let a = dir.path().join("a.txt");
        let b = dir.path().join("b.txt");
        std::fs::write(&b, "moved").expect("seed");
        let verifier = StepVerifier::new();
        let params = json!({"source": a.to_string_lossy(), "destination": b.to_string_lossy()});
        assert!(verifier.verify("file_move", None, &params).verified);

        std::fs::write(&a, "oops").expect("seed");
        assert!(!verifier.verify("file_move", None, &params).verified);
    }

    #[test]
    fn copy_requires_both_present() {
        let dir = TempDir::new().expect("tempdir");
        let a = dir.path().join("a.txt");
        let b = dir.path().join("b.txt");
        std::fs::write(&a, "x").expect("seed");
        let verifier = StepVerifier::new();
        let params = json!({"source": a.to_string_lossy(), "destination": b.to_string_lossy()});
        assert!(!verifier.verify("file_copy", None, &params).verified);

        std::fs::write(&b, "x").expect("seed");
        assert!(verifier.verify("file_copy", None, &params).verified);
    }

    #[test]
    fn pointer_within_tolerance_passes_and_is_advisory() {
        let pointer = PointerState::default();
        let verifier = StepVerifier::new().with_pointer(pointer.clone());
        // No position yet: skipped, counts as verified.
        let skip = verifier.verify("gui_move_mouse", None, &json!({"x": 10, "y": 10}));
        assert!(skip.verified);

        // Drive the pointer through a real adapter move.
        let gui = spectral_tools::ActionRouter::with_defaults(spectral_tools::PathPolicy::new(
            vec![std::env::temp_dir()],
            vec![],
        ));
        let _ = gui.route("gui_move_mouse", &json!({"x": 12, "y": 8}));
        let verifier = StepVerifier::new().with_pointer(gui.pointer());
        let close = verifier.verify("gui_move_mouse", None, &json!({"x": 10, "y": 10}));
        assert!(close.verified);
        assert_eq!(close.details.expect("details")["advisory"], true);

        let far = verifier.verify("gui_move_mouse", None, &json!({"x": 100, "y": 100}));
        assert!(!far.verified);
    }

    #[test]
    fn registry_verification_skips_off_windows() {
        if cfg!(target_os = "windows") {
            return;
        }
        let result = StepVerifier::new().verify(
            "registry_write_value",
            None,
            &json!({"key": "HKCU", "name": "X", "value": "1"}),
        );
        assert!(result.verified);
        assert!(result.message.contains("non-Windows"));
    }

    #[test]
    fn unknown_actions_pass_as_not_applicable() {
        let result = StepVerifier::new().verify("typing_type_text", None, &json!({}));
        assert!(result.verified);
        assert!(result.message.contains("not applicable"));
    }
}
