//! Scripted doubles for the pipeline's external collaborators: a canned
//! LLM, a scripted action host, and a recording sleeper for observing
//! backoff without actually waiting.

use spectral_core::cancel::{CancelToken, Sleeper};
use spectral_core::ActionResult;
use spectral_llm::{ChatMessage, LlmClient, ProviderError};
use spectral_tools::ActionHost;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

/// LLM double that replays queued responses in order. An exhausted queue
/// surfaces as a transport error, which is what a dead provider looks like.
#[derive(Default)]
pub struct ScriptedLlm {
    responses: Mutex<VecDeque<String>>,
    pub calls: Mutex<Vec<String>>,
}

impl ScriptedLlm {
    pub fn new(responses: Vec<&str>) -> Self {
        Self {
            responses: Mutex::new(responses.into_iter().map(str::to_string).collect()),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn push_response(&self, response: &str) {
        self.responses
            .lock()
            .expect("script lock poisoned")
            .push_back(response.to_string());
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().expect("script lock poisoned").len()
    }

    fn next(&self, prompt: &str) -> Result<String, ProviderError> {
        self.calls
            .lock()
            .expect("script lock poisoned")
            .push(prompt.to_string());
        self.responses
            .lock()
            .expect("script lock poisoned")
            .pop_front()
            .ok_or_else(|| ProviderError::Connection("scripted responses exhausted".to_string()))
    }
}

impl LlmClient for ScriptedLlm {
    fn generate(&self, prompt: &str) -> Result<String, ProviderError> {
        self.next(prompt)
    }

    fn generate_stream(
        &self,
        prompt: &str,
        on_chunk: &mut dyn FnMut(&str),
    ) -> Result<String, ProviderError> {
        let full = self.next(prompt)?;
        // Emit in smallish pieces so stream consumers see multiple chunks.
        for chunk in full.as_bytes().chunks(24) {
            on_chunk(&String::from_utf8_lossy(chunk));
        }
        Ok(full)
    }

    fn chat(&self, messages: &[ChatMessage]) -> Result<String, ProviderError> {
        let prompt = messages
            .last()
            .map(|m| m.content.clone())
            .unwrap_or_default();
        self.next(&prompt)
    }
}

/// Action host double. Results are queued per action type and popped on
/// each call; an empty queue yields a generic success so unscripted steps
/// pass through.
pub struct ScriptedHost {
    names: Vec<String>,
    queues: Mutex<HashMap<String, VecDeque<ActionResult>>>,
    pub invocations: Mutex<Vec<(String, serde_json::Value)>>,
}

impl ScriptedHost {
    pub fn new(names: &[&str]) -> Self {
        Self {
            names: names.iter().map(|n| n.to_string()).collect(),
            queues: Mutex::new(HashMap::new()),
            invocations: Mutex::new(Vec::new()),
        }
    }

    /// Host advertising the full production catalog names.
    pub fn with_standard_catalog() -> Self {
        Self::new(&[
            "file_list",
            "file_read",
            "file_create",
            "file_create_directory",
            "file_delete",
            "file_delete_directory",
            "file_move",
            "file_copy",
            "gui_move_mouse",
            "gui_click_mouse",
            "gui_capture_screen",
            "typing_type_text",
            "registry_read_value",
            "registry_write_value",
            "registry_delete_value",
            "ocr_extract_text",
            "powershell_execute",
            "powershell_get_system_info",
            "powershell_get_processes",
            "powershell_get_services",
            "subprocess_execute",
            "subprocess_open_application",
        ])
    }

    pub fn script(&self, action_type: &str, result: ActionResult) {
        self.queues
            .lock()
            .expect("queue lock poisoned")
            .entry(action_type.to_string())
            .or_default()
            .push_back(result);
    }

    /// Queue `failures` failing results followed by one success.
    pub fn script_flaky(&self, action_type: &str, failures: usize, error: &str) {
        for _ in 0..failures {
            self.script(action_type, ActionResult::fail(action_type, error));
        }
        self.script(
            action_type,
            ActionResult::ok(action_type, format!("{action_type} succeeded")),
        );
    }

    pub fn invocation_count(&self, action_type: &str) -> usize {
        self.invocations
            .lock()
            .expect("invocation lock poisoned")
            .iter()
            .filter(|(name, _)| name == action_type)
            .count()
    }
}

impl ActionHost for ScriptedHost {
    fn list_available_actions(&self) -> BTreeMap<String, BTreeMap<String, String>> {
        let mut families: BTreeMap<String, BTreeMap<String, String>> = BTreeMap::new();
        for name in &self.names {
            let family = name.split('_').next().unwrap_or("misc").to_string();
            families
                .entry(family)
                .or_default()
                .insert(name.clone(), format!("scripted {name}"));
        }
        families
    }

    fn route(&self, action_type: &str, params: &serde_json::Value) -> ActionResult {
        self.invocations
            .lock()
            .expect("invocation lock poisoned")
            .push((action_type.to_string(), params.clone()));
        let scripted = self
            .queues
            .lock()
            .expect("queue lock poisoned")
            .get_mut(action_type)
            .and_then(VecDeque::pop_front);
        scripted
            .unwrap_or_else(|| {
                ActionResult::ok(action_type, format!("{action_type} succeeded"))
            })
            .with_elapsed_ms(1)
    }

    fn knows(&self, action_type: &str) -> bool {
        self.names.iter().any(|n| n == action_type)
    }
}

/// Sleeper that records requested durations instead of waiting.
#[derive(Default)]
pub struct RecordingSleeper {
    pub slept: Mutex<Vec<Duration>>,
}

impl Sleeper for RecordingSleeper {
    fn sleep(&self, duration: Duration, cancel: &CancelToken) -> bool {
        self.slept
            .lock()
            .expect("sleeper lock poisoned")
            .push(duration);
        cancel.is_cancelled()
    }
}

impl RecordingSleeper {
    pub fn sleeps(&self) -> Vec<Duration> {
        self.slept.lock().expect("sleeper lock poisoned").clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scripted_llm_replays_in_order_then_errors() {
        let llm = ScriptedLlm::new(vec!["one", "two"]);
        assert_eq!(llm.generate("a").expect("first"), "one");
        assert_eq!(llm.generate("b").expect("second"), "two");
        assert!(llm.generate("c").is_err());
        assert_eq!(llm.call_count(), 3);
    }

    #[test]
    fn scripted_host_pops_queued_results() {
        let host = ScriptedHost::new(&["file_create"]);
        host.script_flaky("file_create", 1, "disk momentarily busy");
        let first = host.route("file_create", &serde_json::json!({}));
        let second = host.route("file_create", &serde_json::json!({}));
        assert!(!first.success);
        assert!(second.success);
        assert_eq!(host.invocation_count("file_create"), 2);
    }

    #[test]
    fn recording_sleeper_captures_durations() {
        let sleeper = RecordingSleeper::default();
        let cancel = CancelToken::new();
        sleeper.sleep(Duration::from_secs(1), &cancel);
        sleeper.sleep(Duration::from_secs(2), &cancel);
        assert_eq!(
            sleeper.sleeps(),
            vec![Duration::from_secs(1), Duration::from_secs(2)]
        );
    }
}
