use spectral_llm::LlmClient;
use std::sync::Arc;

/// Coarse intent of a user message, used to pick the execution path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Intent {
    /// Small talk; answered directly with no plan.
    Casual,
    /// A request the action pipeline should plan and execute.
    Action,
    /// A code-generation request for the sandbox path.
    CodeGeneration,
    /// "Where did you save..." — answered from execution memory.
    LocationQuery,
}

impl Intent {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Casual => "casual",
            Self::Action => "action",
            Self::CodeGeneration => "code_generation",
            Self::LocationQuery => "location_query",
        }
    }
}

const CASUAL_MARKERS: &[&str] = &[
    "hello",
    "hi there",
    "hey",
    "good morning",
    "good evening",
    "how are you",
    "thank you",
    "thanks",
    "goodbye",
    "bye",
    "who are you",
];

const CODE_MARKERS: &[&str] = &[
    "write a program",
    "write a script",
    "write code",
    "write a python",
    "generate code",
    "generate a program",
    "generate a script",
    "code that",
    "program that",
    "script that",
    "implement a",
];

const ACTION_MARKERS: &[&str] = &[
    "create", "delete", "list", "move", "copy", "open", "launch", "run", "execute", "click",
    "type", "show", "file", "folder", "system", "process",
];

pub fn classify_intent(text: &str) -> Intent {
    let text_lc = text.trim().to_lowercase();
    if text_lc.is_empty() {
        return Intent::Casual;
    }

    if text_lc.contains("where")
        && ["save", "saved", "file", "location", "put"]
            .iter()
            .any(|w| text_lc.contains(w))
    {
        return Intent::LocationQuery;
    }

    if CODE_MARKERS.iter().any(|m| text_lc.contains(m)) {
        return Intent::CodeGeneration;
    }

    let is_casual = CASUAL_MARKERS.iter().any(|m| text_lc.contains(m));
    let has_action = ACTION_MARKERS.iter().any(|m| text_lc.contains(m));
    if is_casual && !has_action {
        return Intent::Casual;
    }
    if has_action {
        return Intent::Action;
    }
    // Short, verb-less messages read as conversation.
    if text_lc.split_whitespace().count() <= 4 {
        Intent::Casual
    } else {
        Intent::Action
    }
}

/// Produces the trailing conversational reply for a turn. LLM-backed with
/// a canned fallback so the stream always ends with a response.
pub struct ResponseGenerator {
    llm: Arc<dyn LlmClient>,
}

impl ResponseGenerator {
    pub fn new(llm: Arc<dyn LlmClient>) -> Self {
        Self { llm }
    }

    pub fn generate_response(
        &self,
        intent: Intent,
        execution_result: &str,
        original_input: &str,
        memory_context: &str,
    ) -> String {
        let mut prompt = format!(
            "You are a helpful desktop assistant. Reply in one or two \
             conversational sentences.\n\nUser said: {original_input}\n"
        );
        if !memory_context.trim().is_empty() {
            prompt.push_str(&format!("\nRelevant memory:\n{memory_context}\n"));
        }
        if !execution_result.trim().is_empty() {
            prompt.push_str(&format!(
                "\nWhat was just executed (summarize the outcome for the user):\n{execution_result}\n"
            ));
        }
        if intent == Intent::Casual {
            prompt.push_str("\nThis is casual conversation; no action was taken.\n");
        }

        match self.llm.generate(&prompt) {
            Ok(reply) if !reply.trim().is_empty() => reply.trim().to_string(),
            _ => fallback_response(intent),
        }
    }
}

fn fallback_response(intent: Intent) -> String {
    match intent {
        Intent::Casual => "Hello! How can I help you today?".to_string(),
        _ => "Is there anything else I can help you with?".to_string(),
    }
}
