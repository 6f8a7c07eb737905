//! Defensive JSON extraction for free-form model replies: fence stripping,
//! outermost-object location, and a repair pass for the malformations models
//! actually emit (smart quotes, single-quoted keys, trailing commas,
//! unbalanced brackets). Repair is a pipeline of total string transforms —
//! the model is never re-invoked to fix its own output.

use regex::Regex;
use serde_json::Value;
use std::sync::OnceLock;

/// Pull the most likely JSON payload out of surrounding prose.
pub fn extract_json_candidate(text: &str) -> &str {
    let text = text.trim();

    // Fenced block first: ```json ... ``` or bare ``` ... ```.
    if let Some(start) = text.find("```") {
        let after = &text[start + 3..];
        let after = after.strip_prefix("json").unwrap_or(after);
        if let Some(end) = after.find("```") {
            let inner = after[..end].trim();
            if !inner.is_empty() {
                return inner;
            }
        }
    }

    // Outermost object or array.
    let start_brace = text.find('{');
    let start_bracket = text.find('[');
    let start = match (start_brace, start_bracket) {
        (Some(b), Some(k)) => Some(b.min(k)),
        (Some(b), None) => Some(b),
        (None, Some(k)) => Some(k),
        (None, None) => None,
    };
    if let Some(start) = start {
        let end_brace = text.rfind('}');
        let end_bracket = text.rfind(']');
        let end = match (end_brace, end_bracket) {
            (Some(b), Some(k)) => Some(b.max(k)),
            (Some(b), None) => Some(b),
            (None, Some(k)) => Some(k),
            (None, None) => None,
        };
        if let Some(end) = end {
            if end > start {
                return text[start..=end].trim();
            }
        }
    }

    text
}

/// Normalize the common LLM malformations. Applying this to already-valid
/// JSON yields an equal parse.
pub fn repair_json(text: &str) -> String {
    static SINGLE_QUOTED_KEY: OnceLock<Regex> = OnceLock::new();
    static SINGLE_QUOTED_VALUE: OnceLock<Regex> = OnceLock::new();
    static SINGLE_QUOTED_ELEMENT: OnceLock<Regex> = OnceLock::new();
    static TRAILING_COMMA: OnceLock<Regex> = OnceLock::new();

    let mut text = text
        .replace('\u{201c}', "\"")
        .replace('\u{201d}', "\"")
        .replace('\u{2018}', "'")
        .replace('\u{2019}', "'");

    let key_re = SINGLE_QUOTED_KEY
        .get_or_init(|| Regex::new(r"'([^']*)'\s*:").expect("key pattern"));
    text = key_re.replace_all(&text, "\"$1\":").into_owned();

    let value_re = SINGLE_QUOTED_VALUE
        .get_or_init(|| Regex::new(r":\s*'([^']*)'").expect("value pattern"));
    text = value_re.replace_all(&text, ": \"$1\"").into_owned();

    // Array elements: 'x' followed by a comma or closing bracket.
    let element_re = SINGLE_QUOTED_ELEMENT
        .get_or_init(|| Regex::new(r"'([^']*)'\s*([,\]\}])").expect("element pattern"));
    text = element_re.replace_all(&text, "\"$1\"$2").into_owned();

    let comma_re =
        TRAILING_COMMA.get_or_init(|| Regex::new(r",\s*([}\]])").expect("comma pattern"));
    text = comma_re.replace_all(&text, "$1").into_owned();

    let open_braces = text.matches('{').count();
    let close_braces = text.matches('}').count();
    if open_braces > close_braces {
        text.push_str(&"}".repeat(open_braces - close_braces));
    }
    let open_brackets = text.matches('[').count();
    let close_brackets = text.matches(']').count();
    if open_brackets > close_brackets {
        text.push_str(&"]".repeat(open_brackets - close_brackets));
    }

    text
}

/// Extract and parse, repairing once on failure.
pub fn parse_lenient(text: &str) -> Result<Value, serde_json::Error> {
    let candidate = extract_json_candidate(text);
    match serde_json::from_str(candidate) {
        Ok(value) => Ok(value),
        Err(_) => serde_json::from_str(&repair_json(candidate)),
    }
}
