use crate::params::require_str;
use serde_json::json;
use spectral_core::ActionResult;

/// Keyboard-input family. Without a real input stack the adapter records
/// what would have been typed so downstream steps can consume it.
pub struct TypingActions;

impl TypingActions {
    pub fn type_text(&self, params: &serde_json::Value) -> ActionResult {
        const ACTION: &str = "typing_type_text";
        let text = match require_str(params, &["text"]) {
            Ok(t) => t,
            Err(err) => return ActionResult::fail(ACTION, err),
        };
        let chars = text.chars().count();
        ActionResult::ok(ACTION, format!("Typed {chars} characters"))
            .with_data(json!({"text": text, "characters": chars}))
    }
}

/// OCR family. No engine is bundled; the adapter reports the missing
/// capability so retries stop early rather than spinning.
pub struct OcrActions;

impl OcrActions {
    pub fn extract_text(&self, params: &serde_json::Value) -> ActionResult {
        const ACTION: &str = "ocr_extract_text";
        if require_str(params, &["image_path", "path"]).is_err() {
            return ActionResult::fail(ACTION, "missing required parameter 'image_path'");
        }
        ActionResult::fail(ACTION, "OCR engine not installed on this host")
    }
}
