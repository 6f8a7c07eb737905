//! Keyword-map accessors shared by the adapter families.

use serde_json::Value;

/// First present string under any of the accepted keys.
pub fn require_str(params: &Value, keys: &[&str]) -> Result<String, String> {
    for key in keys {
        if let Some(value) = params.get(key).and_then(Value::as_str) {
            let trimmed = value.trim();
            if !trimmed.is_empty() {
                return Ok(trimmed.to_string());
            }
        }
    }
    Err(format!("missing required parameter '{}'", keys[0]))
}

pub fn optional_str(params: &Value, key: &str) -> Option<String> {
    params
        .get(key)
        .and_then(Value::as_str)
        .map(str::to_string)
}

pub fn optional_bool(params: &Value, key: &str) -> Option<bool> {
    params.get(key).and_then(Value::as_bool)
}

pub fn optional_i64(params: &Value, key: &str) -> Option<i64> {
    params.get(key).and_then(Value::as_i64)
}

pub fn optional_u64(params: &Value, key: &str) -> Option<u64> {
    params.get(key).and_then(Value::as_u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn require_str_accepts_alternate_keys() {
        let params = json!({"file_path": "/tmp/x"});
        assert_eq!(
            require_str(&params, &["path", "file_path"]).expect("value"),
            "/tmp/x"
        );
    }

    #[test]
    fn require_str_rejects_blank_values() {
        let params = json!({"path": "   "});
        assert!(require_str(&params, &["path"]).is_err());
    }
}
