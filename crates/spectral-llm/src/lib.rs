pub mod json;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use spectral_core::LlmConfig;
use std::io::BufRead;
use std::time::Duration;
use thiserror::Error;

/// Provider failures. Transport problems are distinguishable from an empty
/// or malformed reply so callers can decide what is retriable.
#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("provider connection error: {0}")]
    Connection(String),
    #[error("provider request timed out")]
    Timeout,
    #[error("provider returned HTTP {status}: {body}")]
    Http { status: u16, body: String },
    #[error("provider returned an empty reply")]
    EmptyReply,
    #[error("provider reply could not be interpreted: {0}")]
    InvalidReply(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".to_string(),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: "assistant".to_string(),
            content: content.into(),
        }
    }
}

/// Text-generation interface to the external provider: unary, streaming
/// (chunk callback, full text returned at end-of-stream), and chat form.
pub trait LlmClient: Send + Sync {
    fn generate(&self, prompt: &str) -> Result<String, ProviderError>;

    fn generate_stream(
        &self,
        prompt: &str,
        on_chunk: &mut dyn FnMut(&str),
    ) -> Result<String, ProviderError>;

    fn chat(&self, messages: &[ChatMessage]) -> Result<String, ProviderError>;
}

/// Blocking HTTP client for an OpenAI-compatible chat-completions endpoint.
/// Transport errors are retried with exponential backoff up to the
/// configured attempt budget; HTTP and reply-shape errors are not.
pub struct HttpLlmClient {
    cfg: LlmConfig,
    client: reqwest::blocking::Client,
}

impl HttpLlmClient {
    pub fn new(cfg: LlmConfig) -> Result<Self, ProviderError> {
        let client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(cfg.timeout_seconds))
            .build()
            .map_err(|e| ProviderError::Connection(e.to_string()))?;
        Ok(Self { cfg, client })
    }

    fn api_key(&self) -> Option<String> {
        std::env::var(&self.cfg.api_key_env).ok().filter(|k| !k.is_empty())
    }

    fn payload(&self, messages: &[ChatMessage], stream: bool) -> Value {
        json!({
            "model": self.cfg.model,
            "messages": messages,
            "temperature": self.cfg.temperature,
            "max_tokens": self.cfg.max_tokens,
            "stream": stream,
        })
    }

    fn send(&self, payload: &Value) -> Result<reqwest::blocking::Response, ProviderError> {
        let mut last_err = ProviderError::Connection("request was never sent".to_string());
        let mut attempt: u8 = 0;
        loop {
            let mut request = self.client.post(&self.cfg.endpoint).json(payload);
            if let Some(key) = self.api_key() {
                request = request.bearer_auth(key);
            }
            match request.send() {
                Ok(resp) => {
                    let status = resp.status();
                    if status.is_success() {
                        return Ok(resp);
                    }
                    let body = resp.text().unwrap_or_default();
                    let err = ProviderError::Http {
                        status: status.as_u16(),
                        body: truncate(&body, 400),
                    };
                    // 429/5xx are transient; anything else surfaces at once.
                    if !(status.as_u16() == 429 || status.is_server_error()) {
                        return Err(err);
                    }
                    last_err = err;
                }
                Err(e) if e.is_timeout() => return Err(ProviderError::Timeout),
                Err(e) => last_err = ProviderError::Connection(e.to_string()),
            }
            if attempt >= self.cfg.max_retries {
                return Err(last_err);
            }
            let backoff = self.cfg.retry_base_ms.saturating_mul(1u64 << attempt.min(16));
            std::thread::sleep(Duration::from_millis(backoff));
            attempt += 1;
        }
    }

    fn extract_message(body: &str) -> Result<String, ProviderError> {
        let value: Value = serde_json::from_str(body)
            .map_err(|e| ProviderError::InvalidReply(e.to_string()))?;
        let content = value
            .get("choices")
            .and_then(|c| c.as_array())
            .and_then(|arr| arr.first())
            .and_then(|choice| choice.get("message"))
            .and_then(|msg| msg.get("content"))
            .and_then(|c| c.as_str())
            .unwrap_or_default()
            .to_string();
        if content.trim().is_empty() {
            return Err(ProviderError::EmptyReply);
        }
        Ok(content)
    }
}

impl LlmClient for HttpLlmClient {
    fn generate(&self, prompt: &str) -> Result<String, ProviderError> {
        self.chat(&[ChatMessage::user(prompt)])
    }

    fn generate_stream(
        &self,
        prompt: &str,
        on_chunk: &mut dyn FnMut(&str),
    ) -> Result<String, ProviderError> {
        let payload = self.payload(&[ChatMessage::user(prompt)], true);
        let resp = self.send(&payload)?;
        let reader = std::io::BufReader::new(resp);
        let mut assembled = String::new();
        for line in reader.lines() {
            let line = line.map_err(|e| ProviderError::Connection(e.to_string()))?;
            let trimmed = line.trim();
            let Some(data) = trimmed.strip_prefix("data:") else {
                continue;
            };
            let data = data.trim();
            if data == "[DONE]" {
                break;
            }
            let Ok(value) = serde_json::from_str::<Value>(data) else {
                continue;
            };
            let delta = value
                .get("choices")
                .and_then(|c| c.as_array())
                .and_then(|arr| arr.first())
                .and_then(|choice| choice.get("delta"))
                .and_then(|delta| delta.get("content"))
                .and_then(|c| c.as_str())
                .unwrap_or_default();
            if !delta.is_empty() {
                assembled.push_str(delta);
                on_chunk(delta);
            }
        }
        if assembled.trim().is_empty() {
            return Err(ProviderError::EmptyReply);
        }
        Ok(assembled)
    }

    fn chat(&self, messages: &[ChatMessage]) -> Result<String, ProviderError> {
        let payload = self.payload(messages, false);
        let resp = self.send(&payload)?;
        let body = resp
            .text()
            .map_err(|e| ProviderError::Connection(e.to_string()))?;
        Self::extract_message(&body)
    }
}

fn truncate(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let head: String = text.chars().take(max_chars).collect();
    format!("{head}...")
}
