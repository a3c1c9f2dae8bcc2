//! Thin HTTPS JSON-mode client for the language-model service, plus the
//! environment-driven factory that decides whether a client is available.

use std::collections::HashMap;
use std::time::Duration;

use serde::Serialize;
use serde_json::{Value, json};
use tracing::debug;

pub const DEFAULT_MODEL: &str = "gpt-4o-mini";
pub const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";
pub const DEFAULT_TIMEOUT_S: f64 = 15.0;
pub const DEFAULT_TEMPERATURE: f64 = 0.0;
pub const DEFAULT_MAX_TOKENS: u32 = 900;

/// Errors surfaced by an LLM client. `Timeout` is distinct so the pipeline
/// can classify the fallback reason; everything else degrades to an API
/// error.
#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("llm request timed out: {0}")]
    Timeout(String),

    #[error("HTTP {code}: {message}")]
    Http { code: u16, message: String },

    #[error("llm api error: {0}")]
    Api(String),
}

/// The single seam the pipeline needs from any language-model backend.
pub trait LlmComplete {
    fn complete(&self, prompt: &str, timeout: Duration) -> Result<String, LlmError>;
}

/// The allowed timeout substrings are contract, not heuristic: exception
/// text from miscellaneous transports is matched against these.
const TIMEOUT_KEYWORDS: [&str; 5] = ["timeout", "timed out", "time out", "超時", "超时"];

pub fn is_timeout_message(message: &str) -> bool {
    let lowered = message.to_lowercase();
    TIMEOUT_KEYWORDS.iter().any(|keyword| lowered.contains(keyword))
}

/// JSON-mode chat-completion client for an OpenAI-compatible endpoint.
#[derive(Debug, Clone)]
pub struct OpenAiChatClient {
    pub api_key: String,
    pub model: String,
    pub base_url: String,
    pub temperature: f64,
    pub max_tokens: u32,
}

impl OpenAiChatClient {
    fn endpoint(&self) -> String {
        format!("{}/chat/completions", self.base_url.trim_end_matches('/'))
    }

    fn request_body(&self, prompt: &str) -> Value {
        json!({
            "model": self.model,
            "messages": [{"role": "user", "content": prompt}],
            "temperature": self.temperature,
            "max_tokens": self.max_tokens,
            "response_format": {"type": "json_object"},
        })
    }

    fn extract_content(parsed: &Value) -> Result<String, LlmError> {
        let choices = parsed
            .get("choices")
            .and_then(Value::as_array)
            .filter(|choices| !choices.is_empty())
            .ok_or_else(|| LlmError::Api("response missing choices".to_string()))?;
        let message = choices[0]
            .get("message")
            .and_then(Value::as_object)
            .ok_or_else(|| LlmError::Api("response missing message".to_string()))?;

        match message.get("content") {
            Some(Value::String(text)) if !text.trim().is_empty() => Ok(text.trim().to_string()),
            Some(Value::Array(parts)) => {
                let chunks: Vec<String> = parts
                    .iter()
                    .filter_map(|part| part.get("text"))
                    .filter_map(Value::as_str)
                    .map(str::trim)
                    .filter(|text| !text.is_empty())
                    .map(str::to_string)
                    .collect();
                if chunks.is_empty() {
                    Err(LlmError::Api("response missing content text".to_string()))
                } else {
                    Ok(chunks.join("\n"))
                }
            }
            _ => Err(LlmError::Api("response missing content text".to_string())),
        }
    }
}

impl LlmComplete for OpenAiChatClient {
    fn complete(&self, prompt: &str, timeout: Duration) -> Result<String, LlmError> {
        let endpoint = self.endpoint();
        debug!(model = %self.model, %endpoint, "sending chat completion request");

        let response = ureq::post(&endpoint)
            .timeout(timeout)
            .set("Authorization", &format!("Bearer {}", self.api_key))
            .set("Content-Type", "application/json")
            .send_json(self.request_body(prompt));

        let response = match response {
            Ok(response) => response,
            Err(ureq::Error::Status(code, response)) => {
                // Pull the service's own error message out of the body when
                // it has one.
                let message = response
                    .into_json::<Value>()
                    .ok()
                    .and_then(|body| {
                        body.get("error")
                            .and_then(|error| error.get("message"))
                            .and_then(Value::as_str)
                            .map(str::to_string)
                    })
                    .unwrap_or_else(|| "chat completion failed".to_string());
                return Err(LlmError::Http { code, message });
            }
            Err(ureq::Error::Transport(transport)) => {
                let message = transport.to_string();
                if is_timeout_message(&message) {
                    return Err(LlmError::Timeout(message));
                }
                return Err(LlmError::Api(message));
            }
        };

        let parsed: Value = response
            .into_json()
            .map_err(|e| LlmError::Api(format!("malformed response body: {e}")))?;
        Self::extract_content(&parsed)
    }
}

/// Why a client is (or is not) live, echoed into pipeline metadata.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LlmRuntime {
    pub enabled: bool,
    pub provider: String,
    pub model: String,
    pub base_url: String,
    pub timeout_s_default: f64,
    pub reason: String,
}

impl LlmRuntime {
    /// Runtime descriptor for a caller-injected client.
    pub fn injected() -> Self {
        LlmRuntime {
            enabled: true,
            provider: "injected".to_string(),
            model: "injected".to_string(),
            base_url: "injected".to_string(),
            timeout_s_default: DEFAULT_TIMEOUT_S,
            reason: "injected_client".to_string(),
        }
    }
}

fn env_text(env: &HashMap<String, String>, key: &str) -> Option<String> {
    env.get(key).map(|value| value.trim().to_string()).filter(|value| !value.is_empty())
}

fn env_float(env: &HashMap<String, String>, key: &str, fallback: f64) -> f64 {
    env_text(env, key)
        .and_then(|value| value.parse::<f64>().ok())
        .filter(|parsed| *parsed > 0.0)
        .unwrap_or(fallback)
}

fn env_int(env: &HashMap<String, String>, key: &str, fallback: u32) -> u32 {
    env_text(env, key)
        .and_then(|value| value.parse::<i64>().ok())
        .filter(|parsed| *parsed > 0)
        .map(|parsed| parsed as u32)
        .unwrap_or(fallback)
}

fn env_bool(env: &HashMap<String, String>, key: &str) -> Option<bool> {
    let value = env_text(env, key)?;
    match value.to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" | "y" => Some(true),
        "0" | "false" | "no" | "off" | "n" => Some(false),
        _ => None,
    }
}

/// Build a client from explicit environment entries. Returns no client
/// (with the reason in the runtime) when disabled, unsupported, or missing
/// credentials.
pub fn build_llm_client(env: &HashMap<String, String>) -> (Option<OpenAiChatClient>, LlmRuntime) {
    let provider =
        env_text(env, "POS_LLM_PROVIDER").unwrap_or_else(|| "openai".to_string()).to_lowercase();
    let model = env_text(env, "POS_LLM_MODEL").unwrap_or_else(|| DEFAULT_MODEL.to_string());
    let base_url = env_text(env, "POS_LLM_BASE_URL").unwrap_or_else(|| DEFAULT_BASE_URL.to_string());
    let api_key = env_text(env, "POS_LLM_API_KEY").or_else(|| env_text(env, "OPENAI_API_KEY"));
    let timeout_s = env_float(env, "POS_LLM_TIMEOUT_S", DEFAULT_TIMEOUT_S);
    let temperature = env_float(env, "POS_LLM_TEMPERATURE", DEFAULT_TEMPERATURE);
    let max_tokens = env_int(env, "POS_LLM_MAX_TOKENS", DEFAULT_MAX_TOKENS);
    let enabled_flag = env_bool(env, "POS_LLM_ENABLED");

    let mut runtime = LlmRuntime {
        enabled: false,
        provider: provider.clone(),
        model: model.clone(),
        base_url: base_url.clone(),
        timeout_s_default: timeout_s,
        reason: "unknown".to_string(),
    };

    if enabled_flag == Some(false) {
        runtime.reason = "env_disabled".to_string();
        return (None, runtime);
    }

    if provider != "openai" {
        runtime.reason = "unsupported_provider".to_string();
        return (None, runtime);
    }

    let Some(api_key) = api_key else {
        runtime.reason = "missing_api_key".to_string();
        return (None, runtime);
    };

    let client = OpenAiChatClient { api_key, model, base_url, temperature, max_tokens };
    runtime.enabled = true;
    runtime.reason = "ready".to_string();
    (Some(client), runtime)
}

/// Build a client from the process environment.
pub fn build_llm_client_from_env() -> (Option<OpenAiChatClient>, LlmRuntime) {
    let env: HashMap<String, String> = std::env::vars().collect();
    build_llm_client(&env)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    fn env(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    #[test]
    fn test_factory_requires_api_key() {
        let (client, runtime) = build_llm_client(&env(&[]));
        assert!(client.is_none());
        assert!(!runtime.enabled);
        assert_eq!(runtime.reason, "missing_api_key");
    }

    #[test]
    fn test_factory_ready_with_defaults() {
        let (client, runtime) = build_llm_client(&env(&[("POS_LLM_API_KEY", "sk-test")]));
        let client = client.unwrap();
        assert!(runtime.enabled);
        assert_eq!(runtime.reason, "ready");
        assert_eq!(client.model, DEFAULT_MODEL);
        assert_eq!(client.base_url, DEFAULT_BASE_URL);
        assert_eq!(client.max_tokens, DEFAULT_MAX_TOKENS);
        assert_eq!(runtime.timeout_s_default, DEFAULT_TIMEOUT_S);
    }

    #[test]
    fn test_factory_env_disabled() {
        let (client, runtime) = build_llm_client(&env(&[
            ("POS_LLM_API_KEY", "sk-test"),
            ("POS_LLM_ENABLED", "false"),
        ]));
        assert!(client.is_none());
        assert_eq!(runtime.reason, "env_disabled");
    }

    #[test]
    fn test_factory_unsupported_provider() {
        let (client, runtime) = build_llm_client(&env(&[
            ("POS_LLM_API_KEY", "sk-test"),
            ("POS_LLM_PROVIDER", "azure"),
        ]));
        assert!(client.is_none());
        assert_eq!(runtime.reason, "unsupported_provider");
    }

    #[test]
    fn test_factory_overrides_and_bad_numbers_fall_back() {
        let (client, runtime) = build_llm_client(&env(&[
            ("POS_LLM_API_KEY", "sk-test"),
            ("POS_LLM_MODEL", "gpt-4o"),
            ("POS_LLM_BASE_URL", "https://llm.internal/v1"),
            ("POS_LLM_TIMEOUT_S", "-3"),
            ("POS_LLM_MAX_TOKENS", "not-a-number"),
            ("POS_LLM_TEMPERATURE", "0.7"),
        ]));
        let client = client.unwrap();
        assert_eq!(client.model, "gpt-4o");
        assert_eq!(client.base_url, "https://llm.internal/v1");
        assert_eq!(client.max_tokens, DEFAULT_MAX_TOKENS);
        assert_eq!(client.temperature, 0.7);
        assert_eq!(runtime.timeout_s_default, DEFAULT_TIMEOUT_S);
    }

    #[test]
    #[serial]
    fn test_factory_reads_process_env() {
        unsafe {
            std::env::set_var("POS_LLM_API_KEY", "sk-proc");
            std::env::set_var("POS_LLM_MODEL", "gpt-4o-mini");
        }
        let (client, runtime) = build_llm_client_from_env();
        unsafe {
            std::env::remove_var("POS_LLM_API_KEY");
            std::env::remove_var("POS_LLM_MODEL");
        }
        assert!(runtime.enabled);
        assert_eq!(client.unwrap().api_key, "sk-proc");
    }

    #[test]
    #[serial]
    fn test_factory_accepts_openai_api_key_alias() {
        unsafe {
            std::env::set_var("OPENAI_API_KEY", "sk-alias");
        }
        let (client, runtime) = build_llm_client_from_env();
        unsafe {
            std::env::remove_var("OPENAI_API_KEY");
        }
        assert!(runtime.enabled);
        assert_eq!(client.unwrap().api_key, "sk-alias");
    }

    #[test]
    fn test_timeout_keywords_are_contract() {
        assert!(is_timeout_message("Connection TIMED OUT after 15s"));
        assert!(is_timeout_message("request timeout"));
        assert!(is_timeout_message("連線超時"));
        assert!(is_timeout_message("连接超时"));
        assert!(!is_timeout_message("connection refused"));
    }

    #[test]
    fn test_extract_content_string_and_chunks() {
        let parsed = json!({
            "choices": [{"message": {"content": "  {\"items\": []}  "}}]
        });
        assert_eq!(OpenAiChatClient::extract_content(&parsed).unwrap(), "{\"items\": []}");

        let chunked = json!({
            "choices": [{"message": {"content": [
                {"type": "text", "text": "{\"items\":"},
                {"type": "text", "text": "[]}"},
            ]}}]
        });
        assert_eq!(OpenAiChatClient::extract_content(&chunked).unwrap(), "{\"items\":\n[]}");
    }

    #[test]
    fn test_extract_content_missing_pieces() {
        assert!(matches!(
            OpenAiChatClient::extract_content(&json!({})),
            Err(LlmError::Api(_))
        ));
        assert!(matches!(
            OpenAiChatClient::extract_content(&json!({"choices": []})),
            Err(LlmError::Api(_))
        ));
        assert!(matches!(
            OpenAiChatClient::extract_content(&json!({"choices": [{"message": {"content": "  "}}]})),
            Err(LlmError::Api(_))
        ));
    }

    #[test]
    fn test_endpoint_strips_trailing_slash() {
        let client = OpenAiChatClient {
            api_key: "k".to_string(),
            model: "m".to_string(),
            base_url: "https://api.openai.com/v1/".to_string(),
            temperature: 0.0,
            max_tokens: 900,
        };
        assert_eq!(client.endpoint(), "https://api.openai.com/v1/chat/completions");
    }
}
