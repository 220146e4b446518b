//! Minimal chat-completions client shared by the LLM-backed stage backends.

use std::time::Duration;

use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::error::{StageError, UnreachableCause};
use crate::config::BackendConfig;
use crate::sanitize::{hash_value, redact_url};
use crate::secrets::resolve_secret;

pub struct ChatClient {
    provider: &'static str,
    endpoint: String,
    config: BackendConfig,
    http: reqwest::Client,
}

#[derive(Debug, Clone, Serialize)]
pub struct ChatMessage {
    pub role: &'static str,
    pub content: Value,
}

impl ChatMessage {
    pub fn system(text: &str) -> Self {
        Self {
            role: "system",
            content: Value::String(text.to_string()),
        }
    }

    pub fn user(text: &str) -> Self {
        Self {
            role: "user",
            content: Value::String(text.to_string()),
        }
    }

    /// A user turn carrying a prompt plus one image reference.
    pub fn user_with_image(text: &str, image_url: &str) -> Self {
        Self {
            role: "user",
            content: serde_json::json!([
                { "type": "text", "text": text },
                { "type": "image_url", "image_url": { "url": image_url } }
            ]),
        }
    }
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    temperature: f32,
    messages: &'a [ChatMessage],
    response_format: Value,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: AssistantMessage,
}

#[derive(Debug, Deserialize)]
struct AssistantMessage {
    #[serde(default)]
    content: Option<String>,
}

impl ChatClient {
    pub fn new(provider: &'static str, config: &BackendConfig) -> Result<Self, StageError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs.max(1)))
            .build()
            .map_err(|e| StageError::Configuration(format!("failed to build {provider} HTTP client: {e}")))?;
        let endpoint = format!("{}/chat/completions", config.base_url.trim_end_matches('/'));
        Ok(Self {
            provider,
            endpoint,
            config: config.clone(),
            http,
        })
    }

    pub fn provider(&self) -> &'static str {
        self.provider
    }

    /// Resolves the API key. Fails with a configuration error when absent.
    pub fn api_key(&self) -> Result<SecretString, StageError> {
        resolve_secret(self.provider, &self.config.credentials)
            .map_err(|e| StageError::Configuration(e.to_string()))
    }

    /// Sends `messages` and returns the assistant's JSON-mode reply text.
    pub async fn complete_json(&self, messages: &[ChatMessage]) -> Result<String, StageError> {
        let key = self.api_key()?;

        let mut headers = HeaderMap::new();
        let auth = format!("Bearer {}", key.expose_secret());
        headers.insert(
            AUTHORIZATION,
            HeaderValue::from_str(&auth)
                .map_err(|_| StageError::Configuration(format!("invalid {} API key", self.provider)))?,
        );
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

        let body = ChatRequest {
            model: &self.config.model,
            temperature: 0.0,
            messages,
            response_format: serde_json::json!({ "type": "json_object" }),
        };

        tracing::debug!(
            provider = self.provider,
            endpoint = %redact_url(&self.endpoint),
            model = %self.config.model,
            key = %hash_value(key.expose_secret()),
            "calling chat completions"
        );

        let resp = self
            .http
            .post(&self.endpoint)
            .headers(headers)
            .json(&body)
            .send()
            .await
            .map_err(|e| self.transport_error(e))?;

        let status = resp.status();
        if !status.is_success() {
            let text = resp
                .text()
                .await
                .unwrap_or_else(|_| "<body unavailable>".to_string());
            return Err(provider_error(self.provider, status.as_u16(), &text));
        }

        let parsed: ChatResponse = resp
            .json()
            .await
            .map_err(|e| StageError::backend(self.provider, format!("unparseable response: {e}")))?;
        parsed
            .choices
            .into_iter()
            .find_map(|choice| choice.message.content)
            .ok_or_else(|| StageError::backend(self.provider, "response contained no message"))
    }

    fn transport_error(&self, e: reqwest::Error) -> StageError {
        if e.is_timeout() {
            StageError::backend(
                self.provider,
                format!("request timed out after {}s", self.config.timeout_secs),
            )
        } else {
            StageError::backend(self.provider, format!("request failed: {e}"))
        }
    }
}

/// Extracts `error.message` from a provider error body, falling back to the raw text.
fn provider_message(body: &str) -> String {
    serde_json::from_str::<Value>(body)
        .ok()
        .and_then(|v| {
            v.pointer("/error/message")
                .and_then(Value::as_str)
                .map(str::to_string)
        })
        .unwrap_or_else(|| body.trim().to_string())
}

/// Normalizes a non-2xx provider response. Failures to download the image
/// referenced in the request surface as unreachable rather than backend errors.
pub fn provider_error(provider: &str, status: u16, body: &str) -> StageError {
    let message = provider_message(body);
    let lower = message.to_ascii_lowercase();
    if (400..500).contains(&status) && lower.contains("download") {
        let cause = if lower.contains("timeout") || lower.contains("timed out") {
            UnreachableCause::Timeout
        } else {
            UnreachableCause::NotFound
        };
        return StageError::Unreachable {
            cause,
            url: extract_url(&message).unwrap_or_default(),
            detail: message,
        };
    }
    StageError::backend(provider, format!("HTTP {status}: {message}"))
}

fn extract_url(message: &str) -> Option<String> {
    message
        .split_whitespace()
        .find(|w| w.starts_with("http://") || w.starts_with("https://"))
        .map(|w| w.trim_end_matches(['.', ',', ')']).to_string())
}

/// Parses a JSON-mode reply, tolerating a fenced code block around it.
pub fn parse_json_reply(provider: &str, reply: &str) -> Result<Value, StageError> {
    let trimmed = reply.trim();
    let unfenced = trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
        .and_then(|rest| rest.strip_suffix("```"))
        .unwrap_or(trimmed)
        .trim();
    serde_json::from_str(unfenced)
        .map_err(|e| StageError::backend(provider, format!("reply is not valid JSON: {e}")))
}
