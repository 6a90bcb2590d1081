//! Generation backend client.
//!
//! [`Generator`] is the seam between the pipeline and the language model
//! service. [`OllamaClient`] speaks the Ollama HTTP API:
//!
//! - completion: `POST /api/generate {model, prompt, system?, stream: false}` → `{response}`
//! - chat: `POST /api/chat {model, messages, tools?, stream: false}` → `{message: {role, content, tool_calls?}}`
//!
//! Tool-call arguments arrive either as a JSON object or as a JSON string;
//! [`ToolCall::arguments`] normalises both.

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;

use crate::config::GenerationConfig;
use crate::error::BackendError;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    #[serde(default)]
    pub content: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
}

impl ChatMessage {
    fn new(role: &str, content: impl Into<String>) -> Self {
        Self {
            role: role.to_string(),
            content: content.into(),
            tool_calls: Vec::new(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new("system", content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new("user", content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new("assistant", content)
    }

    pub fn tool(content: impl Into<String>) -> Self {
        Self::new("tool", content)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub function: FunctionCall,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionCall {
    pub name: String,
    #[serde(default)]
    pub arguments: Value,
}

impl ToolCall {
    /// Arguments as a JSON object. A string is parsed as JSON; anything
    /// unparseable or non-object becomes `{}`.
    pub fn arguments(&self) -> Value {
        let parsed = match &self.function.arguments {
            Value::String(raw) if raw.trim().is_empty() => Value::Object(Default::default()),
            Value::String(raw) => match serde_json::from_str::<Value>(raw) {
                Ok(value) => value,
                Err(e) => {
                    tracing::warn!(tool = %self.function.name, error = %e, "tool call arguments are not valid JSON");
                    Value::Object(Default::default())
                }
            },
            other => other.clone(),
        };
        match parsed {
            Value::Object(_) => parsed,
            Value::Null => Value::Object(Default::default()),
            other => {
                tracing::warn!(tool = %self.function.name, arguments = %other, "tool call arguments are not an object");
                Value::Object(Default::default())
            }
        }
    }
}

#[async_trait]
pub trait Generator: Send + Sync {
    /// Single-shot completion.
    async fn generate(&self, model: &str, prompt: &str, system: Option<&str>) -> Result<String, BackendError>;

    /// Chat turn, optionally offering tool schemas; returns the assistant message.
    async fn chat(&self, model: &str, messages: &[ChatMessage], tools: &[Value]) -> Result<ChatMessage, BackendError>;
}

pub struct OllamaClient {
    client: reqwest::Client,
    base_url: String,
    temperature: f64,
}

impl OllamaClient {
    pub fn new(config: &GenerationConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .context("Failed to build generation HTTP client")?;
        Ok(Self {
            client,
            base_url: config.url.trim_end_matches('/').to_string(),
            temperature: config.temperature,
        })
    }

    async fn post(&self, path: &str, body: &Value) -> Result<Value, BackendError> {
        let endpoint = format!("{}{}", self.base_url, path);
        let response = self
            .client
            .post(&endpoint)
            .json(body)
            .send()
            .await
            .map_err(|e| BackendError::transport(&endpoint, e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(BackendError::Status {
                endpoint,
                status: status.as_u16(),
                body: response.text().await.unwrap_or_default(),
            });
        }

        let json: Value = response
            .json()
            .await
            .map_err(|e| BackendError::decode(&endpoint, e.to_string()))?;
        if let Some(message) = json.get("error").and_then(Value::as_str) {
            return Err(BackendError::decode(&endpoint, message));
        }
        Ok(json)
    }
}

#[async_trait]
impl Generator for OllamaClient {
    async fn generate(&self, model: &str, prompt: &str, system: Option<&str>) -> Result<String, BackendError> {
        let mut body = serde_json::json!({
            "model": model,
            "prompt": prompt,
            "stream": false,
            "options": { "temperature": self.temperature },
        });
        if let Some(system) = system {
            body["system"] = Value::from(system);
        }

        let json = self.post("/api/generate", &body).await?;
        json.get("response")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| BackendError::decode("/api/generate", "missing response field"))
    }

    async fn chat(&self, model: &str, messages: &[ChatMessage], tools: &[Value]) -> Result<ChatMessage, BackendError> {
        let mut body = serde_json::json!({
            "model": model,
            "messages": messages,
            "stream": false,
            "options": { "temperature": self.temperature },
        });
        if !tools.is_empty() {
            body["tools"] = Value::from(tools.to_vec());
        }

        let json = self.post("/api/chat", &body).await?;
        let message = json
            .get("message")
            .cloned()
            .ok_or_else(|| BackendError::decode("/api/chat", "missing message field"))?;
        serde_json::from_value(message).map_err(|e| BackendError::decode("/api/chat", e.to_string()))
    }
}
