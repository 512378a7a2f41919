use async_trait::async_trait;
use serde_json::Value;

use crate::error::LlmError;
use crate::types::{CompletionOptions, CompletionResponse, LlmMessage, Role, ToolCall, Usage};

/// Provider-agnostic request interface (§4.4): messages in, text + tool
/// calls + usage out. A streaming variant is permitted but not required —
/// the Investigator and Synthesizer use `complete` only.
#[async_trait]
pub trait LLMClient: Send + Sync {
    async fn complete(
        &self,
        messages: Vec<LlmMessage>,
        options: CompletionOptions,
    ) -> Result<CompletionResponse, LlmError>;
}

#[async_trait]
impl LLMClient for Box<dyn LLMClient> {
    async fn complete(
        &self,
        messages: Vec<LlmMessage>,
        options: CompletionOptions,
    ) -> Result<CompletionResponse, LlmError> {
        (**self).complete(messages, options).await
    }
}

/// Claude API client via Anthropic's messages endpoint.
pub struct AnthropicProvider {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
    model: String,
    max_tokens: u32,
}

impl AnthropicProvider {
    pub fn new(api_key: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key: api_key.into(),
            base_url: "https://api.anthropic.com".into(),
            model: model.into(),
            max_tokens: 4096,
        }
    }

    pub fn with_client(mut self, client: reqwest::Client) -> Self {
        self.client = client;
        self
    }

    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = url.into();
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }
}

fn role_str(role: Role) -> &'static str {
    match role {
        Role::System => "system",
        Role::User => "user",
        Role::Assistant => "assistant",
    }
}

#[async_trait]
impl LLMClient for AnthropicProvider {
    async fn complete(
        &self,
        messages: Vec<LlmMessage>,
        options: CompletionOptions,
    ) -> Result<CompletionResponse, LlmError> {
        let wire_messages: Vec<Value> = messages
            .iter()
            .map(|m| {
                serde_json::json!({
                    "role": role_str(m.role),
                    "content": m.content,
                })
            })
            .collect();

        let mut body = serde_json::json!({
            "model": self.model,
            "max_tokens": self.max_tokens,
            "messages": wire_messages,
        });

        if let Some(system) = &options.system_prompt {
            body["system"] = Value::String(system.clone());
        }

        if !options.tools.is_empty() {
            let tools: Vec<Value> = options
                .tools
                .iter()
                .map(|t| {
                    serde_json::json!({
                        "name": t.name,
                        "description": t.description,
                        "input_schema": t.parameters,
                    })
                })
                .collect();
            body["tools"] = Value::Array(tools);
        }

        if let Some(thinking) = options.thinking {
            body["thinking"] = serde_json::json!({
                "type": "enabled",
                "budget_tokens": thinking.budget_tokens,
            });
        }

        let resp = self
            .client
            .post(format!("{}/v1/messages", self.base_url))
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", "2023-06-01")
            .header("content-type", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(|e| LlmError::Unknown(e.to_string()))?;

        let status = resp.status().as_u16();
        let text = resp
            .text()
            .await
            .map_err(|e| LlmError::Unknown(e.to_string()))?;

        match status {
            200 => {}
            401 | 403 => return Err(LlmError::AuthError),
            429 => {
                let retry_after = None;
                return Err(LlmError::RateLimit { retry_after });
            }
            400 => return Err(LlmError::InvalidRequest(text)),
            503 => return Err(LlmError::ServiceUnavailable),
            _ => return Err(LlmError::Unknown(format!("status {status}: {text}"))),
        }

        let parsed: Value =
            serde_json::from_str(&text).map_err(|e| LlmError::Unknown(e.to_string()))?;

        let mut content = String::new();
        let mut thinking = None;
        let mut tool_calls = Vec::new();

        for block in parsed["content"].as_array().cloned().unwrap_or_default() {
            match block["type"].as_str() {
                Some("text") => {
                    content.push_str(block["text"].as_str().unwrap_or(""));
                }
                Some("thinking") => {
                    thinking = Some(block["thinking"].as_str().unwrap_or("").to_string());
                }
                Some("tool_use") => {
                    tool_calls.push(ToolCall {
                        name: block["name"].as_str().unwrap_or_default().to_string(),
                        arguments: block["input"].clone(),
                    });
                }
                _ => {}
            }
        }

        let usage = Usage {
            input_tokens: parsed["usage"]["input_tokens"].as_u64().unwrap_or(0) as u32,
            output_tokens: parsed["usage"]["output_tokens"].as_u64().unwrap_or(0) as u32,
            cache_hit: parsed["usage"]["cache_read_input_tokens"]
                .as_u64()
                .map(|n| n > 0),
            cached_tokens: parsed["usage"]["cache_read_input_tokens"]
                .as_u64()
                .map(|n| n as u32),
        };

        Ok(CompletionResponse {
            content,
            tool_calls,
            usage: Some(usage),
            thinking,
        })
    }
}
