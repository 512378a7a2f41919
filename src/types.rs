use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A message role in the LLM wire contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

/// A single message sent to the LLM.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmMessage {
    pub role: Role,
    pub content: String,
}

impl LlmMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

/// A tool call requested by the model. Arguments arrive as a parsed map.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCall {
    pub name: String,
    pub arguments: Value,
}

/// JSON-Schema-shaped tool definition sent to the LLM.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolSchema {
    pub name: String,
    pub description: String,
    /// `{type: "object", properties, required}`
    pub parameters: Value,
}

/// Extended-thinking configuration. None = disabled.
#[derive(Debug, Clone, Copy)]
pub struct ThinkingConfig {
    pub budget_tokens: u32,
}

/// Options accompanying a `Complete` call.
#[derive(Debug, Clone, Default)]
pub struct CompletionOptions {
    pub tools: Vec<ToolSchema>,
    pub system_prompt: Option<String>,
    pub thinking: Option<ThinkingConfig>,
}

/// Token usage for a single completion call.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Usage {
    pub input_tokens: u32,
    pub output_tokens: u32,
    pub cache_hit: Option<bool>,
    pub cached_tokens: Option<u32>,
}

impl Usage {
    pub fn accumulate(&mut self, other: &Usage) {
        self.input_tokens += other.input_tokens;
        self.output_tokens += other.output_tokens;
    }
}

/// What came back from the LLM: text, zero or more tool calls, usage, thinking.
#[derive(Debug, Clone, Default)]
pub struct CompletionResponse {
    pub content: String,
    pub tool_calls: Vec<ToolCall>,
    pub usage: Option<Usage>,
    pub thinking: Option<String>,
}
