use serde_json::json;

use crate::config::ToolsConfig;
use crate::types::ToolSchema;

use super::handler::{ToolDef, ToolHandler, ToolParameter};

/// Catalog of available tools (§4.3). Stores definitions, produces the
/// LLM-wire schema list, looks up handlers by name, and offers a keyword
/// search for deferred-tool discovery.
pub struct ToolRegistry {
    tools: Vec<ToolDef>,
    config: ToolsConfig,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self {
            tools: Vec::new(),
            config: ToolsConfig::default(),
        }
    }

    pub fn with_config(config: ToolsConfig) -> Self {
        Self {
            tools: Vec::new(),
            config,
        }
    }

    fn is_allowed(&self, name: &str) -> bool {
        if self.config.disabled_tools.iter().any(|n| n == name) {
            return false;
        }
        match &self.config.enabled_tools {
            Some(allowed) => allowed.iter().any(|n| n == name),
            None => true,
        }
    }

    /// Register a tool. Registration of a disallowed or non-enabled tool
    /// is silently skipped (§4.3).
    pub fn add(
        mut self,
        name: impl Into<String>,
        description: impl Into<String>,
        parameters: Vec<ToolParameter>,
        handler: impl ToolHandler + 'static,
    ) -> Self {
        let name = name.into();
        if !self.is_allowed(&name) {
            return self;
        }
        self.tools.push(ToolDef {
            name,
            description: description.into(),
            parameters,
            handler: Box::new(handler),
        });
        self
    }

    /// All tool schemas for the LLM request.
    pub fn schemas(&self) -> Vec<ToolSchema> {
        self.tools
            .iter()
            .map(|t| ToolSchema {
                name: t.name.clone(),
                description: t.description.clone(),
                parameters: t.to_llm_schema(),
            })
            .collect()
    }

    /// Look up a tool's handler by name and execute it.
    pub async fn execute(&self, name: &str, input: &serde_json::Value) -> Result<String, String> {
        let tool = self
            .tools
            .iter()
            .find(|t| t.name == name)
            .ok_or_else(|| {
                let names = self.tool_names().join(", ");
                format!("unknown tool: {name}. Available tools: {names}")
            })?;
        tool.handler.call(input).await
    }

    /// Search tools by query against name and description. Returns compact
    /// summaries only, so discovery doesn't blow the context budget.
    pub fn search(&self, query: &str) -> Vec<serde_json::Value> {
        let query_lower = query.to_lowercase();
        let terms: Vec<&str> = query_lower.split_whitespace().collect();

        self.tools
            .iter()
            .filter(|t| {
                let haystack = format!("{} {}", t.name.to_lowercase(), t.description.to_lowercase());
                terms.iter().any(|term| haystack.contains(term))
            })
            .map(|t| json!({ "name": t.name, "description": t.description }))
            .collect()
    }

    pub fn tool_names(&self) -> Vec<&str> {
        self.tools.iter().map(|t| t.name.as_str()).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}
