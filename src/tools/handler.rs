use async_trait::async_trait;
use serde_json::Value;

/// A tool's execution handler. Consumers implement this for each tool
/// (the concrete file-search/read/list implementations are out of scope
/// here — only the interface is specified).
#[async_trait]
pub trait ToolHandler: Send + Sync {
    async fn call(&self, input: &Value) -> Result<String, String>;
}

/// A single JSON-Schema-shaped parameter description (§4.3).
#[derive(Debug, Clone)]
pub struct ToolParameter {
    pub name: String,
    pub param_type: String,
    pub description: String,
    pub required: bool,
    pub enum_values: Option<Vec<String>>,
}

impl ToolParameter {
    pub fn new(name: impl Into<String>, param_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            param_type: param_type.into(),
            description: String::new(),
            required: false,
            enum_values: None,
        }
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    pub fn with_enum(mut self, values: Vec<String>) -> Self {
        self.enum_values = Some(values);
        self
    }
}

/// A tool definition: name, description, typed parameters, and the handler
/// that executes it.
pub struct ToolDef {
    pub name: String,
    pub description: String,
    pub parameters: Vec<ToolParameter>,
    pub(crate) handler: Box<dyn ToolHandler>,
}

impl ToolDef {
    /// Lower the typed parameter list to the LLM-wire representation:
    /// `{type: "object", properties, required}`.
    pub fn to_llm_schema(&self) -> Value {
        let mut properties = serde_json::Map::new();
        let mut required = Vec::new();
        for p in &self.parameters {
            let mut prop = serde_json::json!({
                "type": p.param_type,
                "description": p.description,
            });
            if let Some(values) = &p.enum_values {
                prop["enum"] = serde_json::json!(values);
            }
            properties.insert(p.name.clone(), prop);
            if p.required {
                required.push(p.name.clone());
            }
        }

        serde_json::json!({
            "type": "object",
            "properties": Value::Object(properties),
            "required": required,
        })
    }
}
