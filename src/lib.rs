pub mod config;
pub mod context;
pub mod decision;
pub mod error;
pub mod events;
pub mod investigator;
pub mod orchestrator;
pub mod provider;
pub mod storage;
pub mod synthesizer;
pub mod tools;
pub mod types;

pub use config::{AgentConfig, BudgetConfig, CompressionConfig, ToolsConfig};
pub use context::{ContextManager, ManagedContextManager};
pub use decision::Decision;
pub use error::{AgentError, ContextError, LlmError, StorageError, ToolError};
pub use events::{AgentEvent, EventBus, Phase};
pub use investigator::{Investigator, InvestigatorResult};
pub use orchestrator::{Orchestrator, OrchestratorResult};
pub use provider::{AnthropicProvider, LLMClient};
pub use storage::{FileStorage, Storage};
pub use synthesizer::{Synthesizer, SynthesizerResult};
pub use tools::{ToolDef, ToolHandler, ToolParameter, ToolRegistry};
pub use types::{
    CompletionOptions, CompletionResponse, LlmMessage, Role, ThinkingConfig, ToolCall, ToolSchema,
    Usage,
};
