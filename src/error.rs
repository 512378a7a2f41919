/// LLM-call error kinds (design-level, §7). Retries are the client's
/// responsibility; these surface only when a retry budget is exhausted.
#[derive(Debug, Clone, thiserror::Error)]
pub enum LlmError {
    #[error("rate limited{}", retry_after.map(|s| format!(", retry after {s}s")).unwrap_or_default())]
    RateLimit { retry_after: Option<u32> },
    #[error("request timed out")]
    Timeout,
    #[error("service unavailable")]
    ServiceUnavailable,
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("authentication error")]
    AuthError,
    #[error("context window overflow")]
    ContextOverflow,
    #[error("unknown LLM error: {0}")]
    Unknown(String),
}

impl LlmError {
    /// rate_limit | timeout | service_unavailable are recoverable.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            LlmError::RateLimit { .. } | LlmError::Timeout | LlmError::ServiceUnavailable
        )
    }
}

/// Tool-execution error kinds (§7). Only `timeout` is recoverable; none of
/// these abort the Investigator loop — they become failed tool-result
/// messages fed back to the model.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ToolError {
    #[error("tool not found: {0}")]
    NotFound(String),
    #[error("permission denied: {0}")]
    PermissionDenied(String),
    #[error("tool timed out")]
    Timeout,
    #[error("invalid parameters: {0}")]
    InvalidParams(String),
    #[error("execution failed: {0}")]
    ExecutionFailed(String),
    #[error("unknown tool error: {0}")]
    Unknown(String),
}

impl ToolError {
    pub fn is_recoverable(&self) -> bool {
        matches!(self, ToolError::Timeout)
    }
}

/// Context-manager error kinds (§7). `overflow` is non-recoverable; the
/// rest are recoverable at the manager level (recall failures are returned
/// as structured payloads rather than thrown).
#[derive(Debug, Clone, thiserror::Error)]
pub enum ContextError {
    #[error("context overflow")]
    Overflow,
    #[error("storage error: {0}")]
    Storage(String),
    #[error("compression error: {0}")]
    Compression(String),
    #[error("recall error: {0}")]
    Recall(String),
    #[error("no active session")]
    NoActiveSession,
}

impl ContextError {
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, ContextError::Overflow)
    }
}

/// Top-level agent error (§7 "Agent errors"). `max_iterations` and
/// `stuck_loop` are handled internally by the Investigator (partial
/// findings / feedback-and-trim) and never surface here.
#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error("LLM error: {0}")]
    Llm(#[from] LlmError),
    #[error("tool error: {0}")]
    Tool(#[from] ToolError),
    #[error("context error: {0}")]
    Context(#[from] ContextError),
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("run aborted")]
    Aborted,
    #[error("unknown agent error: {0}")]
    Unknown(String),
}

/// Storage error kind, surfaced to `ContextError::Storage`.
#[derive(Debug, Clone, thiserror::Error)]
pub enum StorageError {
    #[error("io error: {0}")]
    Io(String),
    #[error("serialization error: {0}")]
    Serde(String),
    #[error("session not found: {0}")]
    SessionNotFound(String),
    #[error("message not found: {0}")]
    MessageNotFound(String),
}

impl From<std::io::Error> for StorageError {
    fn from(e: std::io::Error) -> Self {
        StorageError::Io(e.to_string())
    }
}

impl From<serde_json::Error> for StorageError {
    fn from(e: serde_json::Error) -> Self {
        StorageError::Serde(e.to_string())
    }
}

impl From<StorageError> for ContextError {
    fn from(e: StorageError) -> Self {
        ContextError::Storage(e.to_string())
    }
}
