//! Owns everything the LLM sees (§3, §4.2). The one place all budget,
//! compression, and recall decisions happen.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::config::{BudgetConfig, CompressionConfig};
use crate::error::ContextError;
use crate::events::{AgentEvent, EventBus};
use crate::storage::Storage;
use crate::types::{ToolCall, ToolSchema, Usage};

/// Estimate tokens for a plain string. bytes/4 heuristic — no guaranteed
/// token counts (§1 Non-goals); good enough for trend detection.
pub fn estimate_str_tokens(s: &str) -> u32 {
    (s.len() as u32) / 4
}

fn new_message_key() -> String {
    format!("msg_{}", &uuid::Uuid::new_v4().simple().to_string()[..8])
}

fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    User,
    Assistant,
}

/// Optional per-message metadata (§3).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MessageMetadata {
    pub tool_name: Option<String>,
    pub source: Option<String>,
    pub compressible: Option<bool>,
}

/// A single conversation entry (§3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub key: String,
    pub role: MessageRole,
    pub content: String,
    pub tokens: u32,
    pub compressed: bool,
    pub original_tokens: Option<u32>,
    pub timestamp: i64,
    pub metadata: MessageMetadata,
}

/// Projection used by the Synthesizer (§3).
#[derive(Debug, Clone)]
pub struct SynthesisMessage {
    pub key: String,
    pub role: MessageRole,
    pub content: String,
    pub tool_name: Option<String>,
    pub source: Option<String>,
    pub compressed: bool,
}

/// Derived budget snapshot (§3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BudgetState {
    pub total: u32,
    pub used: u32,
    pub available: u32,
    pub breakdown: BudgetBreakdown,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BudgetBreakdown {
    pub system_prompt: u32,
    pub messages: u32,
    pub reserved: u32,
}

/// Debug record of one LLM turn (§3), persisted to `turns/<agent>-<NNN>.json`.
#[derive(Debug, Clone, Serialize)]
pub struct LlmTurn {
    pub agent: String,
    pub system_prompt: String,
    pub input_messages: Vec<TurnMessageRef>,
    pub tool_schemas: Vec<ToolSchema>,
    pub output_content: String,
    pub output_thinking: Option<String>,
    pub tool_calls: Vec<ToolCall>,
    pub usage: Option<Usage>,
    pub decision_summary: String,
    pub tool_result: Option<String>,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct TurnMessageRef {
    pub key: String,
    pub compressed: bool,
}

/// The live session (§3). Owned by `ContextManager` for the lifetime of a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub query: String,
    pub started_at: i64,
    pub working_dir: String,
    pub messages: Vec<Message>,
    pub total_tokens: u32,
    /// key -> on-disk path, only for messages ever saved to Storage.
    pub storage: HashMap<String, String>,
}

/// Result of a `Recall` (§4.2).
#[derive(Debug, Clone, Serialize)]
pub struct RecallResult {
    pub success: bool,
    pub content: Option<String>,
    pub tokens: Option<u32>,
    pub source: Option<String>,
    pub note: Option<String>,
    pub hint_keys: Option<Vec<String>>,
}

/// Owns everything the LLM sees. The one place all context decisions happen.
#[async_trait]
pub trait ContextManager: Send + Sync {
    async fn init_session(&mut self, query: &str, working_dir: &str) -> Result<(), ContextError>;
    async fn add_message(
        &mut self,
        role: MessageRole,
        content: String,
        metadata: MessageMetadata,
    ) -> Result<Message, ContextError>;
    fn get_messages_for_llm(&self) -> Vec<(MessageRole, String)>;
    fn get_messages_for_synthesis(&self) -> Vec<SynthesisMessage>;
    fn set_system_prompt_tokens(&mut self, n: u32);
    async fn recall(&self, key: &str) -> RecallResult;
    async fn save(&self) -> Result<(), ContextError>;
    async fn save_llm_turn(
        &self,
        agent: &str,
        turn_number: u32,
        turn: &LlmTurn,
    ) -> Result<(), ContextError>;
    fn budget(&self) -> BudgetState;
    fn session_id(&self) -> Option<&str>;
    fn key_files(&self) -> &[String];
    fn push_key_file(&mut self, file: String);
    fn message_refs(&self) -> Vec<TurnMessageRef>;
}

/// Filesystem- and budget-backed `ContextManager`.
pub struct ManagedContextManager {
    storage: Arc<dyn Storage>,
    events: Option<Arc<EventBus>>,
    budget_config: BudgetConfig,
    compression: CompressionConfig,
    system_prompt_tokens: u32,
    session: Option<Session>,
    key_files: Vec<String>,
}

impl ManagedContextManager {
    pub fn new(storage: Arc<dyn Storage>, budget_config: BudgetConfig) -> Self {
        Self {
            storage,
            events: None,
            budget_config,
            compression: CompressionConfig::default(),
            system_prompt_tokens: 0,
            session: None,
            key_files: Vec::new(),
        }
    }

    pub fn with_events(mut self, events: Arc<EventBus>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn with_compression_config(mut self, compression: CompressionConfig) -> Self {
        self.compression = compression;
        self
    }

    fn emit(&self, event: AgentEvent) {
        if let Some(ref bus) = self.events {
            bus.emit(event);
        }
    }

    fn session_mut(&mut self) -> Result<&mut Session, ContextError> {
        self.session.as_mut().ok_or(ContextError::NoActiveSession)
    }

    fn compute_budget(session: &Session, budget_config: &BudgetConfig, system_prompt_tokens: u32) -> BudgetState {
        let total = budget_config.context_window;
        let reserved = budget_config.reserved();
        let used = system_prompt_tokens + session.total_tokens;
        let available = total.saturating_sub(used).saturating_sub(reserved);
        BudgetState {
            total,
            used,
            available,
            breakdown: BudgetBreakdown {
                system_prompt: system_prompt_tokens,
                messages: session.total_tokens,
                reserved,
            },
        }
    }

    /// A message is compressible iff not already compressed, not explicitly
    /// marked `compressible = false`, and either carries a `toolName` or has
    /// at least `minTokensToCompress` tokens.
    fn is_compressible(&self, m: &Message) -> bool {
        if m.compressed {
            return false;
        }
        if m.metadata.compressible == Some(false) {
            return false;
        }
        m.metadata.tool_name.is_some() || m.tokens >= self.compression.min_tokens_to_compress
    }

    fn is_high_priority_tool(tool_name: &str) -> bool {
        tool_name == "read_file" || tool_name == "ripgrep"
    }

    /// Run compression candidates in ROI order until the target ratio is met
    /// or candidates are exhausted, then fall back to eviction (§4.2).
    async fn maybe_compress(&mut self) -> Result<(), ContextError> {
        let total = self.budget_config.context_window as f32;
        let used = {
            let session = self.session.as_ref().ok_or(ContextError::NoActiveSession)?;
            (session.total_tokens + self.system_prompt_tokens) as f32
        };
        if used / total < self.compression.trigger_ratio {
            return Ok(());
        }

        loop {
            let used_now = {
                let session = self.session.as_ref().ok_or(ContextError::NoActiveSession)?;
                (session.total_tokens + self.system_prompt_tokens) as f32
            };
            if used_now / total <= self.compression.target_ratio {
                return Ok(());
            }

            let candidate = self.pick_compression_candidate();
            match candidate {
                Some(idx) => self.compress_message_at(idx).await?,
                None => break,
            }
        }

        self.evict_until_target().await
    }

    /// Priority: high (read_file/ripgrep tool results) > medium (other tool
    /// results, generic text) > low (assistant messages); ties broken by
    /// savings descending.
    fn pick_compression_candidate(&self) -> Option<usize> {
        let session = self.session.as_ref()?;
        let protected_start = session
            .messages
            .len()
            .saturating_sub(self.compression.protected_recent_messages);

        let mut best: Option<(u8, u32, usize)> = None;
        for (idx, m) in session.messages.iter().enumerate() {
            if idx >= protected_start {
                continue;
            }
            if !self.is_compressible(m) {
                continue;
            }

            let ratio = if m.metadata.tool_name.is_some() { 0.05 } else { 0.20 };
            let estimated = (m.tokens as f32 * ratio).ceil().max(50.0) as u32;
            let savings = m.tokens.saturating_sub(estimated);

            let priority_rank = match &m.metadata.tool_name {
                Some(name) if Self::is_high_priority_tool(name) => 0u8,
                _ if m.role == MessageRole::Assistant => 2u8,
                _ => 1u8,
            };

            let better = match &best {
                None => true,
                Some((p, s, _)) => priority_rank < *p || (priority_rank == *p && savings > *s),
            };
            if better {
                best = Some((priority_rank, savings, idx));
            }
        }
        best.map(|(_, _, idx)| idx)
    }

    async fn compress_message_at(&mut self, idx: usize) -> Result<(), ContextError> {
        let (key, placeholder, old_tokens) = {
            let session = self.session.as_mut().ok_or(ContextError::NoActiveSession)?;
            let m = &mut session.messages[idx];
            let placeholder = build_placeholder(m);
            let new_tokens = estimate_str_tokens(&placeholder);
            let old_tokens = m.tokens;
            m.original_tokens = Some(old_tokens);
            m.content = placeholder.clone();
            m.tokens = new_tokens;
            m.compressed = true;
            session.total_tokens = session.total_tokens - old_tokens + new_tokens;
            (m.key.clone(), placeholder, old_tokens)
        };
        debug!(key = %key, "compressed message");
        self.emit(AgentEvent::Compression {
            freed_tokens: old_tokens.saturating_sub(estimate_str_tokens(&placeholder)),
            candidates: 1,
        });
        Ok(())
    }

    async fn evict_until_target(&mut self) -> Result<(), ContextError> {
        let total = self.budget_config.context_window as f32;
        let mut discarded = 0usize;
        let mut tokens_freed = 0u32;

        loop {
            let used = {
                let session = self.session.as_ref().ok_or(ContextError::NoActiveSession)?;
                (session.total_tokens + self.system_prompt_tokens) as f32
            };
            if used / total <= self.compression.target_ratio {
                break;
            }

            let protected_start = {
                let session = self.session.as_ref().ok_or(ContextError::NoActiveSession)?;
                session
                    .messages
                    .len()
                    .saturating_sub(self.compression.protected_recent_messages)
            };
            if protected_start == 0 {
                break;
            }

            let session = self.session.as_mut().ok_or(ContextError::NoActiveSession)?;
            let removed = session.messages.remove(0);
            session.total_tokens = session.total_tokens.saturating_sub(removed.tokens);
            tokens_freed += removed.tokens;
            discarded += 1;
        }

        if discarded > 0 {
            self.emit(AgentEvent::MessagesDiscarded {
                count: discarded,
                tokens_freed,
            });
        }
        Ok(())
    }
}

/// Build the compressed placeholder content for a message (§4.2).
fn build_placeholder(m: &Message) -> String {
    let key = &m.key;
    match m.metadata.tool_name.as_deref() {
        Some("read_file") => {
            let source = m.metadata.source.clone().unwrap_or_default();
            let line_count = m.content.lines().count();
            let symbols = extract_symbols(&m.content);
            let shown: Vec<&String> = symbols.iter().take(5).collect();
            let mut s = format!(
                "[COMPRESSED:{key}] 文件 {source} ({line_count}行) 包含: {}",
                shown
                    .iter()
                    .map(|s| s.as_str())
                    .collect::<Vec<_>>()
                    .join(",")
            );
            if symbols.len() > 5 {
                s.push_str(&format!(" [等{}个符号]", symbols.len()));
            }
            s.push_str(&format!("\n如需完整内容，使用 recall_detail(key=\"{key}\")"));
            s
        }
        Some("ripgrep") => {
            let matches = m.content.matches('\n').count();
            format!(
                "[COMPRESSED:{key}] 搜索结果 ({matches}个匹配)\n如需完整内容，使用 recall_detail(key=\"{key}\")"
            )
        }
        _ => {
            let collapsed: String = m
                .content
                .chars()
                .take(200)
                .collect::<String>()
                .replace('\n', " ");
            format!("[COMPRESSED:{key}] {collapsed}...\n如需完整内容，使用 recall_detail(key=\"{key}\")")
        }
    }
}

/// Up to five identifier names following `fn`/`class`/`type`/`interface`/`def`.
fn extract_symbols(content: &str) -> Vec<String> {
    const KEYWORDS: [&str; 5] = ["fn", "class", "type", "interface", "def"];
    let mut symbols = Vec::new();
    for line in content.lines() {
        let trimmed = line.trim_start();
        for kw in KEYWORDS {
            let prefix = format!("{kw} ");
            if let Some(rest) = trimmed.strip_prefix(&prefix) {
                let name: String = rest
                    .chars()
                    .take_while(|c| c.is_alphanumeric() || *c == '_')
                    .collect();
                if !name.is_empty() && !symbols.contains(&name) {
                    symbols.push(name);
                }
            }
        }
    }
    symbols
}

#[async_trait]
impl ContextManager for ManagedContextManager {
    async fn init_session(&mut self, query: &str, working_dir: &str) -> Result<(), ContextError> {
        let session = Session {
            id: uuid::Uuid::new_v4().to_string(),
            query: query.to_string(),
            started_at: now_millis(),
            working_dir: working_dir.to_string(),
            messages: Vec::new(),
            total_tokens: 0,
            storage: HashMap::new(),
        };
        self.storage.create_session(&session.id).await?;
        self.session = Some(session);
        self.system_prompt_tokens = 0;
        Ok(())
    }

    async fn add_message(
        &mut self,
        role: MessageRole,
        content: String,
        metadata: MessageMetadata,
    ) -> Result<Message, ContextError> {
        let tokens = estimate_str_tokens(&content);
        let key = new_message_key();
        let message = Message {
            key: key.clone(),
            role,
            content,
            tokens,
            compressed: false,
            original_tokens: None,
            timestamp: now_millis(),
            metadata,
        };

        let compressible = self.is_compressible(&message);
        if compressible {
            let session_id = self.session_id().ok_or(ContextError::NoActiveSession)?.to_string();
            let path = self.storage.save_message_content(&session_id, &message).await?;
            let session = self.session_mut()?;
            session.storage.insert(key.clone(), path);
        }

        {
            let session = self.session_mut()?;
            session.messages.push(message.clone());
            session.total_tokens += tokens;
        }

        self.maybe_compress().await?;
        self.save().await?;

        Ok(message)
    }

    fn get_messages_for_llm(&self) -> Vec<(MessageRole, String)> {
        match &self.session {
            Some(s) => s.messages.iter().map(|m| (m.role, m.content.clone())).collect(),
            None => Vec::new(),
        }
    }

    fn get_messages_for_synthesis(&self) -> Vec<SynthesisMessage> {
        let Some(session) = &self.session else {
            return Vec::new();
        };

        session
            .messages
            .iter()
            .filter(|m| !m.content.contains("执行失败") && !m.content.contains("错误:"))
            .filter(|m| {
                !matches!(
                    m.metadata.tool_name.as_deref(),
                    Some("list_dir") | Some("ripgrep")
                )
            })
            .map(|m| SynthesisMessage {
                key: m.key.clone(),
                role: m.role,
                content: m.content.clone(),
                tool_name: m.metadata.tool_name.clone(),
                source: m.metadata.source.clone(),
                compressed: m.compressed,
            })
            .collect()
    }

    fn set_system_prompt_tokens(&mut self, n: u32) {
        self.system_prompt_tokens = n;
    }

    async fn recall(&self, key: &str) -> RecallResult {
        let Some(session) = &self.session else {
            return RecallResult {
                success: false,
                content: None,
                tokens: None,
                source: None,
                note: Some("no_session".to_string()),
                hint_keys: None,
            };
        };

        let Some(message) = session.messages.iter().find(|m| m.key == key) else {
            let hints: Vec<String> = session
                .messages
                .iter()
                .filter(|m| m.compressed)
                .take(5)
                .map(|m| m.key.clone())
                .collect();
            return RecallResult {
                success: false,
                content: None,
                tokens: None,
                source: None,
                note: Some("unknown key".to_string()),
                hint_keys: Some(hints),
            };
        };

        if !message.compressed {
            return RecallResult {
                success: true,
                content: Some(message.content.clone()),
                tokens: Some(message.tokens),
                source: message.metadata.source.clone(),
                note: Some("not compressed".to_string()),
                hint_keys: None,
            };
        }

        match self.storage.load_message_content(&session.id, key).await {
            Ok(original) => RecallResult {
                success: true,
                content: Some(original.content),
                tokens: Some(original.tokens),
                source: original.metadata.source.clone(),
                note: None,
                hint_keys: None,
            },
            Err(e) => RecallResult {
                success: false,
                content: None,
                tokens: None,
                source: None,
                note: Some(e.to_string()),
                hint_keys: None,
            },
        }
    }

    async fn save(&self) -> Result<(), ContextError> {
        let Some(session) = &self.session else {
            return Ok(());
        };
        let value = serde_json::to_value(session).map_err(|e| ContextError::Storage(e.to_string()))?;
        self.storage.save_session(&session.id, &value).await?;
        Ok(())
    }

    async fn save_llm_turn(
        &self,
        agent: &str,
        turn_number: u32,
        turn: &LlmTurn,
    ) -> Result<(), ContextError> {
        let Some(session) = &self.session else {
            return Err(ContextError::NoActiveSession);
        };
        let value = serde_json::to_value(turn).map_err(|e| ContextError::Storage(e.to_string()))?;
        self.storage
            .save_turn(&session.id, agent, turn_number, &value)
            .await?;
        Ok(())
    }

    fn budget(&self) -> BudgetState {
        match &self.session {
            Some(s) => Self::compute_budget(s, &self.budget_config, self.system_prompt_tokens),
            None => BudgetState {
                total: self.budget_config.context_window,
                used: self.system_prompt_tokens,
                available: self.budget_config.context_window,
                breakdown: BudgetBreakdown {
                    system_prompt: self.system_prompt_tokens,
                    messages: 0,
                    reserved: self.budget_config.reserved(),
                },
            },
        }
    }

    fn session_id(&self) -> Option<&str> {
        self.session.as_ref().map(|s| s.id.as_str())
    }

    fn key_files(&self) -> &[String] {
        &self.key_files
    }

    fn push_key_file(&mut self, file: String) {
        if !self.key_files.contains(&file) {
            self.key_files.push(file);
        }
    }

    fn message_refs(&self) -> Vec<TurnMessageRef> {
        match &self.session {
            Some(s) => s
                .messages
                .iter()
                .map(|m| TurnMessageRef {
                    key: m.key.clone(),
                    compressed: m.compressed,
                })
                .collect(),
            None => Vec::new(),
        }
    }
}
