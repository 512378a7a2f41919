//! Recognized configuration options (§6). Loading from a file or the
//! environment is the external CLI collaborator's job — this module only
//! defines the typed shape and the literal defaults the spec gives.

/// `agent.*` options.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub max_iterations: u32,
    pub stuck_threshold: usize,
    pub enable_thinking: bool,
    pub thinking_budget: u32,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            max_iterations: 20,
            stuck_threshold: 3,
            enable_thinking: false,
            thinking_budget: 4096,
        }
    }
}

/// `budget.*` options — immutable inputs to `BudgetState` (§3).
#[derive(Debug, Clone, Copy)]
pub struct BudgetConfig {
    pub context_window: u32,
    pub reserved_for_synthesis: u32,
    pub reserved_for_recalls: u32,
    pub reserved_for_next_steps: u32,
}

impl BudgetConfig {
    pub fn reserved(&self) -> u32 {
        self.reserved_for_synthesis + self.reserved_for_recalls + self.reserved_for_next_steps
    }
}

impl Default for BudgetConfig {
    fn default() -> Self {
        Self {
            context_window: 262_144,
            reserved_for_synthesis: 30_000,
            reserved_for_recalls: 20_000,
            reserved_for_next_steps: 15_000,
        }
    }
}

/// `tools.*` options — allow/deny lists applied at registration time.
#[derive(Debug, Clone, Default)]
pub struct ToolsConfig {
    pub enabled_tools: Option<Vec<String>>,
    pub disabled_tools: Vec<String>,
}

/// Compression/eviction tuning. Not independently listed in §6's option
/// table but referenced throughout §4.2 by name; grouped here so callers
/// configure one struct.
#[derive(Debug, Clone, Copy)]
pub struct CompressionConfig {
    pub min_tokens_to_compress: u32,
    pub trigger_ratio: f32,
    pub target_ratio: f32,
    pub protected_recent_messages: usize,
}

impl Default for CompressionConfig {
    fn default() -> Self {
        Self {
            min_tokens_to_compress: 200,
            trigger_ratio: 0.80,
            target_ratio: 0.60,
            protected_recent_messages: 4,
        }
    }
}
