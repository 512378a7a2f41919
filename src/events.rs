//! Typed event bus (§4, §6). Synchronous fan-out to any number of
//! subscribers; a panicking subscriber is caught and logged rather than
//! breaking the bus (§5 "Shared resources"). An optional buffering mode
//! captures emitted events for non-interactive JSON output.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Mutex;

use serde_json::Value;
use tracing::error;

use crate::context::BudgetState;
use crate::decision::Decision;

/// Events emitted during a run, in strict program order (§5 "Ordering").
#[derive(Debug, Clone)]
pub enum AgentEvent {
    SessionStart { session_id: String, query: String },
    SessionEnd { session_id: String },
    IterationStart { iteration: u32, max_iterations: u32, budget: BudgetState },
    IterationEnd { iteration: u32, decision: Decision, tokens_used: u32 },
    Thinking { content: String },
    ToolCall { name: String, arguments: Value },
    ToolResult { name: String, result: String, duration_ms: u64 },
    Done { result: String },
    Error { error: String, recoverable: bool, retrying: bool },
    Compression { freed_tokens: u32, candidates: usize },
    Recall { key: String, success: bool, tokens_recalled: Option<u32> },
    MessagesDiscarded { count: usize, tokens_freed: u32 },
    PhaseStart { phase: Phase },
    PhaseEnd { phase: Phase, tokens_used: u32 },
    SynthesisStart,
    SynthesisComplete { tokens_used: u32 },
    SynthesisError { error: String },
    OrchestratorStart { query: String },
    OrchestratorComplete { success: bool, total_tokens_used: u32 },
    OrchestratorError { error: String },
}

/// The two Orchestrator phases, named for `phase_start`/`phase_end` events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Investigation,
    Synthesis,
}

type Subscriber = Box<dyn Fn(&AgentEvent) + Send + Sync>;

/// Synchronous fan-out bus. `emit` invokes every subscriber in registration
/// order; a subscriber that panics is caught and logged, never breaking the
/// bus for the remaining subscribers.
#[derive(Default)]
pub struct EventBus {
    subscribers: Vec<Subscriber>,
    buffer: Mutex<Option<Vec<AgentEvent>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            subscribers: Vec::new(),
            buffer: Mutex::new(None),
        }
    }

    pub fn subscribe(&mut self, f: impl Fn(&AgentEvent) + Send + Sync + 'static) {
        self.subscribers.push(Box::new(f));
    }

    /// Switch into buffering mode: events are captured instead of (or in
    /// addition to) reaching subscribers, for later draining.
    pub fn enable_buffering(&self) {
        *self.buffer.lock().unwrap() = Some(Vec::new());
    }

    /// Drain and disable buffering, returning whatever was captured.
    pub fn drain(&self) -> Vec<AgentEvent> {
        self.buffer.lock().unwrap().take().unwrap_or_default()
    }

    pub fn emit(&self, event: AgentEvent) {
        if let Some(buf) = self.buffer.lock().unwrap().as_mut() {
            buf.push(event.clone());
        }

        for subscriber in &self.subscribers {
            let result = catch_unwind(AssertUnwindSafe(|| subscriber(&event)));
            if result.is_err() {
                error!("event subscriber panicked, continuing bus dispatch");
            }
        }
    }
}
