//! Two-phase pipeline: Investigator then Synthesizer, with a best-effort
//! fallback to raw findings if synthesis fails (§4.7).

use std::sync::Arc;

use crate::config::AgentConfig;
use crate::context::ContextManager;
use crate::decision::Decision;
use crate::error::AgentError;
use crate::events::{AgentEvent, EventBus, Phase};
use crate::investigator::Investigator;
use crate::provider::LLMClient;
use crate::synthesizer::Synthesizer;
use crate::tools::ToolRegistry;
use crate::types::Usage;
use tokio_util::sync::CancellationToken;

/// Outcome of `Orchestrator::run` (§4.7).
#[derive(Debug)]
pub struct OrchestratorResult {
    pub success: bool,
    pub result: String,
    pub iterations: u32,
    pub total_tokens_used: u32,
    pub decisions: Vec<Decision>,
    pub error: Option<String>,
}

pub struct Orchestrator<'a> {
    llm: &'a dyn LLMClient,
    tools: &'a ToolRegistry,
    context: &'a mut dyn ContextManager,
    config: AgentConfig,
    events: Option<Arc<EventBus>>,
    cancel: CancellationToken,
}

impl<'a> Orchestrator<'a> {
    pub fn new(
        llm: &'a dyn LLMClient,
        tools: &'a ToolRegistry,
        context: &'a mut dyn ContextManager,
        config: AgentConfig,
    ) -> Self {
        Self {
            llm,
            tools,
            context,
            config,
            events: None,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_events(mut self, events: Arc<EventBus>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    fn emit(&self, event: AgentEvent) {
        if let Some(bus) = &self.events {
            bus.emit(event);
        }
    }

    pub async fn run(&mut self, query: &str, working_dir: &str) -> Result<OrchestratorResult, AgentError> {
        self.emit(AgentEvent::OrchestratorStart {
            query: query.to_string(),
        });

        self.context.init_session(query, working_dir).await?;
        self.emit(AgentEvent::SessionStart {
            session_id: self.context.session_id().unwrap_or_default().to_string(),
            query: query.to_string(),
        });

        self.emit(AgentEvent::PhaseStart {
            phase: Phase::Investigation,
        });

        let mut investigator = Investigator::new(self.llm, self.tools, self.context, self.config.clone())
            .with_cancellation(self.cancel.clone());
        if let Some(events) = &self.events {
            investigator = investigator.with_events(events.clone());
        }

        let investigation = match investigator.run().await {
            Ok(r) => r,
            Err(e) => {
                self.emit(AgentEvent::OrchestratorError {
                    error: e.to_string(),
                });
                return Ok(OrchestratorResult {
                    success: false,
                    result: String::new(),
                    iterations: 0,
                    total_tokens_used: 0,
                    decisions: Vec::new(),
                    error: Some(e.to_string()),
                });
            }
        };

        let investigation_tokens = investigation.usage.input_tokens + investigation.usage.output_tokens;
        self.emit(AgentEvent::PhaseEnd {
            phase: Phase::Investigation,
            tokens_used: investigation_tokens,
        });

        if self.cancel.is_cancelled() {
            self.emit(AgentEvent::OrchestratorError {
                error: "Aborted".to_string(),
            });
            return Ok(OrchestratorResult {
                success: false,
                result: String::new(),
                iterations: investigation.iterations,
                total_tokens_used: investigation_tokens,
                decisions: investigation.decisions,
                error: Some("Aborted".to_string()),
            });
        }

        if !investigation.success {
            self.emit(AgentEvent::OrchestratorComplete {
                success: false,
                total_tokens_used: investigation_tokens,
            });
            return Ok(OrchestratorResult {
                success: false,
                result: investigation.findings,
                iterations: investigation.iterations,
                total_tokens_used: investigation_tokens,
                decisions: investigation.decisions,
                error: None,
            });
        }

        self.emit(AgentEvent::PhaseStart {
            phase: Phase::Synthesis,
        });

        let mut synthesizer = Synthesizer::new(self.llm, &*self.context);
        if let Some(events) = &self.events {
            synthesizer = synthesizer.with_events(events.clone());
        }

        let (result, total_usage) = match synthesizer.run(query, &investigation.key_files).await {
            Ok(s) => {
                let mut usage = investigation.usage.clone();
                usage.accumulate(&s.usage);
                (s.report, usage)
            }
            Err(e) => {
                self.emit(AgentEvent::SynthesisError {
                    error: e.to_string(),
                });
                (investigation.findings.clone(), investigation.usage.clone())
            }
        };

        let total_tokens_used = total_usage.input_tokens + total_usage.output_tokens;
        self.emit(AgentEvent::PhaseEnd {
            phase: Phase::Synthesis,
            tokens_used: total_tokens_used,
        });
        self.emit(AgentEvent::OrchestratorComplete {
            success: true,
            total_tokens_used,
        });
        self.emit(AgentEvent::Done {
            result: result.clone(),
        });

        Ok(OrchestratorResult {
            success: true,
            result,
            iterations: investigation.iterations,
            total_tokens_used,
            decisions: investigation.decisions,
            error: None,
        })
    }
}
