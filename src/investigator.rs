//! ReAct loop: alternates model turns with tool execution, parses output
//! into a `Decision`, and enforces self-check / anti-hallucination /
//! anti-stuck feedback (§4.5).

use std::sync::{Arc, OnceLock};
use std::time::Instant;

use regex::Regex;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::config::AgentConfig;
use crate::context::{
    estimate_str_tokens, ContextManager, LlmTurn, MessageMetadata, MessageRole,
};
use crate::decision::{parse_decision, scrub_hallucinations, is_stuck, Decision, SENTINEL};
use crate::error::AgentError;
use crate::events::{AgentEvent, EventBus};
use crate::provider::LLMClient;
use crate::tools::ToolRegistry;
use crate::types::{CompletionOptions, LlmMessage, Role, ThinkingConfig, Usage};

const SYSTEM_PROMPT_TEMPLATE: &str = "\
You are an investigator exploring a codebase to answer a user's question. \
Gather evidence with the available tools before answering — do not guess. \
When you believe you have enough evidence, call the `think` tool once to \
self-check your reasoning, then respond with the literal marker \
[INVESTIGATION_COMPLETE] followed by your findings.\n\nAvailable tools:\n";

const INVALID_TOOL_CALL_MSG: &str = "请使用函数调用（tool calling）API 来调用工具，不要在文本中描述要调用的工具。";
const THINKING_PROMPT_MSG: &str = "请继续：调用一个工具以获取更多证据，或在完成调查后给出 [INVESTIGATION_COMPLETE] 标记及结论。";
const SELF_CHECK_MSG: &str = "必须先完成自检才能结束调查，请先调用 think 工具。";
const HALLUCINATION_MSG: &str = "检测到疑似虚构的工具执行结果，请使用函数调用（tool calling）API 实际调用工具，不要在文本中编造执行结果。";
const STUCK_WARNING: &str = "检测到循环：你已连续多次使用完全相同的工具和参数。请尝试不同的方法，或调用 think 工具进行自检。";

/// Outcome of `Investigator::run`.
#[derive(Debug)]
pub struct InvestigatorResult {
    pub success: bool,
    pub findings: String,
    pub iterations: u32,
    pub decisions: Vec<Decision>,
    pub usage: Usage,
    pub key_files: Vec<String>,
}

pub struct Investigator<'a> {
    llm: &'a dyn LLMClient,
    tools: &'a ToolRegistry,
    context: &'a mut dyn ContextManager,
    config: AgentConfig,
    events: Option<Arc<EventBus>>,
    cancel: CancellationToken,
}

impl<'a> Investigator<'a> {
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

    fn build_system_prompt(&self) -> String {
        let mut prompt = SYSTEM_PROMPT_TEMPLATE.to_string();
        for schema in self.tools.schemas() {
            prompt.push_str(&format!("- {}: {}\n", schema.name, schema.description));
        }
        prompt
    }

    pub async fn run(&mut self) -> Result<InvestigatorResult, AgentError> {
        let mut decisions: Vec<Decision> = Vec::new();
        let mut total_usage = Usage::default();

        let system_prompt = self.build_system_prompt();
        self.context
            .set_system_prompt_tokens(estimate_str_tokens(&system_prompt));
        let schemas = self.tools.schemas();

        for iteration in 0..self.config.max_iterations {
            if self.cancel.is_cancelled() {
                return Ok(InvestigatorResult {
                    success: false,
                    findings: String::new(),
                    iterations: iteration,
                    decisions,
                    usage: total_usage,
                    key_files: self.context.key_files().to_vec(),
                });
            }

            self.emit(AgentEvent::IterationStart {
                iteration,
                max_iterations: self.config.max_iterations,
                budget: self.context.budget(),
            });

            let llm_messages: Vec<LlmMessage> = self
                .context
                .get_messages_for_llm()
                .into_iter()
                .map(|(role, content)| LlmMessage {
                    role: match role {
                        MessageRole::User => Role::User,
                        MessageRole::Assistant => Role::Assistant,
                    },
                    content,
                })
                .collect();

            let options = CompletionOptions {
                tools: schemas.clone(),
                system_prompt: Some(system_prompt.clone()),
                thinking: self.config.enable_thinking.then_some(ThinkingConfig {
                    budget_tokens: self.config.thinking_budget,
                }),
            };

            let started = Instant::now();
            let response = tokio::select! {
                result = self.llm.complete(llm_messages, options) => result?,
                _ = self.cancel.cancelled() => {
                    return Ok(InvestigatorResult {
                        success: false,
                        findings: String::new(),
                        iterations: iteration,
                        decisions,
                        usage: total_usage,
                        key_files: self.context.key_files().to_vec(),
                    });
                }
            };
            let duration_ms = started.elapsed().as_millis() as u64;

            if let Some(usage) = &response.usage {
                total_usage.accumulate(usage);
            }

            if let Some(thinking) = &response.thinking {
                self.emit(AgentEvent::Thinking {
                    content: thinking.clone(),
                });
            }

            let decision = parse_decision(&response, &decisions);
            decisions.push(decision.clone());

            let tokens_used = response
                .usage
                .as_ref()
                .map(|u| u.input_tokens + u.output_tokens)
                .unwrap_or(0);

            let is_done = matches!(decision, Decision::Done { .. });
            let tool_result = self.act_on_decision(&decision, &response.content).await?;

            self.emit(AgentEvent::IterationEnd {
                iteration,
                decision: decision.clone(),
                tokens_used,
            });

            let turn = LlmTurn {
                agent: "investigator".to_string(),
                system_prompt: system_prompt.clone(),
                input_messages: self.context.message_refs(),
                tool_schemas: schemas.clone(),
                output_content: response.content.clone(),
                output_thinking: response.thinking.clone(),
                tool_calls: response.tool_calls.clone(),
                usage: response.usage.clone(),
                decision_summary: decision_summary(&decision),
                tool_result,
                duration_ms,
            };
            self.context
                .save_llm_turn("investigator", iteration, &turn)
                .await?;

            if is_done {
                let findings = match &decision {
                    Decision::Done { result } => extract_findings(result),
                    _ => unreachable!(),
                };
                return Ok(InvestigatorResult {
                    success: true,
                    findings,
                    iterations: iteration + 1,
                    decisions,
                    usage: total_usage,
                    key_files: self.context.key_files().to_vec(),
                });
            }

            if is_stuck(&decisions, self.config.stuck_threshold) {
                self.context
                    .add_message(
                        MessageRole::User,
                        STUCK_WARNING.to_string(),
                        MessageMetadata {
                            compressible: Some(false),
                            ..Default::default()
                        },
                    )
                    .await?;
                let cut = decisions.len().saturating_sub(self.config.stuck_threshold);
                decisions.truncate(cut);
            }
        }

        let findings = gather_partial_findings(self.context);
        Ok(InvestigatorResult {
            success: true,
            findings,
            iterations: self.config.max_iterations,
            decisions,
            usage: total_usage,
            key_files: self.context.key_files().to_vec(),
        })
    }

    async fn act_on_decision(
        &mut self,
        decision: &Decision,
        original_content: &str,
    ) -> Result<Option<String>, AgentError> {
        match decision {
            Decision::ToolCall { name, arguments } => {
                self.emit(AgentEvent::ToolCall {
                    name: name.clone(),
                    arguments: arguments.clone(),
                });

                let started = Instant::now();
                let (output, is_error) = if name == "recall_detail" {
                    let key = arguments.get("key").and_then(Value::as_str).unwrap_or_default();
                    let recall = self.context.recall(key).await;
                    self.emit(AgentEvent::Recall {
                        key: key.to_string(),
                        success: recall.success,
                        tokens_recalled: recall.tokens,
                    });
                    if recall.success {
                        (recall.content.unwrap_or_default(), false)
                    } else {
                        (
                            format!("recall failed: {}", recall.note.unwrap_or_default()),
                            true,
                        )
                    }
                } else {
                    match self.tools.execute(name, arguments).await {
                        Ok(s) => (s, false),
                        Err(e) => (e, true),
                    }
                };
                let duration_ms = started.elapsed().as_millis() as u64;

                self.emit(AgentEvent::ToolResult {
                    name: name.clone(),
                    result: output.clone(),
                    duration_ms,
                });

                let scrubbed = scrub_hallucinations(original_content);
                let assistant_text = if scrubbed.is_empty() {
                    format!("调用 {name} 工具")
                } else {
                    scrubbed
                };
                self.context
                    .add_message(MessageRole::Assistant, assistant_text, MessageMetadata::default())
                    .await?;

                let status_word = if is_error { "失败" } else { "成功" };
                let user_text = format!("工具 \"{name}\" 执行{status_word}:\n\n{output}");
                let source = if name == "read_file" {
                    arguments.get("path").and_then(Value::as_str).map(String::from)
                } else {
                    None
                };
                self.context
                    .add_message(
                        MessageRole::User,
                        user_text,
                        MessageMetadata {
                            tool_name: Some(name.clone()),
                            source,
                            compressible: Some(true),
                        },
                    )
                    .await?;

                self.track_key_files(name, arguments, &output);
                Ok(Some(output))
            }
            Decision::InvalidToolCall { content, .. } => {
                self.context
                    .add_message(MessageRole::Assistant, content.clone(), MessageMetadata::default())
                    .await?;
                self.context
                    .add_message(
                        MessageRole::User,
                        INVALID_TOOL_CALL_MSG.to_string(),
                        MessageMetadata::default(),
                    )
                    .await?;
                Ok(None)
            }
            Decision::Thinking { content } => {
                self.context
                    .add_message(MessageRole::Assistant, content.clone(), MessageMetadata::default())
                    .await?;
                self.context
                    .add_message(
                        MessageRole::User,
                        THINKING_PROMPT_MSG.to_string(),
                        MessageMetadata::default(),
                    )
                    .await?;
                Ok(None)
            }
            Decision::RequiresSelfCheck { content } => {
                self.context
                    .add_message(MessageRole::Assistant, content.clone(), MessageMetadata::default())
                    .await?;
                self.context
                    .add_message(
                        MessageRole::User,
                        SELF_CHECK_MSG.to_string(),
                        MessageMetadata {
                            compressible: Some(false),
                            ..Default::default()
                        },
                    )
                    .await?;
                Ok(None)
            }
            Decision::HallucinationDetected { cleaned_content, .. } => {
                if !cleaned_content.is_empty() {
                    self.context
                        .add_message(
                            MessageRole::Assistant,
                            cleaned_content.clone(),
                            MessageMetadata::default(),
                        )
                        .await?;
                }
                self.context
                    .add_message(
                        MessageRole::User,
                        HALLUCINATION_MSG.to_string(),
                        MessageMetadata {
                            compressible: Some(false),
                            ..Default::default()
                        },
                    )
                    .await?;
                Ok(None)
            }
            Decision::Done { result } => {
                self.context
                    .add_message(MessageRole::Assistant, result.clone(), MessageMetadata::default())
                    .await?;
                Ok(None)
            }
        }
    }

    /// On each `read_file` result, track the path; also scan the output for
    /// source-file-looking names, up to 10 per result (§4.5).
    fn track_key_files(&mut self, name: &str, arguments: &Value, output: &str) {
        if name == "read_file" {
            if let Some(path) = arguments.get("path").and_then(Value::as_str) {
                self.context.push_key_file(path.to_string());
            }
        }

        static SOURCE_FILE: OnceLock<Regex> = OnceLock::new();
        let re = SOURCE_FILE.get_or_init(|| {
            Regex::new(
                r"[\w./-]+\.(?:ts|js|go|py|java|rs|rb|cpp|c|h|tsx|jsx|vue|svelte)\b",
            )
            .expect("static regex")
        });

        for (count, m) in re.find_iter(output).enumerate() {
            if count >= 10 {
                break;
            }
            self.context.push_key_file(m.as_str().to_string());
        }
    }
}

fn decision_summary(decision: &Decision) -> String {
    match decision {
        Decision::ToolCall { name, .. } => format!("tool_call:{name}"),
        Decision::Done { .. } => "done".to_string(),
        Decision::Thinking { .. } => "thinking".to_string(),
        Decision::InvalidToolCall { .. } => "invalid_tool_call".to_string(),
        Decision::RequiresSelfCheck { .. } => "requires_self_check".to_string(),
        Decision::HallucinationDetected { .. } => "hallucination_detected".to_string(),
    }
}

fn extract_findings(result: &str) -> String {
    match result.find(SENTINEL) {
        Some(idx) => result[idx + SENTINEL.len()..].trim().to_string(),
        None => result.trim().to_string(),
    }
}

/// Best-effort findings when `maxIterations` is reached: concatenated
/// bullets from assistant messages, or the last assistant content if there
/// is only one.
fn gather_partial_findings(context: &dyn ContextManager) -> String {
    let assistant_msgs: Vec<String> = context
        .get_messages_for_llm()
        .into_iter()
        .filter(|(role, _)| matches!(role, MessageRole::Assistant))
        .map(|(_, content)| content)
        .collect();

    match assistant_msgs.len() {
        0 => String::new(),
        1 => assistant_msgs[0].clone(),
        _ => assistant_msgs
            .iter()
            .map(|m| format!("- {}", m.lines().next().unwrap_or(m)))
            .collect::<Vec<_>>()
            .join("\n"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::ManagedContextManager;
    use crate::config::BudgetConfig;
    use crate::storage::FileStorage;
    use crate::tools::ToolParameter;
    use crate::types::{CompletionResponse, ToolCall};
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::Mutex;
    use std::collections::VecDeque;

    struct ScriptedLlm {
        responses: Mutex<VecDeque<CompletionResponse>>,
    }

    impl ScriptedLlm {
        fn new(responses: Vec<CompletionResponse>) -> Self {
            Self {
                responses: Mutex::new(responses.into_iter().collect()),
            }
        }
    }

    #[async_trait]
    impl LLMClient for ScriptedLlm {
        async fn complete(
            &self,
            _messages: Vec<LlmMessage>,
            _options: CompletionOptions,
        ) -> Result<CompletionResponse, crate::error::LlmError> {
            Ok(self.responses.lock().unwrap().pop_front().unwrap_or(CompletionResponse {
                content: "[INVESTIGATION_COMPLETE]\n\nfallback".into(),
                ..Default::default()
            }))
        }
    }

    struct EchoHandler;

    #[async_trait]
    impl crate::tools::ToolHandler for EchoHandler {
        async fn call(&self, input: &Value) -> Result<String, String> {
            Ok(input.to_string())
        }
    }

    fn think_response() -> CompletionResponse {
        CompletionResponse {
            content: String::new(),
            tool_calls: vec![ToolCall {
                name: "think".into(),
                arguments: json!({"thought": "Self check"}),
            }],
            usage: Some(Usage { input_tokens: 10, output_tokens: 5, ..Default::default() }),
            thinking: None,
        }
    }

    fn done_response(text: &str) -> CompletionResponse {
        CompletionResponse {
            content: format!("[INVESTIGATION_COMPLETE]\n\n{text}"),
            tool_calls: vec![],
            usage: Some(Usage { input_tokens: 10, output_tokens: 5, ..Default::default() }),
            thinking: None,
        }
    }

    async fn new_context() -> ManagedContextManager {
        let dir = tempfile::tempdir().unwrap();
        let mut ctx = ManagedContextManager::new(
            Arc::new(FileStorage::new(dir.into_path())),
            BudgetConfig::default(),
        );
        ctx.init_session("Test query", "/tmp").await.unwrap();
        ctx
    }

    #[tokio::test]
    async fn s1_happy_path() {
        let llm = ScriptedLlm::new(vec![think_response(), done_response("## Findings\nDone")]);
        let tools = ToolRegistry::new().add(
            "think",
            "Record a self-check thought",
            vec![ToolParameter::new("thought", "string").required()],
            EchoHandler,
        );
        let mut ctx = new_context().await;
        let mut investigator =
            Investigator::new(&llm, &tools, &mut ctx, AgentConfig::default());

        let result = investigator.run().await.unwrap();
        assert!(result.success);
        assert!(result.findings.starts_with("## Findings"));
        assert_eq!(result.decisions.len(), 2);
        assert!(result.decisions[0].is_tool_call());
        assert!(matches!(result.decisions[1], Decision::Done { .. }));
        assert!(!result
            .decisions
            .iter()
            .any(|d| matches!(d, Decision::RequiresSelfCheck { .. })));
    }

    #[tokio::test]
    async fn s2_self_check_gate() {
        let llm = ScriptedLlm::new(vec![
            done_response("## Findings\nNo self check done"),
            think_response(),
            done_response("## Findings\nWith self check"),
        ]);
        let tools = ToolRegistry::new().add(
            "think",
            "Record a self-check thought",
            vec![ToolParameter::new("thought", "string").required()],
            EchoHandler,
        );
        let mut ctx = new_context().await;
        let mut investigator =
            Investigator::new(&llm, &tools, &mut ctx, AgentConfig::default());

        let result = investigator.run().await.unwrap();
        assert_eq!(result.decisions.len(), 3);
        assert!(matches!(result.decisions[0], Decision::RequiresSelfCheck { .. }));
        assert!(result.decisions[1].is_tool_call());
        assert!(matches!(result.decisions[2], Decision::Done { .. }));

        let messages = ctx.get_messages_for_llm();
        assert!(messages
            .iter()
            .any(|(_, c)| c.contains("必须先完成自检才能结束调查")));
    }

    #[tokio::test]
    async fn s3_stuck_loop_recovers() {
        let repeated = || CompletionResponse {
            content: String::new(),
            tool_calls: vec![ToolCall {
                name: "read_file".into(),
                arguments: json!({"path": "test.go"}),
            }],
            usage: Some(Usage::default()),
            thinking: None,
        };

        let llm = ScriptedLlm::new(vec![
            repeated(),
            repeated(),
            repeated(),
            think_response(),
            done_response("## Findings\nDone after loop"),
        ]);
        let tools = ToolRegistry::new()
            .add(
                "read_file",
                "Read a file",
                vec![ToolParameter::new("path", "string").required()],
                EchoHandler,
            )
            .add(
                "think",
                "Record a self-check thought",
                vec![ToolParameter::new("thought", "string").required()],
                EchoHandler,
            );
        let mut ctx = new_context().await;
        let mut investigator =
            Investigator::new(&llm, &tools, &mut ctx, AgentConfig::default());

        let result = investigator.run().await.unwrap();
        assert!(result.success);
        let messages = ctx.get_messages_for_llm();
        assert!(messages.iter().any(|(_, c)| c.contains("检测到循环")));
    }

    #[tokio::test]
    async fn s6_max_iterations_returns_partial_findings() {
        let responses: Vec<CompletionResponse> = (0..5)
            .map(|i| CompletionResponse {
                content: String::new(),
                tool_calls: vec![ToolCall {
                    name: "read_file".into(),
                    arguments: json!({"path": format!("file{i}.go")}),
                }],
                usage: Some(Usage::default()),
                thinking: None,
            })
            .collect();
        let llm = ScriptedLlm::new(responses);
        let tools = ToolRegistry::new().add(
            "read_file",
            "Read a file",
            vec![ToolParameter::new("path", "string").required()],
            EchoHandler,
        );
        let mut ctx = new_context().await;
        let config = AgentConfig {
            max_iterations: 5,
            ..AgentConfig::default()
        };
        let mut investigator = Investigator::new(&llm, &tools, &mut ctx, config);

        let result = investigator.run().await.unwrap();
        assert_eq!(result.iterations, 5);
        assert!(result.success);
        assert!(!result.findings.is_empty());
    }
}
