//! Single-shot report generation with a bounded recall loop (§4.6).

use std::sync::{Arc, OnceLock};

use regex::Regex;

use crate::context::{ContextManager, SynthesisMessage};
use crate::error::AgentError;
use crate::events::EventBus;
use crate::provider::LLMClient;
use crate::tools::ToolParameter;
use crate::types::{CompletionOptions, LlmMessage, Role, ToolSchema, Usage};
use serde_json::Value;

const SYSTEM_PROMPT: &str = "\
You are a synthesizer. Turn the investigator's raw findings into a clear, \
well-structured Markdown report answering the user's question. Start \
directly with a heading; do not restate these instructions.";

const MAX_KEY_FILES_SHOWN: usize = 20;
const DEFAULT_MAX_RECALL_ITERATIONS: u32 = 3;
const NO_RECALL_MAX_ITERATIONS: u32 = 1;

const PLACEHOLDER_REPORT: &str =
    "## 分析结果\n\n达到最大召回次数限制，无法生成完整报告。";

pub struct SynthesizerResult {
    pub report: String,
    pub usage: Usage,
}

/// `recall_detail` is the one tool the Synthesizer exposes; it's served
/// directly by `ContextManager::recall`, not through the tool registry.
fn recall_detail_schema() -> ToolSchema {
    let param = ToolParameter::new("key", "string")
        .description("The compressed message key to recall")
        .required();
    let mut properties = serde_json::Map::new();
    properties.insert(
        param.name.clone(),
        serde_json::json!({"type": param.param_type, "description": param.description}),
    );

    ToolSchema {
        name: "recall_detail".to_string(),
        description: "Retrieve the full original content behind a compressed message key"
            .to_string(),
        parameters: serde_json::json!({
            "type": "object",
            "properties": Value::Object(properties),
            "required": [param.name],
        }),
    }
}

pub struct Synthesizer<'a> {
    llm: &'a dyn LLMClient,
    context: &'a dyn ContextManager,
    events: Option<Arc<EventBus>>,
}

impl<'a> Synthesizer<'a> {
    pub fn new(llm: &'a dyn LLMClient, context: &'a dyn ContextManager) -> Self {
        Self {
            llm,
            context,
            events: None,
        }
    }

    pub fn with_events(mut self, events: Arc<EventBus>) -> Self {
        self.events = Some(events);
        self
    }

    fn emit(&self, event: crate::events::AgentEvent) {
        if let Some(bus) = &self.events {
            bus.emit(event);
        }
    }

    pub async fn run(
        &self,
        query: &str,
        key_files: &[String],
    ) -> Result<SynthesizerResult, AgentError> {
        self.emit(crate::events::AgentEvent::SynthesisStart);

        let messages = self.context.get_messages_for_synthesis();
        let has_compressed = messages.iter().any(|m| m.compressed);

        let mut conversation = build_initial_messages(query, &messages, key_files);

        let tools = if has_compressed {
            vec![recall_detail_schema()]
        } else {
            Vec::new()
        };

        let max_iterations = if has_compressed {
            DEFAULT_MAX_RECALL_ITERATIONS
        } else {
            NO_RECALL_MAX_ITERATIONS
        };

        let mut total_usage = Usage::default();

        for _ in 0..max_iterations {
            let options = CompletionOptions {
                tools: tools.clone(),
                system_prompt: Some(SYSTEM_PROMPT.to_string()),
                thinking: None,
            };

            let response = self.llm.complete(conversation.clone(), options).await?;
            if let Some(usage) = &response.usage {
                total_usage.accumulate(usage);
            }

            let Some(call) = response.tool_calls.first() else {
                let report = ensure_proper_format(&response.content);
                self.emit(crate::events::AgentEvent::SynthesisComplete {
                    tokens_used: total_usage.input_tokens + total_usage.output_tokens,
                });
                return Ok(SynthesizerResult {
                    report,
                    usage: total_usage,
                });
            };

            if call.name != "recall_detail" {
                let report = ensure_proper_format(&response.content);
                self.emit(crate::events::AgentEvent::SynthesisComplete {
                    tokens_used: total_usage.input_tokens + total_usage.output_tokens,
                });
                return Ok(SynthesizerResult {
                    report,
                    usage: total_usage,
                });
            }

            let key = call
                .arguments
                .get("key")
                .and_then(Value::as_str)
                .unwrap_or_default();
            let recall = self.context.recall(key).await;
            self.emit(crate::events::AgentEvent::Recall {
                key: key.to_string(),
                success: recall.success,
                tokens_recalled: recall.tokens,
            });

            let assistant_text = if response.content.is_empty() {
                format!("调用 recall_detail(key=\"{key}\")")
            } else {
                response.content.clone()
            };
            conversation.push(LlmMessage::assistant(assistant_text));

            let recall_text = if recall.success {
                recall.content.unwrap_or_default()
            } else {
                format!(
                    "recall failed for key \"{key}\": {}",
                    recall.note.unwrap_or_default()
                )
            };
            conversation.push(LlmMessage::user(recall_text));
        }

        self.emit(crate::events::AgentEvent::SynthesisComplete {
            tokens_used: total_usage.input_tokens + total_usage.output_tokens,
        });
        Ok(SynthesizerResult {
            report: PLACEHOLDER_REPORT.to_string(),
            usage: total_usage,
        })
    }
}

fn build_initial_messages(
    query: &str,
    messages: &[SynthesisMessage],
    key_files: &[String],
) -> Vec<LlmMessage> {
    let mut conversation = vec![LlmMessage::user(format!("用户问题: {query}"))];

    for m in messages {
        conversation.push(LlmMessage {
            role: match m.role {
                crate::context::MessageRole::User => Role::User,
                crate::context::MessageRole::Assistant => Role::Assistant,
            },
            content: m.content.clone(),
        });
    }

    let closing = if key_files.is_empty() {
        "请直接以标题开始撰写报告。".to_string()
    } else {
        let shown: Vec<&String> = key_files.iter().take(MAX_KEY_FILES_SHOWN).collect();
        let list = shown
            .iter()
            .map(|s| s.as_str())
            .collect::<Vec<_>>()
            .join(", ");
        let suffix = if key_files.len() > MAX_KEY_FILES_SHOWN {
            format!("… 等{}个文件", key_files.len())
        } else {
            String::new()
        };
        format!("涉及的关键文件: {list}{suffix}\n请直接以标题开始撰写报告。")
    };
    conversation.push(LlmMessage::user(closing));

    conversation
}

/// Post-process the final content per §4.6's `ensureProperFormat`:
/// already-headed content passes through; a later heading drops its
/// preamble; otherwise prepend the default heading.
fn ensure_proper_format(content: &str) -> String {
    if content.starts_with('#') {
        return content.to_string();
    }

    static HEADING: OnceLock<Regex> = OnceLock::new();
    let heading = HEADING.get_or_init(|| Regex::new(r"(?m)^#{1,2}\s").expect("static regex"));

    if let Some(m) = heading.find(content) {
        return content[m.start()..].to_string();
    }

    format!("## 分析结果\n\n{content}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BudgetConfig;
    use crate::context::{ManagedContextManager, MessageMetadata, MessageRole};
    use crate::error::LlmError;
    use crate::storage::FileStorage;
    use crate::types::{CompletionResponse, ToolCall};
    use async_trait::async_trait;
    use serde_json::json;
    use std::collections::VecDeque;
    use std::sync::Mutex;

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
        ) -> Result<CompletionResponse, LlmError> {
            self.responses
                .lock()
                .unwrap()
                .pop_front()
                .ok_or_else(|| LlmError::Unknown("no more scripted responses".into()))
        }
    }

    async fn new_context() -> ManagedContextManager {
        let dir = tempfile::tempdir().unwrap();
        let mut ctx = ManagedContextManager::new(
            Arc::new(FileStorage::new(dir.into_path())),
            BudgetConfig::default(),
        );
        ctx.init_session("What does this repo do?", "/tmp")
            .await
            .unwrap();
        ctx
    }

    /// A tiny window so a single large tool result crosses the 80% trigger
    /// ratio and gets compressed, exercising the recall path.
    async fn new_context_with_small_window() -> ManagedContextManager {
        let dir = tempfile::tempdir().unwrap();
        let mut ctx = ManagedContextManager::new(
            Arc::new(FileStorage::new(dir.into_path())),
            BudgetConfig {
                context_window: 1200,
                reserved_for_synthesis: 0,
                reserved_for_recalls: 0,
                reserved_for_next_steps: 0,
            },
        );
        ctx.init_session("What does this repo do?", "/tmp")
            .await
            .unwrap();
        ctx
    }

    fn plain_response(content: &str) -> CompletionResponse {
        CompletionResponse {
            content: content.to_string(),
            tool_calls: vec![],
            usage: Some(Usage {
                input_tokens: 100,
                output_tokens: 50,
                ..Default::default()
            }),
            thinking: None,
        }
    }

    #[tokio::test]
    async fn report_already_headed_passes_through() {
        let mut ctx = new_context().await;
        ctx.add_message(
            MessageRole::Assistant,
            "found the handler".into(),
            MessageMetadata::default(),
        )
        .await
        .unwrap();

        let llm = ScriptedLlm::new(vec![plain_response("# Report\n\nDone.")]);
        let synthesizer = Synthesizer::new(&llm, &ctx);
        let result = synthesizer.run("What does this repo do?", &[]).await.unwrap();
        assert_eq!(result.report, "# Report\n\nDone.");
    }

    #[tokio::test]
    async fn report_without_heading_gets_default_prefix() {
        let ctx = new_context().await;
        let llm = ScriptedLlm::new(vec![plain_response("Just some prose, no heading.")]);
        let synthesizer = Synthesizer::new(&llm, &ctx);
        let result = synthesizer.run("q", &[]).await.unwrap();
        assert!(result.report.starts_with("## 分析结果\n\n"));
    }

    #[tokio::test]
    async fn recall_loop_resolves_compressed_message() {
        let mut ctx = new_context_with_small_window().await;
        for i in 0..4 {
            ctx.add_message(
                MessageRole::User,
                format!("filler {i}"),
                MessageMetadata::default(),
            )
            .await
            .unwrap();
        }

        let big = "x".repeat(4000);
        let msg = ctx
            .add_message(
                MessageRole::User,
                big.clone(),
                MessageMetadata {
                    tool_name: Some("read_file".into()),
                    source: Some("foo.rs".into()),
                    compressible: None,
                },
            )
            .await
            .unwrap();

        for i in 0..4 {
            ctx.add_message(
                MessageRole::User,
                format!("trailer {i}"),
                MessageMetadata::default(),
            )
            .await
            .unwrap();
        }

        assert!(
            ctx.get_messages_for_synthesis()
                .iter()
                .any(|m| m.key == msg.key && m.compressed),
            "expected the large message to have been compressed by now"
        );

        let recall_call = CompletionResponse {
            content: String::new(),
            tool_calls: vec![ToolCall {
                name: "recall_detail".into(),
                arguments: json!({"key": msg.key}),
            }],
            usage: Some(Usage::default()),
            thinking: None,
        };
        let llm = ScriptedLlm::new(vec![recall_call, plain_response("# Final\n\nok")]);
        let synthesizer = Synthesizer::new(&llm, &ctx);
        let result = synthesizer.run("q", &[]).await.unwrap();
        assert_eq!(result.report, "# Final\n\nok");
    }

    #[tokio::test]
    async fn recall_exhaustion_returns_placeholder() {
        let mut ctx = new_context_with_small_window().await;
        for i in 0..4 {
            ctx.add_message(
                MessageRole::User,
                format!("filler {i}"),
                MessageMetadata::default(),
            )
            .await
            .unwrap();
        }

        let big = "x".repeat(4000);
        ctx.add_message(
            MessageRole::User,
            big,
            MessageMetadata {
                tool_name: Some("read_file".into()),
                source: Some("foo.rs".into()),
                compressible: None,
            },
        )
        .await
        .unwrap();

        for i in 0..4 {
            ctx.add_message(
                MessageRole::User,
                format!("trailer {i}"),
                MessageMetadata::default(),
            )
            .await
            .unwrap();
        }

        assert!(
            ctx.get_messages_for_synthesis().iter().any(|m| m.compressed),
            "expected at least one compressed message to enable the recall loop"
        );

        let always_recall = || CompletionResponse {
            content: String::new(),
            tool_calls: vec![ToolCall {
                name: "recall_detail".into(),
                arguments: json!({"key": "whatever"}),
            }],
            usage: Some(Usage::default()),
            thinking: None,
        };
        let llm = ScriptedLlm::new(vec![always_recall(), always_recall(), always_recall()]);
        let synthesizer = Synthesizer::new(&llm, &ctx);
        let result = synthesizer.run("q", &[]).await.unwrap();
        assert_eq!(result.report, PLACEHOLDER_REPORT);
    }

    #[test]
    fn key_files_truncated_with_suffix() {
        let files: Vec<String> = (0..25).map(|i| format!("file{i}.rs")).collect();
        let messages = Vec::new();
        let conversation = build_initial_messages("q", &messages, &files);
        let closing = conversation.last().unwrap();
        assert!(closing.content.contains("… 等25个文件"));
    }
}
