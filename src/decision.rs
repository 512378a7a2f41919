//! Decision parsing and the hallucination scrubber (§4.5 layers 1–3).
//! Grounded on the small fixed-vocabulary `parse_action` pattern from
//! `react.rs` (other_examples), generalized to three ordered layers plus
//! the sentinel/self-check gate and the thinking-heuristic fallback.

use regex::Regex;
use serde_json::Value;
use std::sync::OnceLock;

use crate::types::CompletionResponse;

/// The classified intent of a single model turn (§3).
#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    ToolCall { name: String, arguments: Value },
    Done { result: String },
    Thinking { content: String },
    InvalidToolCall { content: String, detected_tool_name: Option<String> },
    RequiresSelfCheck { content: String },
    HallucinationDetected { content: String, cleaned_content: String },
}

impl Decision {
    pub fn is_tool_call(&self) -> bool {
        matches!(self, Decision::ToolCall { .. })
    }

    pub fn tool_call_name(&self) -> Option<&str> {
        match self {
            Decision::ToolCall { name, .. } => Some(name),
            _ => None,
        }
    }
}

pub const SENTINEL: &str = "[INVESTIGATION_COMPLETE]";

fn re(cell: &'static OnceLock<Regex>, pattern: &str) -> &'static Regex {
    cell.get_or_init(|| Regex::new(pattern).expect("static regex"))
}

/// Parse a model response into a `Decision`, given the decisions recorded
/// so far this run (needed for the self-check gate).
pub fn parse_decision(response: &CompletionResponse, history: &[Decision]) -> Decision {
    // Layer 1 — structured: a real tool call wins outright.
    if let Some(call) = response.tool_calls.first() {
        return Decision::ToolCall {
            name: call.name.clone(),
            arguments: call.arguments.clone(),
        };
    }

    let content = response.content.as_str();

    // Layer 2 — rescue a tool call from free text.
    if let Some((name, arguments)) = rescue_tool_call(content) {
        return Decision::ToolCall { name, arguments };
    }

    // Layer 3 — scrub fabricated tool-result text.
    if let Some(idx) = first_hallucination_index(content) {
        let cleaned = content[..idx].trim().to_string();
        return Decision::HallucinationDetected {
            content: content.to_string(),
            cleaned_content: cleaned,
        };
    }

    if content.contains(SENTINEL) {
        return if most_recent_tool_call_is_think(history) {
            Decision::Done {
                result: content.to_string(),
            }
        } else {
            Decision::RequiresSelfCheck {
                content: content.to_string(),
            }
        };
    }

    if let Some(detected) = detect_text_tool_call_phrase(content) {
        return Decision::InvalidToolCall {
            content: content.to_string(),
            detected_tool_name: Some(detected),
        };
    }

    if is_thinking_heuristic(content) {
        return Decision::Thinking {
            content: content.to_string(),
        };
    }

    // Defensive default.
    Decision::Done {
        result: content.to_string(),
    }
}

fn most_recent_tool_call_is_think(history: &[Decision]) -> bool {
    history
        .iter()
        .rev()
        .find_map(|d| match d {
            Decision::ToolCall { name, .. } => Some(name == "think"),
            _ => None,
        })
        .unwrap_or(false)
}

/// Excise any fabricated tool-result text from a response before it's
/// persisted. Identity on already-clean text; idempotent on repeated
/// application (§8 invariant 7).
pub fn scrub_hallucinations(content: &str) -> String {
    match first_hallucination_index(content) {
        Some(idx) => content[..idx].trim().to_string(),
        None => content.to_string(),
    }
}

fn first_hallucination_index(content: &str) -> Option<usize> {
    static P1: OnceLock<Regex> = OnceLock::new();
    static P2: OnceLock<Regex> = OnceLock::new();
    static P3: OnceLock<Regex> = OnceLock::new();
    static P4: OnceLock<Regex> = OnceLock::new();

    let patterns = [
        re(&P1, r"</user>"),
        re(&P2, r#"工具\s*"[^"]*"\s*执行(成功|失败)"#),
        re(&P3, r#"(?i)Tool\s*"[^"]*"\s*(executed|completed|failed)"#),
        re(&P4, r"(?m)^File:\s+\S+\nLines:\s+\d+-\d+"),
    ];

    patterns
        .iter()
        .filter_map(|r| r.find(content).map(|m| m.start()))
        .min()
}

/// Recover `(toolName, argumentsJSON)` from free text, trying three
/// patterns in order, each followed by a small JSON repair pass.
fn rescue_tool_call(content: &str) -> Option<(String, Value)> {
    static CHINESE: OnceLock<Regex> = OnceLock::new();
    static ENGLISH: OnceLock<Regex> = OnceLock::new();
    static FENCED: OnceLock<Regex> = OnceLock::new();

    let chinese = re(
        &CHINESE,
        r"(?s)我将使用\s*([A-Za-z_][A-Za-z0-9_]*)\s*工具[:：]?\s*(\{.*)",
    );
    let english = re(
        &ENGLISH,
        r"(?is)I(?:'ll| will) use (?:the )?([A-Za-z_][A-Za-z0-9_]*) tool[:]?\s*(\{.*)",
    );
    let fenced = re(
        &FENCED,
        r"(?s)([A-Za-z_][A-Za-z0-9_]*)\s*\n?```(?:json)?\s*(\{.*?)\s*```",
    );

    for pattern in [chinese, english, fenced] {
        if let Some(caps) = pattern.captures(content) {
            let name = caps.get(1)?.as_str().to_string();
            let raw_json = caps.get(2)?.as_str();
            let repaired = repair_json(raw_json);
            if let Ok(value) = serde_json::from_str::<Value>(&repaired) {
                return Some((name, value));
            }
        }
    }
    None
}

/// Smart quotes → straight, trailing commas stripped, unquoted keys
/// quoted, Chinese colon → ASCII, trailing junk after the last `}` cut.
fn repair_json(raw: &str) -> String {
    static UNQUOTED_KEY: OnceLock<Regex> = OnceLock::new();
    static TRAILING_COMMA: OnceLock<Regex> = OnceLock::new();

    let mut s = raw.to_string();

    if let Some(last) = s.rfind('}') {
        s.truncate(last + 1);
    }

    s = s
        .replace('\u{201C}', "\"")
        .replace('\u{201D}', "\"")
        .replace('\u{2018}', "'")
        .replace('\u{2019}', "'")
        .replace('：', ":");

    let unquoted_key = re(&UNQUOTED_KEY, r#"([{,]\s*)([A-Za-z_][A-Za-z0-9_]*)\s*:"#);
    s = unquoted_key.replace_all(&s, r#"$1"$2":"#).to_string();

    let trailing_comma = re(&TRAILING_COMMA, r",(\s*[}\]])");
    s = trailing_comma.replace_all(&s, "$1").to_string();

    s
}

/// Text-tool-call phrases (response claims tool use without a real call).
fn detect_text_tool_call_phrase(content: &str) -> Option<String> {
    static CHINESE: OnceLock<Regex> = OnceLock::new();
    static ENGLISH: OnceLock<Regex> = OnceLock::new();
    static CHINESE_TYPO: OnceLock<Regex> = OnceLock::new();

    let patterns = [
        re(&CHINESE, r"我将使用\s*([A-Za-z_][A-Za-z0-9_]*)\s*工具"),
        re(&ENGLISH, r"(?i)I'll use the ([A-Za-z_][A-Za-z0-9_]*) tool"),
        re(&CHINESE_TYPO, r"使用\s*([A-Za-z_][A-Za-z0-9_]*)\s*工支"),
    ];

    patterns
        .iter()
        .find_map(|r| r.captures(content))
        .and_then(|caps| caps.get(1).map(|m| m.as_str().to_string()))
}

fn is_thinking_heuristic(content: &str) -> bool {
    static ENGLISH: OnceLock<Regex> = OnceLock::new();
    static CHINESE1: OnceLock<Regex> = OnceLock::new();
    static CHINESE2: OnceLock<Regex> = OnceLock::new();
    static CHINESE3: OnceLock<Regex> = OnceLock::new();

    let patterns = [
        re(
            &ENGLISH,
            r"(?i)\blet me\b|\bI'll (check|look|search|examine|review|investigate)\b",
        ),
        re(&CHINESE1, r"需要"),
        re(&CHINESE2, r"让我"),
        re(&CHINESE3, r"我(来|需要|应该)"),
    ];
    patterns.iter().any(|r| r.is_match(content))
}

/// Stuck iff the last `threshold` decisions are all `tool_call`, share the
/// same name, and serialize identical arguments (§4.5, §8 invariant 6).
pub fn is_stuck(decisions: &[Decision], threshold: usize) -> bool {
    if threshold == 0 || decisions.len() < threshold {
        return false;
    }
    let tail = &decisions[decisions.len() - threshold..];
    let Decision::ToolCall { name: first_name, arguments: first_args } = &tail[0] else {
        return false;
    };
    let first_args_str = first_args.to_string();
    tail.iter().all(|d| match d {
        Decision::ToolCall { name, arguments } => {
            name == first_name && arguments.to_string() == first_args_str
        }
        _ => false,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ToolCall;
    use serde_json::json;

    fn response(content: &str) -> CompletionResponse {
        CompletionResponse {
            content: content.to_string(),
            tool_calls: Vec::new(),
            usage: None,
            thinking: None,
        }
    }

    #[test]
    fn structured_tool_call_wins() {
        let mut r = response("ignored");
        r.tool_calls.push(ToolCall {
            name: "read_file".into(),
            arguments: json!({"path": "a.rs"}),
        });
        let decision = parse_decision(&r, &[]);
        assert_eq!(
            decision,
            Decision::ToolCall {
                name: "read_file".into(),
                arguments: json!({"path": "a.rs"})
            }
        );
    }

    #[test]
    fn sentinel_without_prior_think_requires_self_check() {
        let r = response("[INVESTIGATION_COMPLETE]\n\n## Findings\nNo self check done");
        let decision = parse_decision(&r, &[]);
        assert!(matches!(decision, Decision::RequiresSelfCheck { .. }));
    }

    #[test]
    fn sentinel_after_think_is_done() {
        let history = vec![Decision::ToolCall {
            name: "think".into(),
            arguments: json!({"thought": "Self check"}),
        }];
        let r = response("[INVESTIGATION_COMPLETE]\n\n## Findings\nWith self check");
        let decision = parse_decision(&r, &history);
        assert!(matches!(decision, Decision::Done { .. }));
    }

    #[test]
    fn sentinel_gate_skips_non_tool_call_decisions() {
        let history = vec![
            Decision::ToolCall {
                name: "think".into(),
                arguments: json!({}),
            },
            Decision::Thinking {
                content: "let me consider".into(),
            },
        ];
        let r = response("[INVESTIGATION_COMPLETE]\n\nDone");
        let decision = parse_decision(&r, &history);
        assert!(matches!(decision, Decision::Done { .. }));
    }

    #[test]
    fn rescue_chinese_text_tool_call() {
        let r = response("我将使用 read_file 工具: {\"path\": \"a.rs\"}");
        let decision = parse_decision(&r, &[]);
        assert_eq!(
            decision,
            Decision::ToolCall {
                name: "read_file".into(),
                arguments: json!({"path": "a.rs"})
            }
        );
    }

    #[test]
    fn rescue_repairs_trailing_comma_and_smart_quotes() {
        let r = response("I'll use the ripgrep tool: {\u{201C}query\u{201D}: \u{201C}foo\u{201D},}");
        let decision = parse_decision(&r, &[]);
        assert_eq!(
            decision,
            Decision::ToolCall {
                name: "ripgrep".into(),
                arguments: json!({"query": "foo"})
            }
        );
    }

    #[test]
    fn hallucination_scrub_detects_fabricated_result() {
        let r = response(
            "我将搜索相关代码...\n\n</user>\n工具 \"ripgrep\" 执行成功:\n\nFound 5 matches in fake results...",
        );
        let decision = parse_decision(&r, &[]);
        match decision {
            Decision::HallucinationDetected { cleaned_content, .. } => {
                assert!(cleaned_content.contains("我将搜索相关代码"));
                assert!(!cleaned_content.contains("Found 5 matches in fake results"));
            }
            other => panic!("expected hallucination_detected, got {other:?}"),
        }
    }

    #[test]
    fn scrub_is_identity_on_clean_text() {
        let clean = "This is a perfectly normal response.";
        assert_eq!(scrub_hallucinations(clean), clean);
    }

    #[test]
    fn scrub_is_idempotent() {
        let dirty = "Keep this.\n\nTool \"ripgrep\" executed successfully with fake data";
        let once = scrub_hallucinations(dirty);
        let twice = scrub_hallucinations(&once);
        assert_eq!(once, twice);
    }

    #[test]
    fn text_tool_call_phrase_detected() {
        let r = response("我将使用 ripgrep 工具 to find things, but here's prose without JSON");
        let decision = parse_decision(&r, &[]);
        assert!(matches!(decision, Decision::InvalidToolCall { .. }));
    }

    #[test]
    fn thinking_heuristic_without_sentinel() {
        let r = response("Let me check the repository structure first.");
        let decision = parse_decision(&r, &[]);
        assert!(matches!(decision, Decision::Thinking { .. }));
    }

    #[test]
    fn defensive_default_is_done() {
        let r = response("Just a plain closing statement with nothing special in it.");
        let decision = parse_decision(&r, &[]);
        assert!(matches!(decision, Decision::Done { .. }));
    }

    #[test]
    fn stuck_detection_requires_identical_name_and_arguments() {
        let decisions = vec![
            Decision::ToolCall {
                name: "read_file".into(),
                arguments: json!({"path": "test.go"}),
            },
            Decision::ToolCall {
                name: "read_file".into(),
                arguments: json!({"path": "test.go"}),
            },
            Decision::ToolCall {
                name: "read_file".into(),
                arguments: json!({"path": "test.go"}),
            },
        ];
        assert!(is_stuck(&decisions, 3));
    }

    #[test]
    fn stuck_detection_rejects_differing_arguments() {
        let decisions = vec![
            Decision::ToolCall {
                name: "read_file".into(),
                arguments: json!({"path": "a.go"}),
            },
            Decision::ToolCall {
                name: "read_file".into(),
                arguments: json!({"path": "b.go"}),
            },
            Decision::ToolCall {
                name: "read_file".into(),
                arguments: json!({"path": "c.go"}),
            },
        ];
        assert!(!is_stuck(&decisions, 3));
    }
}
