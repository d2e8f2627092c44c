//! Parser for the agent's structured stdout protocol.
//!
//! The agent emits one JSON object per line. Recognized event types are
//! translated into human-readable log lines by the launcher; unknown types
//! are suppressed, and non-JSON lines are written to the log verbatim.

use std::sync::LazyLock;

use regex::Regex;

/// Commands longer than this are truncated in log lines.
const MAX_COMMAND_LEN: usize = 100;

/// Tool names the protocol recognizes; anything else is logged with the
/// raw tool name and no detail.
const KNOWN_TOOLS: &[&str] = &["Read", "Edit", "Write", "Bash", "Glob", "Grep", "Task"];

/// A structured event parsed from one stdout line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AgentEvent {
    /// `system` with subtype `init`.
    SessionInit,
    /// Concatenated text fragments of an `assistant` message.
    AssistantText(String),
    /// A tool invocation with its most useful argument.
    ToolUse {
        tool: String,
        detail: Option<String>,
    },
    /// Terminal `result` event. `tokens` is
    /// `usage.input_tokens + usage.output_tokens` when present.
    Completed {
        success: bool,
        tokens: Option<i64>,
    },
}

/// Outcome of parsing one stdout line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParseOutcome {
    /// Valid JSON; zero or more recognized events (zero = suppressed).
    Structured(Vec<AgentEvent>),
    /// Not JSON; the caller logs the line verbatim with a timestamp.
    Raw,
}

/// Parse a single stdout line.
pub fn parse_line(line: &str) -> ParseOutcome {
    let Ok(value) = serde_json::from_str::<serde_json::Value>(line) else {
        return ParseOutcome::Raw;
    };

    let event_type = value.get("type").and_then(|t| t.as_str()).unwrap_or("");
    let mut events = Vec::new();

    match event_type {
        "system" => {
            if value.get("subtype").and_then(|s| s.as_str()) == Some("init") {
                events.push(AgentEvent::SessionInit);
            }
        }
        "assistant" => {
            if let Some(content) = value
                .get("message")
                .and_then(|m| m.get("content"))
                .and_then(|c| c.as_array())
            {
                let mut text = String::new();
                for block in content {
                    match block.get("type").and_then(|t| t.as_str()) {
                        Some("text") => {
                            if let Some(fragment) = block.get("text").and_then(|t| t.as_str()) {
                                text.push_str(fragment);
                            }
                        }
                        Some("tool_use") => {
                            if let Some(event) = tool_use_event(
                                block.get("name").and_then(|n| n.as_str()),
                                block.get("input"),
                            ) {
                                events.push(event);
                            }
                        }
                        _ => {}
                    }
                }
                if !text.is_empty() {
                    events.push(AgentEvent::AssistantText(text));
                }
            }
        }
        "tool_use" => {
            let name = value
                .get("tool_name")
                .or_else(|| value.get("name"))
                .and_then(|n| n.as_str());
            if let Some(event) = tool_use_event(name, value.get("input")) {
                events.push(event);
            }
        }
        "result" => {
            let success = value.get("subtype").and_then(|s| s.as_str()) != Some("error");
            let tokens = value.get("usage").and_then(usage_total);
            events.push(AgentEvent::Completed { success, tokens });
        }
        _ => {}
    }

    ParseOutcome::Structured(events)
}

/// Sum `input_tokens + output_tokens` from a usage object.
fn usage_total(usage: &serde_json::Value) -> Option<i64> {
    let input = usage.get("input_tokens").and_then(|v| v.as_i64());
    let output = usage.get("output_tokens").and_then(|v| v.as_i64());
    match (input, output) {
        (None, None) => None,
        (i, o) => Some(i.unwrap_or(0) + o.unwrap_or(0)),
    }
}

/// Build a [`AgentEvent::ToolUse`] from a tool name and input object.
fn tool_use_event(name: Option<&str>, input: Option<&serde_json::Value>) -> Option<AgentEvent> {
    let tool = name?.to_string();

    let detail = if KNOWN_TOOLS.contains(&tool.as_str()) {
        input.and_then(|input| {
            let key = match tool.as_str() {
                "Read" | "Edit" | "Write" => "file_path",
                "Bash" => "command",
                "Glob" | "Grep" => "pattern",
                "Task" => "description",
                _ => unreachable!(),
            };
            let raw = input.get(key)?.as_str()?;
            Some(if tool == "Bash" && raw.len() > MAX_COMMAND_LEN {
                let cut = raw
                    .char_indices()
                    .take_while(|(i, _)| *i < MAX_COMMAND_LEN)
                    .last()
                    .map(|(i, c)| i + c.len_utf8())
                    .unwrap_or(0);
                format!("{}...", &raw[..cut])
            } else {
                raw.to_string()
            })
        })
    } else {
        None
    };

    Some(AgentEvent::ToolUse { tool, detail })
}

/// Render an event as the single human-readable log line the tailer will
/// stream to subscribers.
pub fn format_event(event: &AgentEvent) -> String {
    match event {
        AgentEvent::SessionInit => "Session initialized".to_string(),
        AgentEvent::AssistantText(text) => text.clone(),
        AgentEvent::ToolUse { tool, detail } => match detail {
            Some(detail) => format!("[{tool}] {detail}"),
            None => format!("[{tool}]"),
        },
        AgentEvent::Completed { success, tokens } => {
            let status = if *success { "success" } else { "error" };
            match tokens {
                Some(tokens) => format!("=== Run Complete === ({status}, {tokens} tokens)"),
                None => format!("=== Run Complete === ({status})"),
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Legacy token extraction
// ---------------------------------------------------------------------------

static TOTAL_TOKENS_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)total tokens\D*?(\d+)").unwrap());
static TOKENS_USED_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)tokens used\D*?(\d+)").unwrap());
static TOKENS_COLON_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)tokens:\s*(\d+)").unwrap());
static INPUT_TOKENS_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)input:\s*(\d+)\s*tokens").unwrap());
static OUTPUT_TOKENS_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)output:\s*(\d+)\s*tokens").unwrap());

/// Extract a token total from free-form output, for agents that predate
/// the structured `result` event.
pub fn extract_legacy_tokens(text: &str) -> Option<i64> {
    let capture = |re: &Regex| {
        re.captures(text)
            .and_then(|c| c.get(1))
            .and_then(|m| m.as_str().parse::<i64>().ok())
    };

    if let Some(total) = capture(&TOTAL_TOKENS_RE) {
        return Some(total);
    }
    if let Some(total) = capture(&TOKENS_USED_RE) {
        return Some(total);
    }

    let input = capture(&INPUT_TOKENS_RE);
    let output = capture(&OUTPUT_TOKENS_RE);
    if input.is_some() || output.is_some() {
        return Some(input.unwrap_or(0) + output.unwrap_or(0));
    }

    capture(&TOKENS_COLON_RE)
}
