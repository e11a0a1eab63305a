//! Events from agent CLIs' stream-json output format.
//!
//! One JSON object per stdout line. Lines that fail to parse are treated as
//! plain text chunks; the raw frame is preserved either way for replay.

use serde::Deserialize;
use serde_json::Value;

use crate::model::AgentEventKind;

/// A parsed stream-json frame.
#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
pub enum StreamFrame {
    #[serde(rename = "assistant")]
    Assistant {
        message: AssistantMessage,
        #[serde(default)]
        session_id: String,
    },

    #[serde(rename = "user")]
    User {
        #[serde(default)]
        tool_use_result: Option<Value>,
    },

    #[serde(rename = "result")]
    Result {
        subtype: String,
        #[serde(default)]
        result: Option<String>,
        #[serde(default)]
        is_error: bool,
        #[serde(default)]
        usage: Option<Usage>,
    },

    #[serde(rename = "system")]
    System { subtype: String },
}

#[derive(Debug, Deserialize)]
pub struct AssistantMessage {
    #[serde(default)]
    pub content: Vec<ContentBlock>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
pub enum ContentBlock {
    #[serde(rename = "tool_use")]
    ToolUse {
        name: String,
        input: Value,
        #[serde(default)]
        id: String,
    },

    #[serde(rename = "text")]
    Text { text: String },

    #[serde(rename = "thinking")]
    Thinking {
        #[serde(default)]
        thinking: String,
    },
}

/// Token usage reported in the final result frame.
#[derive(Debug, Clone, Copy, Default, Deserialize)]
pub struct Usage {
    #[serde(default)]
    pub input_tokens: u64,
    #[serde(default)]
    pub output_tokens: u64,
}

/// One observation extracted from a stdout line, before workflow context is
/// attached.
#[derive(Debug, Clone)]
pub struct Observation {
    pub kind: AgentEventKind,
    pub payload: Value,
}

/// Outcome of parsing a single stdout line.
#[derive(Debug, Default)]
pub struct ParsedLine {
    pub observations: Vec<Observation>,
    /// Text accumulated toward the final output.
    pub text: Option<String>,
    /// Set when this line carried the result frame.
    pub result: Option<LineResult>,
    /// The raw frame when the line was valid JSON.
    pub raw_frame: Option<Value>,
}

/// Terminal result extracted from a `result` frame.
#[derive(Debug, Clone)]
pub struct LineResult {
    pub text: Option<String>,
    pub is_error: bool,
    pub usage: Usage,
}

/// Parse one stdout line into observations and output text.
pub fn parse_line(line: &str) -> ParsedLine {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return ParsedLine::default();
    }

    let raw: Option<Value> = if trimmed.starts_with('{') {
        serde_json::from_str(trimmed).ok()
    } else {
        None
    };

    let Some(raw_value) = raw else {
        // Not JSON: a plain text chunk.
        return ParsedLine {
            observations: vec![Observation {
                kind: AgentEventKind::Chunk,
                payload: serde_json::json!({ "text": trimmed }),
            }],
            text: Some(trimmed.to_string()),
            result: None,
            raw_frame: None,
        };
    };

    let mut parsed = ParsedLine {
        raw_frame: Some(raw_value.clone()),
        ..Default::default()
    };

    match serde_json::from_value::<StreamFrame>(raw_value) {
        Ok(StreamFrame::Assistant { message, .. }) => {
            let mut text_parts = Vec::new();
            for block in message.content {
                match block {
                    ContentBlock::ToolUse { name, input, .. } => {
                        parsed.observations.push(Observation {
                            kind: AgentEventKind::ToolUse,
                            payload: serde_json::json!({ "tool": name, "input": input }),
                        });
                    }
                    ContentBlock::Text { text } => {
                        parsed.observations.push(Observation {
                            kind: AgentEventKind::Chunk,
                            payload: serde_json::json!({ "text": text }),
                        });
                        text_parts.push(text);
                    }
                    ContentBlock::Thinking { thinking } => {
                        parsed.observations.push(Observation {
                            kind: AgentEventKind::Thinking,
                            payload: serde_json::json!({ "text": thinking }),
                        });
                    }
                }
            }
            if !text_parts.is_empty() {
                parsed.text = Some(text_parts.join("\n"));
            }
        }
        Ok(StreamFrame::Result {
            result,
            is_error,
            usage,
            ..
        }) => {
            parsed.observations.push(Observation {
                kind: if is_error {
                    AgentEventKind::Error
                } else {
                    AgentEventKind::Completed
                },
                payload: serde_json::json!({ "text": result }),
            });
            parsed.result = Some(LineResult {
                text: result,
                is_error,
                usage: usage.unwrap_or_default(),
            });
        }
        Ok(StreamFrame::User { .. }) | Ok(StreamFrame::System { .. }) => {
            parsed.observations.push(Observation {
                kind: AgentEventKind::Progress,
                payload: parsed.raw_frame.clone().unwrap_or(Value::Null),
            });
        }
        Err(_) => {
            // Valid JSON but not a known frame; keep it as a chunk.
            parsed.observations.push(Observation {
                kind: AgentEventKind::Chunk,
                payload: serde_json::json!({ "text": trimmed }),
            });
            parsed.text = Some(trimmed.to_string());
        }
    }

    parsed
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_assistant_text_block() {
        let line = r#"{"type":"assistant","message":{"content":[{"type":"text","text":"Hello world"}]},"session_id":"abc"}"#;
        let parsed = parse_line(line);
        assert_eq!(parsed.text.as_deref(), Some("Hello world"));
        assert_eq!(parsed.observations.len(), 1);
        assert_eq!(parsed.observations[0].kind, AgentEventKind::Chunk);
        assert!(parsed.raw_frame.is_some());
    }

    #[test]
    fn parses_tool_use_block() {
        let line = r#"{"type":"assistant","message":{"content":[{"type":"tool_use","name":"Edit","input":{"file_path":"src/main.rs"},"id":"1"}]}}"#;
        let parsed = parse_line(line);
        assert_eq!(parsed.observations[0].kind, AgentEventKind::ToolUse);
        assert_eq!(parsed.observations[0].payload["tool"], "Edit");
    }

    #[test]
    fn parses_thinking_block() {
        let line = r#"{"type":"assistant","message":{"content":[{"type":"thinking","thinking":"Let me check..."}]}}"#;
        let parsed = parse_line(line);
        assert_eq!(parsed.observations[0].kind, AgentEventKind::Thinking);
    }

    #[test]
    fn parses_result_frame_with_usage() {
        let line = r#"{"type":"result","subtype":"success","result":"All done","is_error":false,"usage":{"input_tokens":120,"output_tokens":45}}"#;
        let parsed = parse_line(line);
        let result = parsed.result.unwrap();
        assert_eq!(result.text.as_deref(), Some("All done"));
        assert!(!result.is_error);
        assert_eq!(result.usage.input_tokens, 120);
        assert_eq!(result.usage.output_tokens, 45);
        assert_eq!(parsed.observations[0].kind, AgentEventKind::Completed);
    }

    #[test]
    fn error_result_maps_to_error_observation() {
        let line = r#"{"type":"result","subtype":"error","result":"boom","is_error":true}"#;
        let parsed = parse_line(line);
        assert_eq!(parsed.observations[0].kind, AgentEventKind::Error);
        assert!(parsed.result.unwrap().is_error);
    }

    #[test]
    fn plain_text_becomes_chunk() {
        let parsed = parse_line("Analyzing the codebase structure...");
        assert_eq!(parsed.observations[0].kind, AgentEventKind::Chunk);
        assert_eq!(parsed.text.as_deref(), Some("Analyzing the codebase structure..."));
        assert!(parsed.raw_frame.is_none());
    }

    #[test]
    fn unknown_json_is_kept_as_chunk() {
        let parsed = parse_line(r#"{"kind":"mystery","data":42}"#);
        assert_eq!(parsed.observations[0].kind, AgentEventKind::Chunk);
        assert!(parsed.raw_frame.is_some());
    }

    #[test]
    fn empty_line_produces_nothing() {
        let parsed = parse_line("   ");
        assert!(parsed.observations.is_empty());
        assert!(parsed.text.is_none());
    }

    #[test]
    fn system_frame_is_progress() {
        let parsed = parse_line(r#"{"type":"system","subtype":"init"}"#);
        assert_eq!(parsed.observations[0].kind, AgentEventKind::Progress);
    }
}
