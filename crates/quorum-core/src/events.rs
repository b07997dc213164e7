// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//!
//! The tagged event taxonomy over the sub-process stdout stream.
//!
//! The sub-process speaks newline-delimited JSON.  The manager recognises the
//! variants below and forwards everything else verbatim as [`ProcessEvent::Other`]
//! — subscribers that care about exotic event types read the raw value.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One streamed sub-process event.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProcessEvent {
    /// A complete assistant message (content blocks included).
    Assistant {
        #[serde(default)]
        message: AssistantMessage,
    },
    ContentBlockStart {
        #[serde(default)]
        content_block: ContentBlock,
    },
    ContentBlockDelta {
        #[serde(default)]
        delta: Delta,
    },
    ContentBlockStop,
    /// Human-readable progress line from a running tool.
    ToolStatus {
        #[serde(default)]
        message: String,
    },
    ToolUse {
        name: String,
        #[serde(default)]
        input: Value,
    },
    /// End of one logical turn, with cost accounting.
    Result {
        #[serde(default)]
        cost_usd: f64,
        #[serde(default = "one")]
        num_turns: u32,
        #[serde(default)]
        extra_credits: f64,
        #[serde(default)]
        result: Option<String>,
    },
    /// The sub-process wants a tool call approved by the owner.
    ApprovalRequest {
        short_id: String,
        tool: String,
        #[serde(default)]
        input: Value,
        #[serde(default)]
        timeout_ms: Option<u64>,
    },
    /// Terminal event.  Synthesised by the manager on timeout/kill when the
    /// sub-process did not produce one itself.
    SessionExited {
        #[serde(default)]
        code: Option<i32>,
    },
    Error {
        #[serde(default)]
        message: String,
    },
    /// Unrecognised event, forwarded verbatim.
    #[serde(untagged)]
    Other(Value),
}

fn one() -> u32 {
    1
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AssistantMessage {
    #[serde(default)]
    pub content: Vec<ContentPart>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    Text {
        text: String,
    },
    ToolUse {
        name: String,
        #[serde(default)]
        input: Value,
    },
    #[serde(untagged)]
    Other(Value),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ContentBlock {
    #[serde(default, rename = "type")]
    pub block_type: String,
    #[serde(default)]
    pub name: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Delta {
    #[serde(default, rename = "type")]
    pub delta_type: String,
    #[serde(default)]
    pub text: String,
}

impl ProcessEvent {
    /// Parse one stdout line.  Returns `None` only for non-JSON garbage.
    pub fn parse(line: &str) -> Option<Self> {
        let line = line.trim();
        if line.is_empty() {
            return None;
        }
        serde_json::from_str(line).ok()
    }

    /// True for events that re-arm the inactivity timer.
    pub fn is_activity(&self) -> bool {
        matches!(
            self,
            Self::Assistant { .. }
                | Self::ContentBlockStart { .. }
                | Self::ContentBlockDelta { .. }
                | Self::ContentBlockStop
                | Self::ToolStatus { .. }
                | Self::Result { .. }
        )
    }

    /// Concatenated text of an assistant message, `None` for other variants
    /// or when the message holds no text parts.
    pub fn assistant_text(&self) -> Option<String> {
        let Self::Assistant { message } = self else {
            return None;
        };
        let mut out = String::new();
        for part in &message.content {
            if let ContentPart::Text { text } = part {
                if !out.is_empty() {
                    out.push('\n');
                }
                out.push_str(text);
            }
        }
        if out.is_empty() {
            None
        } else {
            Some(out)
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_assistant_event() {
        let ev = ProcessEvent::parse(
            r#"{"type":"assistant","message":{"content":[{"type":"text","text":"hi"}]}}"#,
        )
        .unwrap();
        assert_eq!(ev.assistant_text().as_deref(), Some("hi"));
        assert!(ev.is_activity());
    }

    #[test]
    fn parses_result_with_defaults() {
        let ev = ProcessEvent::parse(r#"{"type":"result","cost_usd":0.5}"#).unwrap();
        match ev {
            ProcessEvent::Result {
                cost_usd,
                num_turns,
                ..
            } => {
                assert_eq!(cost_usd, 0.5);
                assert_eq!(num_turns, 1);
            }
            other => panic!("expected Result, got {other:?}"),
        }
    }

    #[test]
    fn unknown_type_falls_through_verbatim() {
        let ev = ProcessEvent::parse(r#"{"type":"telemetry","x":1}"#).unwrap();
        match ev {
            ProcessEvent::Other(v) => assert_eq!(v["x"], 1),
            other => panic!("expected Other, got {other:?}"),
        }
        // Unknown events never count as activity.
        let ev = ProcessEvent::parse(r#"{"type":"telemetry"}"#).unwrap();
        assert!(!ev.is_activity());
    }

    #[test]
    fn garbage_line_is_none() {
        assert!(ProcessEvent::parse("not json").is_none());
        assert!(ProcessEvent::parse("").is_none());
    }

    #[test]
    fn approval_request_fields() {
        let ev = ProcessEvent::parse(
            r#"{"type":"approval_request","short_id":"ab12","tool":"shell","input":{"cmd":"ls"}}"#,
        )
        .unwrap();
        match ev {
            ProcessEvent::ApprovalRequest { short_id, tool, .. } => {
                assert_eq!(short_id, "ab12");
                assert_eq!(tool, "shell");
            }
            other => panic!("expected ApprovalRequest, got {other:?}"),
        }
    }

    #[test]
    fn assistant_text_joins_parts_and_skips_tools() {
        let ev = ProcessEvent::parse(
            r#"{"type":"assistant","message":{"content":[
                {"type":"text","text":"a"},
                {"type":"tool_use","name":"shell","input":{}},
                {"type":"text","text":"b"}]}}"#,
        )
        .unwrap();
        assert_eq!(ev.assistant_text().as_deref(), Some("a\nb"));
    }

    #[test]
    fn serialises_back_to_tagged_form() {
        let ev = ProcessEvent::SessionExited { code: Some(1) };
        let json = serde_json::to_value(&ev).unwrap();
        assert_eq!(json["type"], "session_exited");
        assert_eq!(json["code"], 1);
    }
}
