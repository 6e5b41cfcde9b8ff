//! Event unions for the run pipeline.
//!
//! [`AgentEvent`] is the raw stream produced by an engine while it works a
//! turn. [`RunEvent`] is the smaller normalized surface a run process emits
//! to clients; its serialized form is the wire frame channels and control
//! clients consume.

use serde::{Deserialize, Serialize};
use serde_json::Value;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Resume token
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Engine-private checkpoint used to continue a session without replaying
/// full history. Opaque to the gateway; persisted per session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResumeToken {
    pub engine: String,
    pub value: String,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Usage
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Token usage for a completion. Cache fields count toward the effective
/// input size when estimating context pressure.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    #[serde(default)]
    pub input_tokens: u64,
    #[serde(default)]
    pub output_tokens: u64,
    #[serde(default)]
    pub cache_read_tokens: u64,
    #[serde(default)]
    pub cache_creation_tokens: u64,
}

impl Usage {
    /// Input-side tokens including cached and cache-creation reads.
    pub fn effective_input_tokens(&self) -> u64 {
        self.input_tokens + self.cache_read_tokens + self.cache_creation_tokens
    }

    pub fn add(&mut self, other: &Usage) {
        self.input_tokens += other.input_tokens;
        self.output_tokens += other.output_tokens;
        self.cache_read_tokens += other.cache_read_tokens;
        self.cache_creation_tokens += other.cache_creation_tokens;
    }

    pub fn is_empty(&self) -> bool {
        *self == Usage::default()
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Engine events
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Raw events produced by an engine over one agent turn.
///
/// The stream is finite: zero or more working events followed by exactly
/// one terminal (`Completed`, `Error` or `Canceled`). `Completed` is
/// synthesized by the engine runner when the engine finishes.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentEvent {
    AgentStart,
    TurnStart,
    MessageStart {
        msg: Value,
    },
    MessageUpdate {
        msg: Value,
        /// Text delta. Non-string deltas are ignored by the translator.
        delta: Value,
    },
    MessageEnd {
        msg: Value,
    },
    ToolExecutionStart {
        id: String,
        name: String,
        args: Value,
    },
    ToolExecutionUpdate {
        id: String,
        name: String,
        args: Value,
        partial: Value,
    },
    ToolExecutionEnd {
        id: String,
        name: String,
        result: Value,
        is_error: bool,
    },
    TurnEnd {
        msg: Value,
        tool_results: Vec<Value>,
    },
    /// Messages created THIS run, not history.
    AgentEnd {
        new_messages: Vec<Value>,
    },
    Completed {
        ok: bool,
        #[serde(default)]
        answer: Option<String>,
        #[serde(default)]
        resume: Option<ResumeToken>,
        #[serde(default)]
        usage: Option<Usage>,
        #[serde(default)]
        error: Option<String>,
    },
    Error {
        reason: String,
        #[serde(default)]
        partial_state: Option<Value>,
    },
    Canceled {
        reason: String,
    },
}

impl AgentEvent {
    /// Terminal events end the stream; any later push is rejected.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            AgentEvent::Completed { .. } | AgentEvent::Error { .. } | AgentEvent::Canceled { .. }
        )
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Normalized run events
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Action categories surfaced to clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    Command,
    FileChange,
    Tool,
    WebSearch,
    Subagent,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionPhase {
    Started,
    Updated,
    Completed,
}

/// Normalized events emitted by a run process.
///
/// Serializes to the client wire frames:
/// `{"type":"started",...}`, `{"type":"action",...}`, `{"type":"delta",...}`,
/// `{"type":"completed",...}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RunEvent {
    Started {
        #[serde(skip_serializing_if = "Option::is_none")]
        resume: Option<ResumeToken>,
    },
    Action {
        id: String,
        kind: ActionKind,
        title: String,
        phase: ActionPhase,
        #[serde(skip_serializing_if = "Option::is_none")]
        ok: Option<bool>,
        detail: Value,
    },
    Delta {
        seq: u64,
        ts_ms: i64,
        text: String,
    },
    Completed {
        ok: bool,
        /// Final answer on success; partial accumulated text on failure.
        answer: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        usage: Option<Usage>,
        #[serde(skip_serializing_if = "Option::is_none")]
        resume: Option<ResumeToken>,
    },
}

impl RunEvent {
    pub fn is_completed(&self) -> bool {
        matches!(self, RunEvent::Completed { .. })
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Message helpers
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Extract the text of the last assistant message in a batch.
///
/// Messages are engine-shaped JSON: `{"role": "...", "content": <text or
/// block list>, "usage": {...}?}`. Returns `None` when no assistant message
/// with non-empty text exists.
pub fn extract_last_assistant_text(messages: &[Value]) -> Option<String> {
    for msg in messages.iter().rev() {
        if msg.get("role").and_then(Value::as_str) != Some("assistant") {
            continue;
        }
        if let Some(content) = msg.get("content") {
            let text = flatten_blocks(content);
            if !text.trim().is_empty() {
                return Some(text);
            }
        }
    }
    None
}

/// Sum the `usage` objects attached to a message batch. Returns `None`
/// when no message carries usage.
pub fn sum_usage(messages: &[Value]) -> Option<Usage> {
    let mut total = Usage::default();
    let mut seen = false;
    for msg in messages {
        if let Some(u) = msg.get("usage") {
            if let Ok(u) = serde_json::from_value::<Usage>(u.clone()) {
                total.add(&u);
                seen = true;
            }
        }
    }
    seen.then_some(total)
}

/// Flatten a structured content value (plain string, text/image blocks, or
/// a list of blocks) into display text joined by newlines.
pub fn flatten_blocks(content: &Value) -> String {
    match content {
        Value::String(s) => s.clone(),
        Value::Array(blocks) => {
            let parts: Vec<String> = blocks
                .iter()
                .map(flatten_blocks)
                .filter(|s| !s.is_empty())
                .collect();
            parts.join("\n")
        }
        Value::Object(obj) => {
            if let Some(text) = obj.get("text").and_then(Value::as_str) {
                text.to_string()
            } else if obj.get("type").and_then(Value::as_str) == Some("image") {
                "[image]".to_string()
            } else if let Some(inner) = obj.get("content") {
                flatten_blocks(inner)
            } else {
                String::new()
            }
        }
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn terminal_detection() {
        assert!(AgentEvent::Canceled { reason: "x".into() }.is_terminal());
        assert!(AgentEvent::Error {
            reason: "x".into(),
            partial_state: None
        }
        .is_terminal());
        assert!(!AgentEvent::AgentStart.is_terminal());
        assert!(!AgentEvent::AgentEnd {
            new_messages: vec![]
        }
        .is_terminal());
    }

    #[test]
    fn usage_effective_input() {
        let u = Usage {
            input_tokens: 100,
            output_tokens: 5,
            cache_read_tokens: 30,
            cache_creation_tokens: 20,
        };
        assert_eq!(u.effective_input_tokens(), 150);
    }

    #[test]
    fn usage_sum_over_messages() {
        let msgs = vec![
            json!({"role": "assistant", "content": "a", "usage": {"input_tokens": 10, "output_tokens": 2}}),
            json!({"role": "assistant", "content": "b", "usage": {"input_tokens": 5, "output_tokens": 1}}),
            json!({"role": "user", "content": "c"}),
        ];
        let total = sum_usage(&msgs).unwrap();
        assert_eq!(total.input_tokens, 15);
        assert_eq!(total.output_tokens, 3);
    }

    #[test]
    fn usage_sum_none_when_absent() {
        let msgs = vec![json!({"role": "assistant", "content": "a"})];
        assert!(sum_usage(&msgs).is_none());
    }

    #[test]
    fn last_assistant_text_plain() {
        let msgs = vec![
            json!({"role": "user", "content": "hi"}),
            json!({"role": "assistant", "content": "first"}),
            json!({"role": "assistant", "content": "second"}),
        ];
        assert_eq!(extract_last_assistant_text(&msgs).as_deref(), Some("second"));
    }

    #[test]
    fn last_assistant_text_blocks() {
        let msgs = vec![json!({
            "role": "assistant",
            "content": [
                {"type": "text", "text": "part one"},
                {"type": "text", "text": "part two"}
            ]
        })];
        assert_eq!(
            extract_last_assistant_text(&msgs).as_deref(),
            Some("part one\npart two")
        );
    }

    #[test]
    fn last_assistant_skips_empty() {
        let msgs = vec![
            json!({"role": "assistant", "content": "answer"}),
            json!({"role": "assistant", "content": "  "}),
        ];
        assert_eq!(extract_last_assistant_text(&msgs).as_deref(), Some("answer"));
    }

    #[test]
    fn last_assistant_none_for_empty_batch() {
        assert!(extract_last_assistant_text(&[]).is_none());
        let msgs = vec![json!({"role": "user", "content": "hi"})];
        assert!(extract_last_assistant_text(&msgs).is_none());
    }

    #[test]
    fn flatten_image_block() {
        let v = json!([{"type": "image", "source": "..."}, {"type": "text", "text": "caption"}]);
        assert_eq!(flatten_blocks(&v), "[image]\ncaption");
    }

    #[test]
    fn run_event_wire_shape() {
        let ev = RunEvent::Delta {
            seq: 1,
            ts_ms: 123,
            text: "hi".into(),
        };
        let v = serde_json::to_value(&ev).unwrap();
        assert_eq!(v["type"], "delta");
        assert_eq!(v["seq"], 1);
        assert_eq!(v["text"], "hi");
    }

    #[test]
    fn completed_frame_omits_empty_options() {
        let ev = RunEvent::Completed {
            ok: true,
            answer: "done".into(),
            error: None,
            usage: None,
            resume: None,
        };
        let v = serde_json::to_value(&ev).unwrap();
        assert_eq!(v["type"], "completed");
        assert!(v.get("error").is_none());
        assert!(v.get("resume").is_none());
    }

    #[test]
    fn agent_event_round_trips() {
        let ev = AgentEvent::ToolExecutionEnd {
            id: "t1".into(),
            name: "Bash".into(),
            result: json!({"text": "ok"}),
            is_error: false,
        };
        let s = serde_json::to_string(&ev).unwrap();
        let back: AgentEvent = serde_json::from_str(&s).unwrap();
        match back {
            AgentEvent::ToolExecutionEnd { id, is_error, .. } => {
                assert_eq!(id, "t1");
                assert!(!is_error);
            }
            other => panic!("unexpected: {other:?}"),
        }
    }
}
