// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Who produced a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Assistant,
    ToolResult,
    System,
}

/// Whether a message's content may be re-shown to the model verbatim.
///
/// `Untrusted` tool results must pass through the sentinel-wrapping boundary
/// before being appended to the conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Trust {
    #[default]
    Trusted,
    Untrusted,
}

/// A single ordered content block inside a message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text { text: String },
    ToolCall { id: String, name: String, params: Value },
    Image { image_url: String },
}

impl ContentBlock {
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text { text: text.into() }
    }
}

/// Why the model stopped emitting output for a turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    EndTurn,
    ToolUse,
    MaxTokens,
    Aborted,
    Error,
}

/// Token usage from one model response.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Usage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub total_tokens: u64,
    pub cost: f64,
}

impl Usage {
    /// Accumulate another usage report into this one.
    pub fn add(&mut self, other: &Usage) {
        self.input_tokens += other.input_tokens;
        self.output_tokens += other.output_tokens;
        self.total_tokens += other.total_tokens;
        self.cost += other.cost;
    }
}

/// Metadata attached to a message: usage, stop reason, timestamp, and
/// arbitrary per-message details (tool-result details, trust annotations).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageMeta {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop_reason: Option<StopReason>,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub details: serde_json::Map<String, Value>,
}

impl Default for MessageMeta {
    fn default() -> Self {
        Self {
            usage: None,
            stop_reason: None,
            timestamp: Utc::now(),
            details: serde_json::Map::new(),
        }
    }
}

/// A single message in the conversation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: Vec<ContentBlock>,
    /// Present only on tool-result messages: the call this result answers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub call_id: Option<String>,
    #[serde(default)]
    pub trust: Trust,
    #[serde(default)]
    pub meta: MessageMeta,
}

impl Message {
    pub fn system(text: impl Into<String>) -> Self {
        Self::plain(Role::System, text)
    }

    pub fn user(text: impl Into<String>) -> Self {
        Self::plain(Role::User, text)
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self::plain(Role::Assistant, text)
    }

    fn plain(role: Role, text: impl Into<String>) -> Self {
        Self {
            role,
            content: vec![ContentBlock::text(text)],
            call_id: None,
            trust: Trust::default(),
            meta: MessageMeta::default(),
        }
    }

    /// Construct a tool-result message answering `call_id`.
    pub fn tool_result(
        call_id: impl Into<String>,
        content: impl Into<String>,
        trust: Trust,
    ) -> Self {
        Self {
            role: Role::ToolResult,
            content: vec![ContentBlock::text(content)],
            call_id: Some(call_id.into()),
            trust,
            meta: MessageMeta::default(),
        }
    }

    /// Attach structured details (e.g. exit codes, byte counts) to this message.
    pub fn with_details(mut self, details: serde_json::Map<String, Value>) -> Self {
        self.meta.details = details;
        self
    }

    /// Concatenated text of all `Text` blocks.
    pub fn text(&self) -> String {
        self.content
            .iter()
            .filter_map(|b| match b {
                ContentBlock::Text { text } => Some(text.as_str()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// All tool-call blocks carried by this message, in order.
    pub fn tool_calls(&self) -> Vec<(&str, &str, &Value)> {
        self.content
            .iter()
            .filter_map(|b| match b {
                ContentBlock::ToolCall { id, name, params } => {
                    Some((id.as_str(), name.as_str(), params))
                }
                _ => None,
            })
            .collect()
    }

    /// Approximate token count used for context-window management.
    /// 4-chars-per-token heuristic; images use a flat conservative estimate.
    pub fn approx_tokens(&self) -> usize {
        let chars: usize = self
            .content
            .iter()
            .map(|b| match b {
                ContentBlock::Text { text } => text.len(),
                ContentBlock::ToolCall { name, params, .. } => {
                    name.len() + params.to_string().len()
                }
                ContentBlock::Image { .. } => 765 * 4,
            })
            .sum();
        (chars / 4).max(1)
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    // ── Construction ─────────────────────────────────────────────────────────

    #[test]
    fn user_message_sets_role_and_text() {
        let m = Message::user("hello");
        assert_eq!(m.role, Role::User);
        assert_eq!(m.text(), "hello");
        assert_eq!(m.trust, Trust::Trusted);
    }

    #[test]
    fn tool_result_carries_call_id_and_trust() {
        let m = Message::tool_result("call-1", "output", Trust::Untrusted);
        assert_eq!(m.role, Role::ToolResult);
        assert_eq!(m.call_id.as_deref(), Some("call-1"));
        assert_eq!(m.trust, Trust::Untrusted);
    }

    #[test]
    fn tool_calls_extracts_blocks_in_order() {
        let m = Message {
            role: Role::Assistant,
            content: vec![
                ContentBlock::text("let me check"),
                ContentBlock::ToolCall {
                    id: "a".into(),
                    name: "bash".into(),
                    params: json!({"command": "ls"}),
                },
                ContentBlock::ToolCall {
                    id: "b".into(),
                    name: "web_fetch".into(),
                    params: json!({"url": "https://example.com"}),
                },
            ],
            call_id: None,
            trust: Trust::default(),
            meta: MessageMeta::default(),
        };
        let calls = m.tool_calls();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].1, "bash");
        assert_eq!(calls[1].0, "b");
    }

    // ── Token approximation ───────────────────────────────────────────────────

    #[test]
    fn approx_tokens_text_divides_by_four() {
        let m = Message::user("12345678");
        assert_eq!(m.approx_tokens(), 2);
    }

    #[test]
    fn approx_tokens_minimum_is_one() {
        let m = Message::user("hi");
        assert_eq!(m.approx_tokens(), 1);
    }

    // ── Usage accumulation ────────────────────────────────────────────────────

    #[test]
    fn usage_add_accumulates_all_fields() {
        let mut a = Usage {
            input_tokens: 10,
            output_tokens: 5,
            total_tokens: 15,
            cost: 0.25,
        };
        a.add(&Usage {
            input_tokens: 1,
            output_tokens: 2,
            total_tokens: 3,
            cost: 0.75,
        });
        assert_eq!(a.total_tokens, 18);
        assert!((a.cost - 1.0).abs() < f64::EPSILON);
    }

    // ── Serialisation ─────────────────────────────────────────────────────────

    #[test]
    fn message_round_trips_through_json() {
        let m = Message::tool_result("c1", "payload", Trust::Untrusted);
        let json = serde_json::to_string(&m).unwrap();
        let back: Message = serde_json::from_str(&json).unwrap();
        assert_eq!(back.role, Role::ToolResult);
        assert_eq!(back.trust, Trust::Untrusted);
        assert_eq!(back.text(), "payload");
    }

    #[test]
    fn roles_serialize_snake_case() {
        let json = serde_json::to_string(&Role::ToolResult).unwrap();
        assert_eq!(json, "\"tool_result\"");
    }
}
