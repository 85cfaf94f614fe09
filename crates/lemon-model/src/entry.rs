// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::message::Message;
use crate::new_hex_id;

/// The payload of one conversation entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EntryBody {
    /// A user / assistant / system message.
    Message { message: Message },
    /// An assistant-requested tool invocation, recorded before execution.
    ToolCall {
        call_id: String,
        name: String,
        params: Value,
    },
    /// The result of a tool invocation (a `Role::ToolResult` message).
    ToolResult { message: Message },
    /// Out-of-band session event (compaction, recovery, extension reload).
    SystemEvent { name: String, data: Value },
}

/// One append-only entry in the conversation log.
///
/// Entries are never mutated or removed; the active branch is identified by
/// the owning conversation's leaf pointer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Entry {
    pub id: String,
    pub created_at: DateTime<Utc>,
    pub body: EntryBody,
}

impl Entry {
    pub fn new(body: EntryBody) -> Self {
        Self {
            id: new_hex_id(),
            created_at: Utc::now(),
            body,
        }
    }

    pub fn message(message: Message) -> Self {
        Self::new(EntryBody::Message { message })
    }

    pub fn tool_result(message: Message) -> Self {
        Self::new(EntryBody::ToolResult { message })
    }

    pub fn system_event(name: impl Into<String>, data: Value) -> Self {
        Self::new(EntryBody::SystemEvent {
            name: name.into(),
            data,
        })
    }

    /// Approximate token weight of this entry for overflow accounting.
    pub fn approx_tokens(&self) -> usize {
        match &self.body {
            EntryBody::Message { message } | EntryBody::ToolResult { message } => {
                message.approx_tokens()
            }
            EntryBody::ToolCall { name, params, .. } => {
                ((name.len() + params.to_string().len()) / 4).max(1)
            }
            EntryBody::SystemEvent { .. } => 1,
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn entries_get_unique_ids() {
        let a = Entry::message(Message::user("one"));
        let b = Entry::message(Message::user("two"));
        assert_ne!(a.id, b.id);
        assert_eq!(a.id.len(), 32);
    }

    #[test]
    fn system_event_round_trips() {
        let e = Entry::system_event("compaction", json!({"dropped": 12}));
        let json = serde_json::to_string(&e).unwrap();
        let back: Entry = serde_json::from_str(&json).unwrap();
        match back.body {
            EntryBody::SystemEvent { name, data } => {
                assert_eq!(name, "compaction");
                assert_eq!(data["dropped"], 12);
            }
            other => panic!("wrong variant: {other:?}"),
        }
    }

    #[test]
    fn tool_call_entry_has_nonzero_token_weight() {
        let e = Entry::new(EntryBody::ToolCall {
            call_id: "c".into(),
            name: "bash".into(),
            params: json!({"command": "echo hi"}),
        });
        assert!(e.approx_tokens() >= 1);
    }
}
