// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use lemon_model::{Entry, EntryBody, Message, Role};

/// The session's append-only conversation log.
///
/// Entries are never mutated in place; `leaf_id` identifies the head of the
/// active branch.  Compaction swaps the whole entry list (with a fresh leaf)
/// rather than editing history.
#[derive(Debug, Default)]
pub struct ConversationManager {
    entries: Vec<Entry>,
    leaf_id: Option<String>,
}

impl ConversationManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&mut self, entry: Entry) -> &Entry {
        self.leaf_id = Some(entry.id.clone());
        self.entries.push(entry);
        self.entries.last().expect("just pushed")
    }

    pub fn append_message(&mut self, message: Message) -> &Entry {
        let entry = match message.role {
            Role::ToolResult => Entry::tool_result(message),
            _ => Entry::message(message),
        };
        self.append(entry)
    }

    pub fn entries(&self) -> &[Entry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn leaf_id(&self) -> Option<&str> {
        self.leaf_id.as_deref()
    }

    /// The message view of the active branch, in order, for the model
    /// context.  Tool-call bookkeeping entries and system events are
    /// elided — tool calls already appear as blocks inside their assistant
    /// message.
    pub fn messages(&self) -> Vec<Message> {
        self.entries
            .iter()
            .filter_map(|e| match &e.body {
                EntryBody::Message { message } | EntryBody::ToolResult { message } => {
                    Some(message.clone())
                }
                EntryBody::ToolCall { .. } | EntryBody::SystemEvent { .. } => None,
            })
            .collect()
    }

    /// Approximate context size of the active branch.
    pub fn approx_tokens(&self) -> usize {
        self.entries.iter().map(Entry::approx_tokens).sum()
    }

    /// Replace the log with a compacted entry list.  The leaf moves to the
    /// last surviving entry.
    pub fn replace_entries(&mut self, entries: Vec<Entry>) {
        self.leaf_id = entries.last().map(|e| e.id.clone());
        self.entries = entries;
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
