// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use lemon_model::{Message, ToolCallFrame};

/// How a subscriber wants session output delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscribeMode {
    /// Ordered per-turn events plus exactly one terminal frame per turn.
    Stream,
    /// No pushed frames; the subscriber polls state snapshots.
    Poll,
}

/// Events fanned out to stream subscribers, in the exact order the actor
/// observed them.  Every turn ends with exactly one terminal frame
/// ([`SessionEvent::AgentEnd`], [`SessionEvent::Canceled`] or
/// [`SessionEvent::Error`]); after it no further frames arrive for that turn.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    TurnStarted {
        turn_index: u64,
    },
    TextStart {
        index: u32,
    },
    TextDelta {
        index: u32,
        text: String,
    },
    TextEnd {
        index: u32,
    },
    ToolCallStart {
        index: u32,
        call: ToolCallFrame,
    },
    ToolCallEnd {
        index: u32,
        call: ToolCallFrame,
    },
    /// A tool finished; its (possibly wrapped) result text.
    ToolResult {
        call_id: String,
        content: String,
        is_error: bool,
    },
    MessageEnd {
        message: Message,
    },
    /// Terminal: the turn completed normally.
    AgentEnd {
        messages: Vec<Message>,
    },
    /// Terminal: the turn was canceled (user abort, assistant abort).
    Canceled {
        reason: String,
    },
    /// Terminal: the turn failed.
    Error {
        reason: String,
        partial_state: Option<String>,
    },
}

impl SessionEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::AgentEnd { .. } | Self::Canceled { .. } | Self::Error { .. }
        )
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
