// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::pin::Pin;
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::Stream;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::message::{Message, StopReason};

/// Which model a session is currently driving.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelRef {
    pub provider: String,
    pub id: String,
}

impl ModelRef {
    pub fn new(provider: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            provider: provider.into(),
            id: id.into(),
        }
    }
}

/// A tool definition handed to the model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolSchema {
    pub name: String,
    pub description: String,
    /// JSON Schema of the parameters object
    pub parameters: Value,
}

/// One in-flight tool call as it appears on the model stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCallFrame {
    pub id: String,
    pub name: String,
    pub params: Value,
}

/// Everything the stream function needs to drive one model call.
#[derive(Debug, Clone, Default)]
pub struct StreamContext {
    pub messages: Vec<Message>,
    pub tools: Vec<ToolSchema>,
}

/// Per-call options for the stream function.
#[derive(Debug, Clone, Default)]
pub struct StreamOptions {
    pub api_key: Option<String>,
}

/// A structured agent event delivered by the model stream, in order.
#[derive(Debug, Clone)]
pub enum StreamEvent {
    Start,
    TextStart { index: u32 },
    TextDelta { index: u32, text: String },
    TextEnd { index: u32 },
    ToolCallStart { index: u32, call: ToolCallFrame },
    ToolCallEnd { index: u32, call: ToolCallFrame },
    /// A complete message (assistant or tool-result echo) finished streaming.
    MessageEnd { message: Message },
    /// The stream is finished; no further events will arrive.
    Done {
        stop_reason: StopReason,
        message: Option<Message>,
    },
}

/// Errors surfaced by the model stream.
///
/// `ContextLengthExceeded` is the overflow signal the session actor reacts
/// to with a one-shot compaction-and-retry; everything else terminates the
/// turn with a terminal error frame.
#[derive(Debug, Clone, thiserror::Error)]
pub enum StreamError {
    #[error("context_length_exceeded")]
    ContextLengthExceeded,
    #[error("stream aborted: {0}")]
    Aborted(String),
    #[error("{0}")]
    Provider(String),
}

impl StreamError {
    /// True when this error is the model's context-window overflow signal.
    pub fn is_overflow(&self) -> bool {
        matches!(self, Self::ContextLengthExceeded)
    }
}

pub type EventStream = Pin<Box<dyn Stream<Item = Result<StreamEvent, StreamError>> + Send>>;

/// The pluggable model boundary.
///
/// The core never talks to a provider SDK directly; callers supply this
/// function and tests inject scripted versions (see [`crate::ScriptedStream`]).
pub type StreamFn = Arc<
    dyn Fn(ModelRef, StreamContext, StreamOptions) -> BoxFuture<'static, Result<EventStream, StreamError>>
        + Send
        + Sync,
>;

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overflow_detection_matches_only_context_errors() {
        assert!(StreamError::ContextLengthExceeded.is_overflow());
        assert!(!StreamError::Provider("rate limited".into()).is_overflow());
        assert!(!StreamError::Aborted("user".into()).is_overflow());
    }

    #[test]
    fn overflow_error_renders_the_wire_code() {
        let e = StreamError::ContextLengthExceeded;
        assert_eq!(e.to_string(), "context_length_exceeded");
    }

    #[test]
    fn tool_call_frame_round_trips() {
        let f = ToolCallFrame {
            id: "c1".into(),
            name: "bash".into(),
            params: serde_json::json!({"command": "true"}),
        };
        let json = serde_json::to_string(&f).unwrap();
        let back: ToolCallFrame = serde_json::from_str(&json).unwrap();
        assert_eq!(back, f);
    }
}
