// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use futures::stream;
use serde_json::Value;

use crate::message::{ContentBlock, Message, MessageMeta, Role, StopReason, Trust};
use crate::stream::{
    EventStream, StreamContext, StreamError, StreamEvent, StreamFn, StreamOptions, ToolCallFrame,
};

type Script = Vec<Result<StreamEvent, StreamError>>;

/// A pre-scripted model stream.  Each invocation of the produced [`StreamFn`]
/// pops the next script from the front of the queue, so tests can specify
/// exact event sequences — including tool calls and overflow errors — without
/// network access.
///
/// The last context and options seen are captured so tests can inspect what
/// the actor actually sent (e.g. which API key was resolved).
pub struct ScriptedStream {
    scripts: Arc<Mutex<Vec<Script>>>,
    pub last_context: Arc<Mutex<Option<StreamContext>>>,
    pub last_options: Arc<Mutex<Option<StreamOptions>>>,
    pub calls: Arc<AtomicUsize>,
}

impl ScriptedStream {
    /// Build from an ordered list of per-call scripts.
    pub fn new(scripts: Vec<Script>) -> Self {
        Self {
            scripts: Arc::new(Mutex::new(scripts)),
            last_context: Arc::new(Mutex::new(None)),
            last_options: Arc::new(Mutex::new(None)),
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Convenience: a stream that always answers with a single text reply.
    pub fn always_text(reply: impl Into<String>) -> Self {
        Self::new(vec![Self::text_script(reply)])
    }

    /// Convenience: one tool-call round followed by a text reply.
    pub fn tool_then_text(
        call_id: impl Into<String>,
        tool: impl Into<String>,
        params: Value,
        final_text: impl Into<String>,
    ) -> Self {
        Self::new(vec![
            Self::tool_call_script(call_id, tool, params),
            Self::text_script(final_text),
        ])
    }

    /// Convenience: first call overflows, second call succeeds with text.
    /// Exercises the one-shot overflow recovery path.
    pub fn overflow_then_text(final_text: impl Into<String>) -> Self {
        Self::new(vec![
            vec![Ok(StreamEvent::Start), Err(StreamError::ContextLengthExceeded)],
            Self::text_script(final_text),
        ])
    }

    /// A complete single-text-reply script.
    pub fn text_script(reply: impl Into<String>) -> Script {
        let text = reply.into();
        let mut msg = Message::assistant(&text);
        msg.meta.stop_reason = Some(StopReason::EndTurn);
        vec![
            Ok(StreamEvent::Start),
            Ok(StreamEvent::TextStart { index: 0 }),
            Ok(StreamEvent::TextDelta { index: 0, text }),
            Ok(StreamEvent::TextEnd { index: 0 }),
            Ok(StreamEvent::MessageEnd {
                message: msg.clone(),
            }),
            Ok(StreamEvent::Done {
                stop_reason: StopReason::EndTurn,
                message: Some(msg),
            }),
        ]
    }

    /// A complete script in which the assistant requests one tool call.
    pub fn tool_call_script(
        call_id: impl Into<String>,
        tool: impl Into<String>,
        params: Value,
    ) -> Script {
        let call = ToolCallFrame {
            id: call_id.into(),
            name: tool.into(),
            params,
        };
        let msg = Message {
            role: Role::Assistant,
            content: vec![ContentBlock::ToolCall {
                id: call.id.clone(),
                name: call.name.clone(),
                params: call.params.clone(),
            }],
            call_id: None,
            trust: Trust::default(),
            meta: MessageMeta {
                stop_reason: Some(StopReason::ToolUse),
                ..MessageMeta::default()
            },
        };
        vec![
            Ok(StreamEvent::Start),
            Ok(StreamEvent::ToolCallStart {
                index: 0,
                call: call.clone(),
            }),
            Ok(StreamEvent::ToolCallEnd { index: 0, call }),
            Ok(StreamEvent::MessageEnd {
                message: msg.clone(),
            }),
            Ok(StreamEvent::Done {
                stop_reason: StopReason::ToolUse,
                message: Some(msg),
            }),
        ]
    }

    /// A script that ends with an aborted assistant message.
    pub fn aborted_script(partial: impl Into<String>) -> Script {
        let text = partial.into();
        let mut msg = Message::assistant(&text);
        msg.meta.stop_reason = Some(StopReason::Aborted);
        vec![
            Ok(StreamEvent::Start),
            Ok(StreamEvent::TextStart { index: 0 }),
            Ok(StreamEvent::TextDelta { index: 0, text }),
            Ok(StreamEvent::MessageEnd {
                message: msg.clone(),
            }),
            Ok(StreamEvent::Done {
                stop_reason: StopReason::Aborted,
                message: Some(msg),
            }),
        ]
    }

    /// Produce the [`StreamFn`] that pops scripts from this instance.
    ///
    /// When all scripts are consumed, further calls fall back to a canned
    /// text reply so the actor can always finish a turn.
    pub fn stream_fn(&self) -> StreamFn {
        let scripts = Arc::clone(&self.scripts);
        let last_context = Arc::clone(&self.last_context);
        let last_options = Arc::clone(&self.last_options);
        let calls = Arc::clone(&self.calls);
        Arc::new(move |_model, context, options| {
            let scripts = Arc::clone(&scripts);
            let last_context = Arc::clone(&last_context);
            let last_options = Arc::clone(&last_options);
            let calls = Arc::clone(&calls);
            Box::pin(async move {
                calls.fetch_add(1, Ordering::SeqCst);
                *last_context.lock().unwrap() = Some(context);
                *last_options.lock().unwrap() = Some(options);
                let script = {
                    let mut scripts = scripts.lock().unwrap();
                    if scripts.is_empty() {
                        Self::text_script("[no more scripts]")
                    } else {
                        scripts.remove(0)
                    }
                };
                let stream: EventStream = Box::pin(stream::iter(script));
                Ok(stream)
            })
        })
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
