// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
mod entry;
mod message;
mod mock;
mod stream;

pub use entry::{Entry, EntryBody};
pub use message::{ContentBlock, Message, MessageMeta, Role, StopReason, Trust, Usage};
pub use mock::ScriptedStream;
pub use stream::{
    EventStream, ModelRef, StreamContext, StreamError, StreamEvent, StreamFn, StreamOptions,
    ToolCallFrame, ToolSchema,
};

use uuid::Uuid;

/// Generate a 32-lowercase-hex-char identifier (UUIDv4 in simple form).
///
/// Used for session IDs, conversation entry IDs and subscription IDs.
pub fn new_hex_id() -> String {
    Uuid::new_v4().simple().to_string()
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
