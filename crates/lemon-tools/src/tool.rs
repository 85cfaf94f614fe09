// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::Notify;

use lemon_model::Trust;

/// Cloneable cancellation signal handed to every tool execution.
///
/// Abort is level-triggered: late subscribers observe an already-aborted
/// signal immediately, so a tool that starts after the user hit abort
/// returns without doing work.
#[derive(Clone, Default)]
pub struct AbortSignal {
    inner: Arc<AbortInner>,
}

#[derive(Default)]
struct AbortInner {
    aborted: AtomicBool,
    notify: Notify,
}

impl AbortSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn abort(&self) {
        self.inner.aborted.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    pub fn is_aborted(&self) -> bool {
        self.inner.aborted.load(Ordering::SeqCst)
    }

    /// Resolve when the signal fires (immediately if it already has).
    pub async fn cancelled(&self) {
        while !self.is_aborted() {
            let notified = self.inner.notify.notified();
            if self.is_aborted() {
                return;
            }
            notified.await;
        }
    }
}

/// Which dispatch path a tool executes through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToolSource {
    /// Built-in, runs in-process.
    Local,
    /// Loaded from an extension manifest.
    Extension,
    /// Discovered from the sandbox sidecar.
    Sidecar,
}

/// The result of executing a tool.
#[derive(Debug, Clone)]
pub struct ToolResult {
    pub content: String,
    pub trust: Trust,
    pub details: serde_json::Map<String, Value>,
    /// The execution failed non-fatally; `content` explains why.
    pub is_error: bool,
}

impl ToolResult {
    pub fn ok(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            trust: Trust::Trusted,
            details: serde_json::Map::new(),
            is_error: false,
        }
    }

    pub fn err(msg: impl Into<String>) -> Self {
        Self {
            content: msg.into(),
            trust: Trust::Trusted,
            details: serde_json::Map::new(),
            is_error: true,
        }
    }

    pub fn untrusted(mut self) -> Self {
        self.trust = Trust::Untrusted;
        self
    }

    pub fn with_details(mut self, details: serde_json::Map<String, Value>) -> Self {
        self.details = details;
        self
    }

    pub fn with_detail(mut self, key: impl Into<String>, value: Value) -> Self {
        self.details.insert(key.into(), value);
        self
    }
}

/// The uniform tool shape every dispatch target exposes.
#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;
    fn description(&self) -> &str;
    /// JSON Schema for parameters.
    fn parameters(&self) -> Value;
    /// Short human-readable label for UIs; defaults to the name.
    fn label(&self) -> String {
        self.name().to_string()
    }
    fn source(&self) -> ToolSource {
        ToolSource::Local
    }
    /// Trust level of this tool's output.  Built-ins default to trusted;
    /// tools handling external content override this.
    fn trust(&self) -> Trust {
        Trust::Trusted
    }
    /// Execute the tool.  Failures are reported via [`ToolResult::err`];
    /// `signal` must be observed at every suspension point.
    async fn execute(
        &self,
        call_id: &str,
        params: Value,
        cwd: &Path,
        signal: AbortSignal,
    ) -> ToolResult;
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
