// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! Pre-compaction hook registry.
//!
//! Hooks are data: `(priority, timeout, function)` tuples carried per
//! session and executed in (priority desc, insertion order) right before a
//! compaction.  A hook that fails or times out is absorbed — it never stops
//! the other hooks, and never crashes the session.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use serde_json::Value;
use tracing::debug;

use lemon_config::CompactionSettings;
use lemon_model::new_hex_id;

/// A hook body: JSON args in, JSON result (or error string) out.
pub type HookFn =
    Arc<dyn Fn(Value) -> BoxFuture<'static, Result<Value, String>> + Send + Sync>;

/// Hook priority; high runs first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum HookPriority {
    High,
    #[default]
    Normal,
    Low,
}

#[derive(Debug, Clone, Copy)]
pub struct HookOptions {
    pub priority: HookPriority,
    pub timeout_ms: u64,
}

impl Default for HookOptions {
    fn default() -> Self {
        Self {
            priority: HookPriority::Normal,
            timeout_ms: 5_000,
        }
    }
}

struct RegisteredHook {
    id: String,
    session_id: String,
    priority: HookPriority,
    timeout_ms: u64,
    registered_at: DateTime<Utc>,
    /// Insertion sequence; the tie-breaker inside one priority class.
    seq: u64,
    func: HookFn,
}

/// The function-free view returned by `list_hooks`.
#[derive(Debug, Clone)]
pub struct HookInfo {
    pub id: String,
    pub session_id: String,
    pub priority: HookPriority,
    pub timeout_ms: u64,
    pub registered_at: DateTime<Utc>,
}

/// Outcome summary of one `execute_hooks` pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HookExecution {
    pub executed: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub timed_out: usize,
}

pub struct HookRegistry {
    hooks: Mutex<Vec<RegisteredHook>>,
    seq: AtomicU64,
}

impl HookRegistry {
    pub fn new() -> Self {
        Self {
            hooks: Mutex::new(Vec::new()),
            seq: AtomicU64::new(0),
        }
    }

    pub fn register_hook(
        &self,
        session_id: impl Into<String>,
        func: HookFn,
        opts: HookOptions,
    ) -> String {
        let id = new_hex_id();
        let hook = RegisteredHook {
            id: id.clone(),
            session_id: session_id.into(),
            priority: opts.priority,
            timeout_ms: opts.timeout_ms,
            registered_at: Utc::now(),
            seq: self.seq.fetch_add(1, Ordering::SeqCst),
            func,
        };
        self.hooks.lock().unwrap().push(hook);
        id
    }

    pub fn unregister_hook(&self, hook_id: &str) -> bool {
        let mut hooks = self.hooks.lock().unwrap();
        let before = hooks.len();
        hooks.retain(|h| h.id != hook_id);
        hooks.len() != before
    }

    pub fn unregister_all_hooks(&self, session_id: &str) -> usize {
        let mut hooks = self.hooks.lock().unwrap();
        let before = hooks.len();
        hooks.retain(|h| h.session_id != session_id);
        before - hooks.len()
    }

    /// Hooks for a session in execution order, without function references.
    pub fn list_hooks(&self, session_id: &str) -> Vec<HookInfo> {
        let mut hooks: Vec<HookInfo> = self
            .hooks
            .lock()
            .unwrap()
            .iter()
            .filter(|h| h.session_id == session_id)
            .map(|h| HookInfo {
                id: h.id.clone(),
                session_id: h.session_id.clone(),
                priority: h.priority,
                timeout_ms: h.timeout_ms,
                registered_at: h.registered_at,
            })
            .collect();
        hooks.sort_by_key(|h| h.priority);
        hooks
    }

    /// Run the session's hooks in (priority desc, insertion order).
    ///
    /// Each hook runs on its own task under its own timeout; a panic counts
    /// as a failure and a deadline miss as a timeout.  Neither prevents the
    /// remaining hooks from running.
    pub async fn execute_hooks(&self, session_id: &str, args: Value) -> HookExecution {
        let mut batch: Vec<(String, u64, HookPriority, u64, HookFn)> = self
            .hooks
            .lock()
            .unwrap()
            .iter()
            .filter(|h| h.session_id == session_id)
            .map(|h| {
                (
                    h.id.clone(),
                    h.timeout_ms,
                    h.priority,
                    h.seq,
                    Arc::clone(&h.func),
                )
            })
            .collect();
        batch.sort_by_key(|(_, _, priority, seq, _)| (*priority, *seq));

        let mut result = HookExecution::default();
        for (id, timeout_ms, _, _, func) in batch {
            result.executed += 1;
            let fut = func(args.clone());
            let outcome =
                tokio::time::timeout(Duration::from_millis(timeout_ms), tokio::spawn(fut)).await;
            match outcome {
                Ok(Ok(Ok(_))) => result.succeeded += 1,
                Ok(Ok(Err(reason))) => {
                    debug!(hook = %id, %reason, "compaction hook failed");
                    result.failed += 1;
                }
                Ok(Err(join_err)) => {
                    debug!(hook = %id, "compaction hook panicked: {join_err}");
                    result.failed += 1;
                }
                Err(_) => {
                    debug!(hook = %id, timeout_ms, "compaction hook timed out");
                    result.timed_out += 1;
                }
            }
        }
        result
    }
}

impl Default for HookRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// The compaction gate: compaction (and therefore the hook pass) runs iff
/// it is enabled and the context plus reserve no longer fits the window.
pub fn should_compact_with_hooks(
    context_tokens: usize,
    context_window: usize,
    cfg: &CompactionSettings,
) -> bool {
    cfg.enabled && context_tokens + cfg.reserve_tokens >= context_window
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
