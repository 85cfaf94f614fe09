// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use futures::future::BoxFuture;
use tokio::sync::Mutex;
use tracing::debug;

/// Which tools the policy admits without further checks.
#[derive(Debug, Clone)]
pub enum AllowPolicy {
    /// Every tool is pre-approved.
    All,
    /// Only the named tools are pre-approved.
    Set(HashSet<String>),
}

impl AllowPolicy {
    fn grants(&self, tool: &str) -> bool {
        match self {
            Self::All => true,
            Self::Set(set) => set.contains(tool),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApprovalDecision {
    Granted,
    Denied,
}

/// A pending approval question forwarded to the embedder.
#[derive(Debug, Clone)]
pub struct ApprovalRequest {
    pub session_id: String,
    pub tool: String,
    /// Human-readable reason, e.g. the capabilities that triggered the gate.
    pub reason: String,
}

pub type ApprovalFn =
    Arc<dyn Fn(ApprovalRequest) -> BoxFuture<'static, ApprovalDecision> + Send + Sync>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PolicyDecision {
    Allow,
    /// User-visible denial; becomes a "denied" tool result.
    Deny(String),
}

/// Per-session gate for capability-requiring tools.
///
/// Decision order: deny set → allow policy → approval flow.  Approvals are
/// remembered for the session, so each gated tool asks at most once.
pub struct ToolPolicy {
    allow: AllowPolicy,
    deny: HashSet<String>,
    require_approval: HashSet<String>,
    approvals: Mutex<HashMap<String, ApprovalDecision>>,
    approval_request_fun: Option<ApprovalFn>,
}

impl ToolPolicy {
    pub fn new(
        allow: AllowPolicy,
        deny: HashSet<String>,
        require_approval: HashSet<String>,
        approval_request_fun: Option<ApprovalFn>,
    ) -> Self {
        Self {
            allow,
            deny,
            require_approval,
            approvals: Mutex::new(HashMap::new()),
            approval_request_fun,
        }
    }

    /// Gate that admits everything — sessions without a configured policy.
    pub fn allow_all() -> Self {
        Self::new(AllowPolicy::All, HashSet::new(), HashSet::new(), None)
    }

    /// Seed an already-granted approval (e.g. restored from session state).
    pub async fn grant(&self, tool: impl Into<String>) {
        self.approvals
            .lock()
            .await
            .insert(tool.into(), ApprovalDecision::Granted);
    }

    /// Check whether `tool` may run.  `needs_capability_approval` is true for
    /// sidecar tools declaring http / tool_invoke / secrets capabilities.
    pub async fn check(
        &self,
        session_id: &str,
        tool: &str,
        needs_capability_approval: bool,
        reason: &str,
    ) -> PolicyDecision {
        if self.deny.contains(tool) {
            return PolicyDecision::Deny(format!("tool '{tool}' is denied by policy"));
        }
        if self.allow.grants(tool) {
            return PolicyDecision::Allow;
        }

        let gated = needs_capability_approval || self.require_approval.contains(tool);
        if !gated {
            return PolicyDecision::Allow;
        }

        // Stored approvals are per session instance and consulted first.
        if let Some(decision) = self.approvals.lock().await.get(tool) {
            return match decision {
                ApprovalDecision::Granted => PolicyDecision::Allow,
                ApprovalDecision::Denied => {
                    PolicyDecision::Deny(format!("tool '{tool}' was denied"))
                }
            };
        }

        let Some(ask) = &self.approval_request_fun else {
            return PolicyDecision::Deny(format!(
                "tool '{tool}' requires approval and no approver is configured"
            ));
        };
        let decision = ask(ApprovalRequest {
            session_id: session_id.to_string(),
            tool: tool.to_string(),
            reason: reason.to_string(),
        })
        .await;
        debug!(%tool, ?decision, "approval decision recorded");
        self.approvals
            .lock()
            .await
            .insert(tool.to_string(), decision.clone());
        match decision {
            ApprovalDecision::Granted => PolicyDecision::Allow,
            ApprovalDecision::Denied => PolicyDecision::Deny(format!("tool '{tool}' was denied")),
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
