// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! Per-run budget tracking with parent aggregation.
//!
//! Limits are monotonic down the tree: a subagent budget inherits its
//! parent's limits and may only tighten them.  When a child completes, its
//! consumption is folded into the parent so sibling spawns see the true
//! remaining budget.

use dashmap::DashMap;
use serde_json::Value;

use lemon_model::new_hex_id;

/// Optional ceilings; `None` means unlimited and can never be exceeded.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct BudgetLimits {
    pub max_tokens: Option<u64>,
    pub max_cost: Option<f64>,
    pub max_children: Option<u32>,
}

impl BudgetLimits {
    /// Inherit `parent`, tightening with any stricter child limit.
    /// A child can never loosen what the parent set.
    fn tightened_by(parent: &BudgetLimits, child: &BudgetLimits) -> BudgetLimits {
        fn tighter<T: PartialOrd + Copy>(parent: Option<T>, child: Option<T>) -> Option<T> {
            match (parent, child) {
                (Some(p), Some(c)) => Some(if c < p { c } else { p }),
                (Some(p), None) => Some(p),
                (None, c) => c,
            }
        }
        BudgetLimits {
            max_tokens: tighter(parent.max_tokens, child.max_tokens),
            max_cost: tighter(parent.max_cost, child.max_cost),
            max_children: tighter(parent.max_children, child.max_children),
        }
    }
}

#[derive(Debug, Clone, Default)]
struct BudgetState {
    limits: BudgetLimits,
    used_tokens: u64,
    used_cost: f64,
    active_children: u32,
}

/// Why a budget check failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BudgetLimitKind {
    TokenLimitExceeded,
    CostLimitExceeded,
    ChildLimitExceeded,
}

#[derive(Debug, Clone, thiserror::Error)]
#[error("budget_exceeded: {kind:?} (limit {limit}, used {used})")]
pub struct BudgetExceeded {
    pub kind: BudgetLimitKind,
    pub limit: f64,
    pub used: f64,
}

/// Remaining headroom; `None` per axis means unlimited.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BudgetRemaining {
    pub tokens_remaining: Option<u64>,
    pub cost_remaining: Option<f64>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct BudgetUsage {
    pub tokens: u64,
    pub cost: f64,
}

/// Per-run budget registry.
pub struct BudgetTracker {
    budgets: DashMap<String, BudgetState>,
}

impl BudgetTracker {
    pub fn new() -> Self {
        Self {
            budgets: DashMap::new(),
        }
    }

    /// Create a root budget and return its run id.
    pub fn create_budget(&self, limits: BudgetLimits) -> String {
        let id = new_hex_id();
        self.budgets.insert(
            id.clone(),
            BudgetState {
                limits,
                ..BudgetState::default()
            },
        );
        id
    }

    /// Create a child budget inheriting (and possibly tightening) the
    /// parent's limits.
    pub fn create_subagent_budget(
        &self,
        parent: &str,
        child_limits: BudgetLimits,
    ) -> Option<String> {
        let parent_limits = self.budgets.get(parent)?.limits;
        let limits = BudgetLimits::tightened_by(&parent_limits, &child_limits);
        Some(self.create_budget(limits))
    }

    pub fn record_usage(&self, run: &str, tokens: Option<u64>, cost: Option<f64>) -> bool {
        match self.budgets.get_mut(run) {
            Some(mut b) => {
                b.used_tokens += tokens.unwrap_or(0);
                b.used_cost += cost.unwrap_or(0.0);
                true
            }
            None => false,
        }
    }

    /// Extract `{total_tokens, cost}` from an LLM response payload and
    /// record it.  Both snake_case and camelCase key spellings are accepted,
    /// at the top level or nested under `usage`.
    pub fn record_response_usage(&self, run: &str, response: &Value) -> bool {
        let tokens = extract_u64(response, &["total_tokens", "totalTokens"]);
        let cost = extract_f64(response, &["cost"]);
        self.record_usage(run, tokens, cost)
    }

    /// Check the run against its limits.
    pub fn check_budget(&self, run: &str) -> Result<BudgetRemaining, BudgetExceeded> {
        let b = match self.budgets.get(run) {
            Some(b) => b.clone(),
            None => {
                return Ok(BudgetRemaining {
                    tokens_remaining: None,
                    cost_remaining: None,
                })
            }
        };
        if let Some(max) = b.limits.max_tokens {
            if b.used_tokens >= max {
                return Err(BudgetExceeded {
                    kind: BudgetLimitKind::TokenLimitExceeded,
                    limit: max as f64,
                    used: b.used_tokens as f64,
                });
            }
        }
        if let Some(max) = b.limits.max_cost {
            if b.used_cost >= max {
                return Err(BudgetExceeded {
                    kind: BudgetLimitKind::CostLimitExceeded,
                    limit: max,
                    used: b.used_cost,
                });
            }
        }
        // Same threshold as the spawn gate: once `active_children` reaches
        // the cap, `can_spawn_child` blocks and the check reports it.
        if let Some(max) = b.limits.max_children {
            if b.active_children >= max {
                return Err(BudgetExceeded {
                    kind: BudgetLimitKind::ChildLimitExceeded,
                    limit: max as f64,
                    used: b.active_children as f64,
                });
            }
        }
        Ok(BudgetRemaining {
            tokens_remaining: b.limits.max_tokens.map(|m| m.saturating_sub(b.used_tokens)),
            cost_remaining: b.limits.max_cost.map(|m| (m - b.used_cost).max(0.0)),
        })
    }

    /// True when another child may start under this run's child cap.
    pub fn can_spawn_child(&self, run: &str) -> bool {
        match self.budgets.get(run) {
            Some(b) => match b.limits.max_children {
                Some(max) => b.active_children < max,
                None => true,
            },
            None => false,
        }
    }

    pub fn child_started(&self, parent: &str) -> bool {
        match self.budgets.get_mut(parent) {
            Some(mut b) => {
                b.active_children += 1;
                true
            }
            None => false,
        }
    }

    /// Decrement the active-child count and fold the child's consumption
    /// into the parent.
    pub fn child_completed(&self, parent: &str, child: &str) -> bool {
        let child_usage = match self.budgets.get(child) {
            Some(b) => BudgetUsage {
                tokens: b.used_tokens,
                cost: b.used_cost,
            },
            None => BudgetUsage::default(),
        };
        match self.budgets.get_mut(parent) {
            Some(mut b) => {
                b.active_children = b.active_children.saturating_sub(1);
                b.used_tokens += child_usage.tokens;
                b.used_cost += child_usage.cost;
                true
            }
            None => false,
        }
    }

    pub fn get_usage(&self, run: &str) -> Option<BudgetUsage> {
        self.budgets.get(run).map(|b| BudgetUsage {
            tokens: b.used_tokens,
            cost: b.used_cost,
        })
    }

    pub fn remove(&self, run: &str) {
        self.budgets.remove(run);
    }
}

impl Default for BudgetTracker {
    fn default() -> Self {
        Self::new()
    }
}

fn extract_u64(response: &Value, keys: &[&str]) -> Option<u64> {
    for key in keys {
        if let Some(v) = response.get(key).and_then(Value::as_u64) {
            return Some(v);
        }
        if let Some(v) = response
            .get("usage")
            .and_then(|u| u.get(key))
            .and_then(Value::as_u64)
        {
            return Some(v);
        }
    }
    None
}

fn extract_f64(response: &Value, keys: &[&str]) -> Option<f64> {
    for key in keys {
        if let Some(v) = response.get(key).and_then(Value::as_f64) {
            return Some(v);
        }
        if let Some(v) = response
            .get("usage")
            .and_then(|u| u.get(key))
            .and_then(Value::as_f64)
        {
            return Some(v);
        }
    }
    None
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
