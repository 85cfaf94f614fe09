// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! Tool adapters for the non-local dispatch targets: sandboxed sidecar
//! tools and the subagent fan-out tool.  Both expose the same uniform
//! [`Tool`] shape as the built-ins so the actor dispatches them uniformly.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::debug;

use lemon_model::Trust;
use lemon_sidecar::{SidecarChannel, ToolDescriptor};
use lemon_tools::{AbortSignal, Tool, ToolResult, ToolSource};

use crate::budget::{BudgetLimits, BudgetTracker};
use crate::coordinator::{Coordinator, RunOptions, SubagentSpec, SubagentStatus};

/// A sandboxed tool discovered from the sidecar.
///
/// Output is always untrusted; errors reported by the sandbox become
/// error tool results, and channel failures degrade to errors rather than
/// crashing the session.
pub struct SidecarTool {
    descriptor: ToolDescriptor,
    channel: Arc<SidecarChannel>,
}

impl SidecarTool {
    pub fn new(descriptor: ToolDescriptor, channel: Arc<SidecarChannel>) -> Self {
        Self {
            descriptor,
            channel,
        }
    }

    pub fn descriptor(&self) -> &ToolDescriptor {
        &self.descriptor
    }
}

#[async_trait]
impl Tool for SidecarTool {
    fn name(&self) -> &str {
        &self.descriptor.name
    }

    fn description(&self) -> &str {
        &self.descriptor.description
    }

    fn parameters(&self) -> Value {
        self.descriptor.schema.clone()
    }

    fn source(&self) -> ToolSource {
        ToolSource::Sidecar
    }

    fn trust(&self) -> Trust {
        Trust::Untrusted
    }

    async fn execute(
        &self,
        _call_id: &str,
        params: Value,
        _cwd: &Path,
        signal: AbortSignal,
    ) -> ToolResult {
        let invoke = self.channel.invoke(&self.descriptor.name, params.to_string());
        let response = tokio::select! {
            biased;
            _ = signal.cancelled() => {
                return ToolResult::err("sandboxed tool aborted")
                    .with_detail("cancelled", json!(true));
            }
            r = invoke => r,
        };
        match response {
            Ok(resp) => {
                let mut details = resp.details.clone();
                if !resp.logs.is_empty() {
                    details.insert("logs".to_string(), json!(resp.logs));
                }
                if let Some(error) = resp.error {
                    ToolResult::err(error).untrusted().with_details(details)
                } else {
                    ToolResult::ok(resp.output_json.unwrap_or_default())
                        .untrusted()
                        .with_details(details)
                }
            }
            Err(e) => ToolResult::err(format!("sandboxed tool failed: {e}")).untrusted(),
        }
    }
}

/// The subagent fan-out tool: runs a batch of child specs through the
/// coordinator under the session's budget.
pub struct SubagentTool {
    coordinator: Arc<Coordinator>,
    budget: Arc<BudgetTracker>,
    /// The owning session's budget run id.
    run_id: String,
}

impl SubagentTool {
    pub fn new(coordinator: Arc<Coordinator>, budget: Arc<BudgetTracker>, run_id: String) -> Self {
        Self {
            coordinator,
            budget,
            run_id,
        }
    }
}

#[async_trait]
impl Tool for SubagentTool {
    fn name(&self) -> &str {
        "subagents"
    }

    fn description(&self) -> &str {
        "Run one or more subagents in parallel, each on a focused sub-task, \
         and collect their results in submission order. Each task object \
         takes a prompt plus optional subagent_type, description and \
         timeout_ms."
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "tasks": {
                    "type": "array",
                    "items": {
                        "type": "object",
                        "properties": {
                            "prompt": { "type": "string" },
                            "subagent_type": { "type": "string" },
                            "description": { "type": "string" },
                            "timeout_ms": { "type": "integer" }
                        },
                        "required": ["prompt"]
                    }
                },
                "timeout_ms": { "type": "integer" }
            },
            "required": ["tasks"],
            "additionalProperties": false
        })
    }

    async fn execute(
        &self,
        _call_id: &str,
        params: Value,
        _cwd: &Path,
        signal: AbortSignal,
    ) -> ToolResult {
        let Some(tasks) = params.get("tasks").and_then(Value::as_array) else {
            return ToolResult::err("missing 'tasks' array");
        };
        if tasks.is_empty() {
            return ToolResult::err("'tasks' must not be empty");
        }

        let specs: Vec<SubagentSpec> = tasks
            .iter()
            .map(|t| SubagentSpec {
                prompt: t
                    .get("prompt")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
                subagent_type: t
                    .get("subagent_type")
                    .and_then(Value::as_str)
                    .map(str::to_string),
                description: t
                    .get("description")
                    .and_then(Value::as_str)
                    .map(str::to_string),
                timeout_ms: t.get("timeout_ms").and_then(Value::as_u64),
            })
            .collect();

        // Budget gate: every child must fit under the parent's child cap
        // before any of them starts, and each gets its own budget inheriting
        // the parent's limits so its consumption folds back on completion.
        let mut child_budgets: Vec<String> = Vec::new();
        let blocked = loop {
            if child_budgets.len() == specs.len() {
                break false;
            }
            if !self.budget.can_spawn_child(&self.run_id) {
                break true;
            }
            let Some(child_id) = self
                .budget
                .create_subagent_budget(&self.run_id, BudgetLimits::default())
            else {
                break true;
            };
            self.budget.child_started(&self.run_id);
            child_budgets.push(child_id);
        };
        if blocked {
            for child_id in &child_budgets {
                self.budget.child_completed(&self.run_id, child_id);
                self.budget.remove(child_id);
            }
            return ToolResult::err(
                "budget_exceeded: child_limit_exceeded - cannot spawn more subagents",
            );
        }

        let opts = RunOptions {
            timeout_ms: params.get("timeout_ms").and_then(Value::as_u64),
        };

        debug!(count = specs.len(), "dispatching subagent batch");
        let run = self.coordinator.run_subagents(specs, opts);
        let results = tokio::select! {
            biased;
            _ = signal.cancelled() => {
                self.coordinator.abort_all();
                // Aborted children report no usage; release their slots.
                for child_id in &child_budgets {
                    self.budget.child_completed(&self.run_id, child_id);
                    self.budget.remove(child_id);
                }
                return ToolResult::err("subagent batch aborted")
                    .with_detail("cancelled", json!(true));
            }
            r = run => r,
        };

        // Results come back in submission order, matching `child_budgets`.
        // Record each child's reported consumption against its own budget,
        // then fold it into the parent.
        for (result, child_id) in results.iter().zip(&child_budgets) {
            self.budget.record_usage(
                child_id,
                Some(result.usage.total_tokens),
                Some(result.usage.cost),
            );
            self.budget.child_completed(&self.run_id, child_id);
            self.budget.remove(child_id);
        }

        let any_failed = results
            .iter()
            .any(|r| r.status != SubagentStatus::Done);
        let rendered: Vec<Value> = results
            .iter()
            .map(|r| {
                json!({
                    "id": r.id,
                    "status": match r.status {
                        SubagentStatus::Done => "done",
                        SubagentStatus::Error => "error",
                        SubagentStatus::Timeout => "timeout",
                    },
                    "result": r.result,
                    "error": r.error,
                    "session_id": r.session_id,
                })
            })
            .collect();

        ToolResult::ok(json!({ "results": rendered }).to_string())
            .with_detail("failed", json!(any_failed))
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use lemon_model::Usage;

    use super::*;
    use crate::coordinator::{SubagentOutcome, SubagentRunner};

    struct OkRunner;

    #[async_trait]
    impl SubagentRunner for OkRunner {
        async fn run(
            &self,
            run_id: &str,
            spec: SubagentSpec,
            _signal: AbortSignal,
        ) -> Result<SubagentOutcome, String> {
            Ok(SubagentOutcome {
                result: format!("ok: {}", spec.prompt),
                session_id: format!("sess-{run_id}"),
                usage: Usage::default(),
            })
        }
    }

    /// Runner that reports fixed per-child consumption.
    struct MeteredRunner;

    #[async_trait]
    impl SubagentRunner for MeteredRunner {
        async fn run(
            &self,
            run_id: &str,
            spec: SubagentSpec,
            _signal: AbortSignal,
        ) -> Result<SubagentOutcome, String> {
            Ok(SubagentOutcome {
                result: format!("ok: {}", spec.prompt),
                session_id: format!("sess-{run_id}"),
                usage: Usage {
                    input_tokens: 60,
                    output_tokens: 40,
                    total_tokens: 100,
                    cost: 0.5,
                },
            })
        }
    }

    fn subagent_tool(max_children: Option<u32>) -> (SubagentTool, Arc<BudgetTracker>, String) {
        let coordinator = Arc::new(Coordinator::new(
            Arc::new(OkRunner),
            Duration::from_millis(500),
        ));
        let budget = Arc::new(BudgetTracker::new());
        let run_id = budget.create_budget(BudgetLimits {
            max_children,
            ..BudgetLimits::default()
        });
        (
            SubagentTool::new(coordinator, Arc::clone(&budget), run_id.clone()),
            budget,
            run_id,
        )
    }

    #[tokio::test]
    async fn batch_results_come_back_in_order() {
        let (tool, _, _) = subagent_tool(None);
        let out = tool
            .execute(
                "c1",
                json!({"tasks": [{"prompt": "a"}, {"prompt": "b"}]}),
                Path::new("."),
                AbortSignal::new(),
            )
            .await;
        assert!(!out.is_error);
        let v: Value = serde_json::from_str(&out.content).unwrap();
        assert_eq!(v["results"][0]["result"], "ok: a");
        assert_eq!(v["results"][1]["result"], "ok: b");
    }

    #[tokio::test]
    async fn child_budget_blocks_oversized_batches() {
        let (tool, _, _) = subagent_tool(Some(1));
        let out = tool
            .execute(
                "c1",
                json!({"tasks": [{"prompt": "a"}, {"prompt": "b"}]}),
                Path::new("."),
                AbortSignal::new(),
            )
            .await;
        assert!(out.is_error);
        assert!(out.content.contains("budget_exceeded"));
    }

    #[tokio::test]
    async fn children_are_released_after_the_batch() {
        let (tool, budget, run_id) = subagent_tool(Some(2));
        let _ = tool
            .execute(
                "c1",
                json!({"tasks": [{"prompt": "a"}, {"prompt": "b"}]}),
                Path::new("."),
                AbortSignal::new(),
            )
            .await;
        assert!(budget.can_spawn_child(&run_id));
    }

    #[tokio::test]
    async fn child_usage_is_aggregated_into_the_parent() {
        let coordinator = Arc::new(Coordinator::new(
            Arc::new(MeteredRunner),
            Duration::from_millis(500),
        ));
        let budget = Arc::new(BudgetTracker::new());
        let run_id = budget.create_budget(BudgetLimits {
            max_tokens: Some(1000),
            ..BudgetLimits::default()
        });
        let tool = SubagentTool::new(coordinator, Arc::clone(&budget), run_id.clone());

        let out = tool
            .execute(
                "c1",
                json!({"tasks": [{"prompt": "meter me"}]}),
                Path::new("."),
                AbortSignal::new(),
            )
            .await;
        assert!(!out.is_error);

        // The child's real consumption landed on the parent.
        let usage = budget.get_usage(&run_id).unwrap();
        assert_eq!(usage.tokens, 100);
        assert!((usage.cost - 0.5).abs() < 1e-9);
        let remaining = budget.check_budget(&run_id).unwrap();
        assert_eq!(remaining.tokens_remaining, Some(900));
        // The child slot and its budget entry are released.
        assert!(budget.can_spawn_child(&run_id));
    }

    #[tokio::test]
    async fn missing_tasks_is_an_error() {
        let (tool, _, _) = subagent_tool(None);
        let out = tool
            .execute("c1", json!({}), Path::new("."), AbortSignal::new())
            .await;
        assert!(out.is_error);
    }
}
