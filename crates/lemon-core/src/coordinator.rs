// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! Subagent coordinator: bounded fan-out of child session specs.
//!
//! Every spec in a batch runs concurrently under its own deadline; results
//! come back in submission order regardless of completion order.  Failures
//! are isolated per spec — one crashing subagent never takes down the batch
//! or the coordinator.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use lemon_model::{new_hex_id, Usage};
use lemon_tools::AbortSignal;

/// One subagent request.
#[derive(Debug, Clone, Default)]
pub struct SubagentSpec {
    pub prompt: String,
    pub subagent_type: Option<String>,
    pub description: Option<String>,
    /// Per-spec deadline override; falls back to the call's `timeout_ms`,
    /// then the coordinator default.
    pub timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubagentStatus {
    Done,
    Error,
    Timeout,
}

#[derive(Debug, Clone)]
pub struct SubagentResult {
    pub id: String,
    pub spec_index: usize,
    pub status: SubagentStatus,
    pub result: Option<String>,
    pub error: Option<String>,
    pub session_id: Option<String>,
    /// What the child consumed; zero for specs that never produced an
    /// outcome (invalid, timed out, crashed).
    pub usage: Usage,
}

/// What a successfully finished subagent produced.
#[derive(Debug, Clone)]
pub struct SubagentOutcome {
    pub result: String,
    pub session_id: String,
    /// Tokens and cost the child consumed, reported by the runner so the
    /// dispatching tool can fold it into the parent budget.
    pub usage: Usage,
}

/// The boundary that actually runs a child session for a spec.
///
/// `validate` rejects specs before anything is spawned (unknown subagent
/// types fail fast); `run` drives the child to completion and must observe
/// `signal` so `abort_all` can cancel it.
#[async_trait]
pub trait SubagentRunner: Send + Sync {
    fn validate(&self, _spec: &SubagentSpec) -> Result<(), String> {
        Ok(())
    }

    async fn run(
        &self,
        run_id: &str,
        spec: SubagentSpec,
        signal: AbortSignal,
    ) -> Result<SubagentOutcome, String>;
}

/// Per-call options for [`Coordinator::run_subagents`].
#[derive(Debug, Clone, Copy, Default)]
pub struct RunOptions {
    pub timeout_ms: Option<u64>,
}

struct ActiveRun {
    spec_index: usize,
    prompt: String,
    signal: AbortSignal,
}

pub struct Coordinator {
    runner: Arc<dyn SubagentRunner>,
    default_timeout: Duration,
    active: Arc<Mutex<HashMap<String, ActiveRun>>>,
}

impl Coordinator {
    pub fn new(runner: Arc<dyn SubagentRunner>, default_timeout: Duration) -> Self {
        Self {
            runner,
            default_timeout,
            active: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Execute a batch of specs concurrently.
    ///
    /// The returned vector has exactly one result per spec, in submission
    /// order, each with a globally unique run id.
    pub async fn run_subagents(
        &self,
        specs: Vec<SubagentSpec>,
        opts: RunOptions,
    ) -> Vec<SubagentResult> {
        struct Launched {
            id: String,
            spec_index: usize,
            handle: Option<JoinHandle<Result<Result<SubagentOutcome, String>, tokio::time::error::Elapsed>>>,
            /// Result decided at submission time (invalid spec, zero deadline).
            immediate: Option<SubagentResult>,
        }

        let mut launched = Vec::with_capacity(specs.len());
        for (spec_index, spec) in specs.into_iter().enumerate() {
            let id = new_hex_id();

            // Invalid specs fail fast, before any child is spawned.
            if let Err(error) = self.runner.validate(&spec) {
                debug!(run_id = %id, %error, "rejecting invalid subagent spec");
                launched.push(Launched {
                    id: id.clone(),
                    spec_index,
                    handle: None,
                    immediate: Some(SubagentResult {
                        id,
                        spec_index,
                        status: SubagentStatus::Error,
                        result: None,
                        error: Some(error),
                        session_id: None,
                        usage: Usage::default(),
                    }),
                });
                continue;
            }

            let timeout_ms = spec
                .timeout_ms
                .or(opts.timeout_ms)
                .unwrap_or(self.default_timeout.as_millis() as u64);
            if timeout_ms == 0 {
                launched.push(Launched {
                    id: id.clone(),
                    spec_index,
                    handle: None,
                    immediate: Some(SubagentResult {
                        id,
                        spec_index,
                        status: SubagentStatus::Timeout,
                        result: None,
                        error: None,
                        session_id: None,
                        usage: Usage::default(),
                    }),
                });
                continue;
            }

            let signal = AbortSignal::new();
            self.active.lock().unwrap().insert(
                id.clone(),
                ActiveRun {
                    spec_index,
                    prompt: spec.prompt.clone(),
                    signal: signal.clone(),
                },
            );

            let runner = Arc::clone(&self.runner);
            let run_id = id.clone();
            let handle = tokio::spawn(async move {
                tokio::time::timeout(
                    Duration::from_millis(timeout_ms),
                    runner.run(&run_id, spec, signal),
                )
                .await
            });
            launched.push(Launched {
                id,
                spec_index,
                handle: Some(handle),
                immediate: None,
            });
        }

        let mut results = Vec::with_capacity(launched.len());
        for entry in launched {
            let result = match (entry.immediate, entry.handle) {
                (Some(immediate), _) => immediate,
                (None, Some(handle)) => {
                    let status = handle.await;
                    self.active.lock().unwrap().remove(&entry.id);
                    match status {
                        Ok(Ok(Ok(outcome))) => SubagentResult {
                            id: entry.id,
                            spec_index: entry.spec_index,
                            status: SubagentStatus::Done,
                            result: Some(outcome.result),
                            error: None,
                            session_id: Some(outcome.session_id),
                            usage: outcome.usage,
                        },
                        Ok(Ok(Err(error))) => SubagentResult {
                            id: entry.id,
                            spec_index: entry.spec_index,
                            status: SubagentStatus::Error,
                            result: None,
                            error: Some(error),
                            session_id: None,
                            usage: Usage::default(),
                        },
                        Ok(Err(_elapsed)) => SubagentResult {
                            id: entry.id,
                            spec_index: entry.spec_index,
                            status: SubagentStatus::Timeout,
                            result: None,
                            error: None,
                            session_id: None,
                            usage: Usage::default(),
                        },
                        // The subagent task itself died (panic or abort);
                        // isolate the failure to this spec.
                        Err(join_err) => SubagentResult {
                            id: entry.id,
                            spec_index: entry.spec_index,
                            status: SubagentStatus::Error,
                            result: None,
                            error: Some(format!("subagent crashed: {join_err}")),
                            session_id: None,
                            usage: Usage::default(),
                        },
                    }
                }
                (None, None) => unreachable!("launched entry without handle or immediate"),
            };
            results.push(result);
        }
        results
    }

    /// Currently-running run ids with their prompts, in no particular order.
    pub fn list_active(&self) -> Vec<(String, String)> {
        self.active
            .lock()
            .unwrap()
            .iter()
            .map(|(id, run)| (id.clone(), run.prompt.clone()))
            .collect()
    }

    /// Cancel every active run and clear tracking.  Idempotent; returns the
    /// aborted run ids for observability.
    pub fn abort_all(&self) -> Vec<String> {
        let mut active = self.active.lock().unwrap();
        let ids: Vec<String> = active.keys().cloned().collect();
        for (_, run) in active.drain() {
            run.signal.abort();
        }
        ids
    }

    /// Tolerate stray notifications: an exit report for a run the
    /// coordinator no longer (or never) tracked is dropped silently.
    pub fn observe_exit(&self, run_id: &str) {
        let removed = self.active.lock().unwrap().remove(run_id);
        if removed.is_none() {
            debug!(%run_id, "ignoring exit notification for unknown run");
        }
    }

    /// Tolerate arbitrary unknown messages (monitor-death notifications,
    /// events for untracked sessions); they are logged and dropped.
    pub fn observe_unknown(&self, message: &serde_json::Value) {
        warn!(?message, "coordinator ignoring unknown message");
    }

    /// Index of an active run, for introspection in tests.
    pub fn active_spec_index(&self, run_id: &str) -> Option<usize> {
        self.active
            .lock()
            .unwrap()
            .get(run_id)
            .map(|r| r.spec_index)
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;

    /// Runner whose behavior is keyed off the spec's subagent_type.
    struct ScriptedRunner;

    #[async_trait]
    impl SubagentRunner for ScriptedRunner {
        fn validate(&self, spec: &SubagentSpec) -> Result<(), String> {
            match spec.subagent_type.as_deref() {
                Some(t) if t.starts_with("bad") => Err(format!("Unknown subagent: {t}")),
                _ => Ok(()),
            }
        }

        async fn run(
            &self,
            run_id: &str,
            spec: SubagentSpec,
            signal: AbortSignal,
        ) -> Result<SubagentOutcome, String> {
            match spec.subagent_type.as_deref() {
                Some("fail") => Err("subagent failed".to_string()),
                Some("panic") => panic!("deliberate"),
                Some("hang") => {
                    signal.cancelled().await;
                    Err("aborted".to_string())
                }
                _ => {
                    // Small stagger so completion order differs from
                    // submission order.
                    let delay = 10 + (spec.prompt.len() % 3) as u64 * 10;
                    tokio::time::sleep(Duration::from_millis(delay)).await;
                    Ok(SubagentOutcome {
                        result: format!("done: {}", spec.prompt),
                        session_id: format!("sess-{run_id}"),
                        usage: Usage {
                            total_tokens: 42,
                            cost: 0.25,
                            ..Usage::default()
                        },
                    })
                }
            }
        }
    }

    fn coordinator() -> Coordinator {
        Coordinator::new(Arc::new(ScriptedRunner), Duration::from_millis(500))
    }

    fn spec(prompt: &str, ty: Option<&str>) -> SubagentSpec {
        SubagentSpec {
            prompt: prompt.to_string(),
            subagent_type: ty.map(str::to_string),
            description: None,
            timeout_ms: None,
        }
    }

    // ── Ordering & IDs ────────────────────────────────────────────────────────

    #[tokio::test]
    async fn results_preserve_submission_order() {
        let c = coordinator();
        let specs = vec![spec("aaa", None), spec("b", None), spec("cc", None)];
        let results = c.run_subagents(specs, RunOptions::default()).await;
        assert_eq!(results.len(), 3);
        for (i, r) in results.iter().enumerate() {
            assert_eq!(r.spec_index, i);
            assert_eq!(r.status, SubagentStatus::Done);
            assert!(r.session_id.is_some());
            // Done results carry the usage the runner reported.
            assert_eq!(r.usage.total_tokens, 42);
        }
        assert_eq!(results[0].result.as_deref(), Some("done: aaa"));
    }

    #[tokio::test]
    async fn duplicate_specs_still_get_unique_ids() {
        let c = coordinator();
        let specs = vec![spec("same", None), spec("same", None), spec("same", None)];
        let results = c.run_subagents(specs, RunOptions::default()).await;
        let ids: HashSet<&str> = results.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids.len(), 3);
    }

    #[tokio::test]
    async fn ids_are_unique_across_batches() {
        let c = coordinator();
        let mut all_ids = HashSet::new();
        for _ in 0..3 {
            let results = c
                .run_subagents(vec![spec("x", None), spec("y", None)], RunOptions::default())
                .await;
            for r in results {
                assert!(all_ids.insert(r.id));
            }
        }
        assert_eq!(all_ids.len(), 6);
    }

    // ── Mixed failures (scenario S3) ──────────────────────────────────────────

    #[tokio::test]
    async fn mixed_batch_isolates_failures_and_keeps_order() {
        let c = coordinator();
        let specs = vec![
            spec("zero", Some("hang")),
            spec("one", Some("bad_type_a")),
            spec("two", Some("hang")),
            spec("three", Some("bad_type_b")),
            spec("four", Some("hang")),
        ];
        let results = c
            .run_subagents(
                specs,
                RunOptions {
                    timeout_ms: Some(50),
                },
            )
            .await;

        assert_eq!(results.len(), 5);
        assert_eq!(results[1].status, SubagentStatus::Error);
        assert_eq!(
            results[1].error.as_deref(),
            Some("Unknown subagent: bad_type_a")
        );
        assert_eq!(results[3].status, SubagentStatus::Error);
        assert_eq!(
            results[3].error.as_deref(),
            Some("Unknown subagent: bad_type_b")
        );
        for i in [0, 2, 4] {
            assert!(
                matches!(
                    results[i].status,
                    SubagentStatus::Timeout | SubagentStatus::Error
                ),
                "position {i} should have timed out or errored"
            );
        }

        let ids: HashSet<&str> = results.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids.len(), 5);
        assert!(c.list_active().is_empty(), "no runs may remain active");
    }

    #[tokio::test]
    async fn a_panicking_subagent_does_not_poison_the_batch() {
        let c = coordinator();
        let specs = vec![spec("ok", None), spec("boom", Some("panic")), spec("ok2", None)];
        let results = c.run_subagents(specs, RunOptions::default()).await;
        assert_eq!(results[0].status, SubagentStatus::Done);
        assert_eq!(results[1].status, SubagentStatus::Error);
        assert!(results[1].error.as_deref().unwrap().contains("crashed"));
        assert_eq!(results[2].status, SubagentStatus::Done);
        assert!(c.list_active().is_empty());
    }

    // ── Deadlines ─────────────────────────────────────────────────────────────

    #[tokio::test]
    async fn zero_timeout_times_out_immediately() {
        let c = coordinator();
        let results = c
            .run_subagents(
                vec![spec("x", None)],
                RunOptions {
                    timeout_ms: Some(0),
                },
            )
            .await;
        assert_eq!(results[0].status, SubagentStatus::Timeout);
        assert!(c.list_active().is_empty());
    }

    #[tokio::test]
    async fn per_spec_timeout_overrides_call_timeout() {
        let c = coordinator();
        let mut hanging = spec("h", Some("hang"));
        hanging.timeout_ms = Some(20);
        let results = c
            .run_subagents(
                vec![hanging],
                RunOptions {
                    timeout_ms: Some(60_000),
                },
            )
            .await;
        assert_eq!(results[0].status, SubagentStatus::Timeout);
    }

    #[tokio::test]
    async fn very_large_timeouts_are_honored() {
        let c = coordinator();
        let mut s = spec("quick", None);
        s.timeout_ms = Some(u64::MAX / 1_000_000);
        let results = c.run_subagents(vec![s], RunOptions::default()).await;
        assert_eq!(results[0].status, SubagentStatus::Done);
    }

    // ── abort_all ─────────────────────────────────────────────────────────────

    #[tokio::test]
    async fn abort_all_on_empty_coordinator_is_idempotent() {
        let c = coordinator();
        assert!(c.abort_all().is_empty());
        assert!(c.abort_all().is_empty());
    }

    #[tokio::test]
    async fn abort_all_cancels_active_runs_and_allows_new_batches() {
        let c = Arc::new(coordinator());
        let c2 = Arc::clone(&c);
        let batch = tokio::spawn(async move {
            c2.run_subagents(
                vec![spec("h1", Some("hang")), spec("h2", Some("hang"))],
                RunOptions {
                    timeout_ms: Some(60_000),
                },
            )
            .await
        });

        // Wait until both runs are tracked.
        for _ in 0..100 {
            if c.list_active().len() == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        let aborted = c.abort_all();
        assert_eq!(aborted.len(), 2);
        assert!(c.list_active().is_empty());

        let results = tokio::time::timeout(Duration::from_secs(2), batch)
            .await
            .expect("batch must finish after abort")
            .unwrap();
        for r in &results {
            assert_eq!(r.status, SubagentStatus::Error);
        }

        // The coordinator accepts new work afterwards.
        let again = c
            .run_subagents(vec![spec("fresh", None)], RunOptions::default())
            .await;
        assert_eq!(again[0].status, SubagentStatus::Done);
    }

    // ── Stray messages ────────────────────────────────────────────────────────

    #[tokio::test]
    async fn stray_notifications_are_ignored() {
        let c = coordinator();
        c.observe_exit("never-existed");
        c.observe_unknown(&serde_json::json!({"DOWN": "some-ref"}));
        c.observe_unknown(&serde_json::json!("garbage"));
        // Still fully functional.
        let results = c
            .run_subagents(vec![spec("ok", None)], RunOptions::default())
            .await;
        assert_eq!(results[0].status, SubagentStatus::Done);
    }
}
