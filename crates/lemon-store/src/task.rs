// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! Registry of in-flight agent tasks with capped event logs.
//!
//! Same crash-safety and cleanup shape as the process store, but cleanup
//! only evicts tasks in a terminal state (`completed | error`); queued and
//! running tasks are immune regardless of age.

use std::path::Path;

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

use crate::snapshot::Snapshot;
use crate::new_store_id;

/// Most recent events retained per task; older entries are dropped.
pub const MAX_TASK_EVENTS: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Queued,
    Running,
    Completed,
    Error,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Error)
    }
}

/// One timeline entry in a task's bounded event log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskEvent {
    /// 1-based sequence number, monotonic per task for the task's lifetime.
    /// Survives drop-oldest trimming, so gaps at the front indicate dropped
    /// history.
    pub index: u64,
    pub at: DateTime<Utc>,
    #[serde(default)]
    pub source: Option<String>,
    pub data: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRecord {
    pub task_id: String,
    pub status: TaskStatus,
    pub description: String,
    #[serde(default)]
    pub engine: Option<String>,
    #[serde(default)]
    pub role: Option<String>,
    pub inserted_at: DateTime<Utc>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub error: Option<String>,
    /// Bounded chronological event log (cap = [`MAX_TASK_EVENTS`]).
    #[serde(default)]
    pub events: Vec<TaskEvent>,
    /// Total events ever appended; `events[..]` holds the tail of these.
    #[serde(default)]
    pub event_seq: u64,
}

impl TaskRecord {
    pub fn new(description: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            task_id: new_store_id(),
            status: TaskStatus::Queued,
            description: description.into(),
            engine: None,
            role: None,
            inserted_at: now,
            started_at: None,
            completed_at: None,
            updated_at: now,
            result: None,
            error: None,
            events: Vec::new(),
            event_seq: 0,
        }
    }

    pub fn with_engine(mut self, engine: impl Into<String>) -> Self {
        self.engine = Some(engine.into());
        self
    }

    pub fn with_role(mut self, role: impl Into<String>) -> Self {
        self.role = Some(role.into());
        self
    }

    fn last_activity(&self) -> DateTime<Utc> {
        match self.completed_at {
            Some(done) if done > self.updated_at => done,
            _ => self.updated_at,
        }
    }
}

pub struct TaskStore {
    records: DashMap<String, TaskRecord>,
    snapshot: Option<Snapshot>,
}

impl TaskStore {
    pub fn new() -> Self {
        Self {
            records: DashMap::new(),
            snapshot: None,
        }
    }

    /// Store backed by `dir/tasks.json`, reloaded on startup.
    pub fn with_snapshot(dir: &Path) -> anyhow::Result<Self> {
        let snapshot = Snapshot::new(dir.join("tasks.json"));
        let store = Self {
            records: DashMap::new(),
            snapshot: Some(snapshot.clone()),
        };
        for rec in snapshot.read::<TaskRecord>()? {
            store.records.insert(rec.task_id.clone(), rec);
        }
        Ok(store)
    }

    pub fn insert(&self, record: TaskRecord) -> String {
        let id = record.task_id.clone();
        self.records.insert(id.clone(), record);
        self.persist();
        id
    }

    pub fn update(&self, task_id: &str, f: impl FnOnce(&mut TaskRecord)) -> bool {
        let found = match self.records.get_mut(task_id) {
            Some(mut rec) => {
                f(&mut rec);
                rec.updated_at = Utc::now();
                true
            }
            None => false,
        };
        if found {
            self.persist();
        }
        found
    }

    pub fn lookup(&self, task_id: &str) -> Option<TaskRecord> {
        self.records.get(task_id).map(|r| r.clone())
    }

    /// Mark a task running.
    pub fn mark_running(&self, task_id: &str) -> bool {
        self.update(task_id, |r| {
            r.status = TaskStatus::Running;
            r.started_at = Some(Utc::now());
        })
    }

    /// Mark a task completed with its result payload.
    pub fn mark_completed(&self, task_id: &str, result: Value) -> bool {
        self.update(task_id, |r| {
            r.status = TaskStatus::Completed;
            r.completed_at = Some(Utc::now());
            r.result = Some(result);
        })
    }

    /// Mark a task failed with a human-readable error.
    pub fn mark_error(&self, task_id: &str, error: impl Into<String>) -> bool {
        self.update(task_id, |r| {
            r.status = TaskStatus::Error;
            r.completed_at = Some(Utc::now());
            r.error = Some(error.into());
        })
    }

    /// Append one event, retaining the newest [`MAX_TASK_EVENTS`] entries.
    pub fn append_event(&self, task_id: &str, source: Option<String>, data: Value) -> bool {
        let found = match self.records.get_mut(task_id) {
            Some(mut rec) => {
                rec.event_seq += 1;
                let index = rec.event_seq;
                rec.events.push(TaskEvent {
                    index,
                    at: Utc::now(),
                    source,
                    data,
                });
                if rec.events.len() > MAX_TASK_EVENTS {
                    let overflow = rec.events.len() - MAX_TASK_EVENTS;
                    rec.events.drain(..overflow);
                }
                rec.updated_at = Utc::now();
                true
            }
            None => false,
        };
        if found {
            self.persist();
        }
        found
    }

    /// Evict terminal tasks older than `ttl_seconds`, returning the count.
    /// Queued and running tasks are never evicted.
    pub fn cleanup(&self, ttl_seconds: i64) -> usize {
        let cutoff = Utc::now() - Duration::seconds(ttl_seconds);
        let expired: Vec<String> = self
            .records
            .iter()
            .filter(|e| e.status.is_terminal() && e.last_activity() < cutoff)
            .map(|e| e.key().clone())
            .collect();
        let count = expired.len();
        for id in expired {
            self.records.remove(&id);
        }
        if count > 0 {
            self.persist();
        }
        count
    }

    pub fn clear(&self) {
        self.records.clear();
        self.persist();
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    fn persist(&self) {
        if let Some(snapshot) = &self.snapshot {
            let records: Vec<TaskRecord> =
                self.records.iter().map(|e| e.value().clone()).collect();
            if let Err(e) = snapshot.write(&records) {
                warn!("task store snapshot write failed: {e:#}");
            }
        }
    }
}

impl Default for TaskStore {
    fn default() -> Self {
        Self::new()
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
