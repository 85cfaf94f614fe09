// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! TTL-bounded registry of spawned OS processes.
//!
//! The table is an in-memory [`DashMap`] mirrored to a crash-safe snapshot
//! file after every mutation.  On startup the table is rebuilt from the
//! snapshot; records whose OS process no longer exists are marked `lost`
//! and become subject to normal TTL cleanup.

use std::collections::VecDeque;
use std::path::Path;

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::snapshot::Snapshot;
use crate::new_store_id;

/// Lines removed from the head of an overflowing log buffer per trim.
/// The buffer may transiently exceed `max_log_lines` by at most this much.
const TRIM_BATCH: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessStatus {
    Pending,
    Running,
    Completed,
    Error,
    Killed,
    /// The owning process disappeared across a restart.
    Lost,
}

impl ProcessStatus {
    /// Terminal records are the only ones TTL cleanup may evict.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Error | Self::Killed | Self::Lost
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessRecord {
    pub process_id: String,
    pub status: ProcessStatus,
    pub command: String,
    pub cwd: String,
    /// OS pid, present once the process has been spawned.
    #[serde(default)]
    pub os_pid: Option<u32>,
    pub inserted_at: DateTime<Utc>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub exit_code: Option<i32>,
    /// Bounded FIFO of recent output lines.
    #[serde(default)]
    pub log_buffer: VecDeque<String>,
    /// Retained line count as of the last flush (≤ `max_log_lines`).
    #[serde(default)]
    pub log_count: usize,
}

impl ProcessRecord {
    pub fn new(command: impl Into<String>, cwd: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            process_id: new_store_id(),
            status: ProcessStatus::Pending,
            command: command.into(),
            cwd: cwd.into(),
            os_pid: None,
            inserted_at: now,
            started_at: None,
            completed_at: None,
            updated_at: now,
            exit_code: None,
            log_buffer: VecDeque::new(),
            log_count: 0,
        }
    }

    /// The eviction clock: the later of completion and last update.
    fn last_activity(&self) -> DateTime<Utc> {
        match self.completed_at {
            Some(done) if done > self.updated_at => done,
            _ => self.updated_at,
        }
    }

    /// Trim the buffer to exactly the cap and sync `log_count`.
    fn flush_logs(&mut self, max_log_lines: usize) {
        while self.log_buffer.len() > max_log_lines {
            self.log_buffer.pop_front();
        }
        self.log_count = self.log_buffer.len();
    }
}

/// Aggregate store snapshot returned by [`ProcessStore::status`].
#[derive(Debug, Clone, Default, Serialize)]
pub struct ProcessStoreStatus {
    pub total: usize,
    pub pending: usize,
    pub running: usize,
    pub completed: usize,
    pub error: usize,
    pub killed: usize,
    pub lost: usize,
}

pub struct ProcessStore {
    records: DashMap<String, ProcessRecord>,
    snapshot: Option<Snapshot>,
    max_log_lines: usize,
}

impl ProcessStore {
    /// In-memory store without persistence (tests, ephemeral sessions).
    pub fn new(max_log_lines: usize) -> Self {
        Self {
            records: DashMap::new(),
            snapshot: None,
            max_log_lines,
        }
    }

    /// Store backed by `dir/processes.json`, reloaded on startup.
    ///
    /// Reloaded records in a live state whose OS process is gone are marked
    /// [`ProcessStatus::Lost`].
    pub fn with_snapshot(dir: &Path, max_log_lines: usize) -> anyhow::Result<Self> {
        let snapshot = Snapshot::new(dir.join("processes.json"));
        let store = Self {
            records: DashMap::new(),
            snapshot: Some(snapshot.clone()),
            max_log_lines,
        };
        let mut recovered: Vec<ProcessRecord> = snapshot.read()?;
        for rec in recovered.iter_mut() {
            if !rec.status.is_terminal() && !pid_alive(rec.os_pid) {
                debug!(process_id = %rec.process_id, "marking reloaded process as lost");
                rec.status = ProcessStatus::Lost;
                rec.completed_at = Some(Utc::now());
                rec.updated_at = Utc::now();
            }
            store.records.insert(rec.process_id.clone(), rec.clone());
        }
        store.persist();
        Ok(store)
    }

    /// Insert a record, returning its id.
    pub fn insert(&self, record: ProcessRecord) -> String {
        let id = record.process_id.clone();
        self.records.insert(id.clone(), record);
        self.persist();
        id
    }

    /// Apply `f` to the record, bumping `updated_at`.  Returns false when
    /// the id is unknown.
    pub fn update(&self, process_id: &str, f: impl FnOnce(&mut ProcessRecord)) -> bool {
        let found = match self.records.get_mut(process_id) {
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

    /// Fetch a record with its log buffer flushed to the cap.
    pub fn lookup(&self, process_id: &str) -> Option<ProcessRecord> {
        let max = self.max_log_lines;
        self.records.get_mut(process_id).map(|mut rec| {
            rec.flush_logs(max);
            rec.clone()
        })
    }

    /// Append output lines to a record's bounded log buffer.
    ///
    /// Overflow is trimmed from the head in [`TRIM_BATCH`]-sized batches, so
    /// the buffer can transiently exceed the cap but never by more than one
    /// batch.
    pub fn append_log(&self, process_id: &str, lines: impl IntoIterator<Item = String>) -> bool {
        let max = self.max_log_lines;
        let found = match self.records.get_mut(process_id) {
            Some(mut rec) => {
                for line in lines {
                    rec.log_buffer.push_back(line);
                }
                while rec.log_buffer.len() >= max + TRIM_BATCH {
                    for _ in 0..TRIM_BATCH {
                        rec.log_buffer.pop_front();
                    }
                }
                rec.log_count = rec.log_buffer.len().min(max);
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

    /// Evict terminal records older than `ttl_seconds`, returning the count.
    ///
    /// Records in `pending` or `running` state are never evicted, regardless
    /// of age.
    pub fn cleanup(&self, ttl_seconds: i64) -> usize {
        let cutoff = Utc::now() - Duration::seconds(ttl_seconds);
        let expired: Vec<String> = self
            .records
            .iter()
            .filter(|entry| entry.status.is_terminal() && entry.last_activity() < cutoff)
            .map(|entry| entry.key().clone())
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

    /// Drop every record.
    pub fn clear(&self) {
        self.records.clear();
        self.persist();
    }

    /// Per-status counts.
    pub fn status(&self) -> ProcessStoreStatus {
        let mut s = ProcessStoreStatus::default();
        for entry in self.records.iter() {
            s.total += 1;
            match entry.status {
                ProcessStatus::Pending => s.pending += 1,
                ProcessStatus::Running => s.running += 1,
                ProcessStatus::Completed => s.completed += 1,
                ProcessStatus::Error => s.error += 1,
                ProcessStatus::Killed => s.killed += 1,
                ProcessStatus::Lost => s.lost += 1,
            }
        }
        s
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    fn persist(&self) {
        if let Some(snapshot) = &self.snapshot {
            let records: Vec<ProcessRecord> =
                self.records.iter().map(|e| e.value().clone()).collect();
            if let Err(e) = snapshot.write(&records) {
                warn!("process store snapshot write failed: {e:#}");
            }
        }
    }
}

/// Probe whether an OS pid is still alive.  `None` (never spawned) counts
/// as dead.
#[cfg(unix)]
fn pid_alive(pid: Option<u32>) -> bool {
    match pid {
        Some(pid) => unsafe { libc::kill(pid as i32, 0) == 0 },
        None => false,
    }
}

#[cfg(not(unix))]
fn pid_alive(_pid: Option<u32>) -> bool {
    false
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn record(command: &str) -> ProcessRecord {
        ProcessRecord::new(command, "/tmp")
    }

    // ── Basic operations ──────────────────────────────────────────────────────

    #[test]
    fn insert_then_lookup_round_trips() {
        let store = ProcessStore::new(100);
        let id = store.insert(record("echo hi"));
        let rec = store.lookup(&id).unwrap();
        assert_eq!(rec.command, "echo hi");
        assert_eq!(rec.status, ProcessStatus::Pending);
    }

    #[test]
    fn update_unknown_id_returns_false() {
        let store = ProcessStore::new(100);
        assert!(!store.update("nope", |r| r.status = ProcessStatus::Running));
    }

    #[test]
    fn update_bumps_updated_at() {
        let store = ProcessStore::new(100);
        let id = store.insert(record("sleep 1"));
        let before = store.lookup(&id).unwrap().updated_at;
        std::thread::sleep(std::time::Duration::from_millis(5));
        store.update(&id, |r| r.status = ProcessStatus::Running);
        assert!(store.lookup(&id).unwrap().updated_at > before);
    }

    #[test]
    fn status_counts_by_state() {
        let store = ProcessStore::new(100);
        let a = store.insert(record("a"));
        let _b = store.insert(record("b"));
        store.update(&a, |r| r.status = ProcessStatus::Running);
        let s = store.status();
        assert_eq!(s.total, 2);
        assert_eq!(s.running, 1);
        assert_eq!(s.pending, 1);
    }

    #[test]
    fn clear_removes_everything() {
        let store = ProcessStore::new(100);
        store.insert(record("a"));
        store.insert(record("b"));
        store.clear();
        assert!(store.is_empty());
    }

    // ── Cleanup policy ────────────────────────────────────────────────────────

    #[test]
    fn cleanup_never_evicts_running_or_pending() {
        let store = ProcessStore::new(100);
        let a = store.insert(record("a"));
        let _b = store.insert(record("b"));
        store.update(&a, |r| r.status = ProcessStatus::Running);
        // Backdate both records far past any TTL.  update() bumps
        // updated_at, so write through the table directly.
        for mut rec in store.records.iter_mut() {
            rec.updated_at = Utc::now() - Duration::days(365);
        }
        let evicted = store.cleanup(0);
        assert_eq!(evicted, 0);
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn cleanup_evicts_old_terminal_records() {
        let store = ProcessStore::new(100);
        let id = store.insert(record("done"));
        store.update(&id, |r| {
            r.status = ProcessStatus::Completed;
            r.completed_at = Some(Utc::now() - Duration::hours(2));
        });
        // The update bumped updated_at to now; eviction clock is the max of
        // both, so a fresh update keeps the record alive under a 1h TTL.
        assert_eq!(store.cleanup(3600), 0);

        // Backdate the whole record below the cutoff.
        {
            let mut rec = store.records.get_mut(&id).unwrap();
            rec.updated_at = Utc::now() - Duration::hours(2);
        }
        assert_eq!(store.cleanup(3600), 1);
        assert!(store.lookup(&id).is_none());
    }

    #[test]
    fn cleanup_returns_zero_on_empty_store() {
        let store = ProcessStore::new(100);
        assert_eq!(store.cleanup(60), 0);
    }

    // ── Log buffer ────────────────────────────────────────────────────────────

    #[test]
    fn log_count_reflects_cap_after_flush() {
        let store = ProcessStore::new(10);
        let id = store.insert(record("chatty"));
        store.append_log(&id, (0..50).map(|i| format!("line {i}")));
        let rec = store.lookup(&id).unwrap();
        assert_eq!(rec.log_count, 10);
        assert_eq!(rec.log_buffer.len(), 10);
        // Oldest lines were dropped from the head.
        assert_eq!(rec.log_buffer.front().unwrap(), "line 40");
        assert_eq!(rec.log_buffer.back().unwrap(), "line 49");
    }

    #[test]
    fn buffer_transient_overflow_is_bounded_by_one_batch() {
        let store = ProcessStore::new(10);
        let id = store.insert(record("chatty"));
        for i in 0..200 {
            store.append_log(&id, [format!("line {i}")]);
            let raw = store.records.get(&id).unwrap().log_buffer.len();
            assert!(raw < 10 + TRIM_BATCH, "buffer grew unbounded: {raw}");
        }
    }

    #[test]
    fn append_log_to_unknown_id_returns_false() {
        let store = ProcessStore::new(10);
        assert!(!store.append_log("nope", [String::from("x")]));
    }

    // ── Crash safety ──────────────────────────────────────────────────────────

    #[test]
    fn snapshot_survives_restart() {
        let dir = tempfile::tempdir().unwrap();
        let id = {
            let store = ProcessStore::with_snapshot(dir.path(), 100).unwrap();
            let id = store.insert(record("persisted"));
            store.update(&id, |r| {
                r.status = ProcessStatus::Completed;
                r.exit_code = Some(0);
            });
            id
        };
        let reloaded = ProcessStore::with_snapshot(dir.path(), 100).unwrap();
        let rec = reloaded.lookup(&id).unwrap();
        assert_eq!(rec.status, ProcessStatus::Completed);
        assert_eq!(rec.exit_code, Some(0));
    }

    #[test]
    fn reload_marks_dead_running_processes_as_lost() {
        let dir = tempfile::tempdir().unwrap();
        let id = {
            let store = ProcessStore::with_snapshot(dir.path(), 100).unwrap();
            let id = store.insert(record("vanished"));
            store.update(&id, |r| {
                r.status = ProcessStatus::Running;
                // A pid that cannot exist.
                r.os_pid = Some(u32::MAX - 1);
            });
            id
        };
        let reloaded = ProcessStore::with_snapshot(dir.path(), 100).unwrap();
        let rec = reloaded.lookup(&id).unwrap();
        assert_eq!(rec.status, ProcessStatus::Lost);
        assert!(rec.completed_at.is_some());
    }

    #[test]
    fn lost_records_are_cleanable() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = ProcessStore::with_snapshot(dir.path(), 100).unwrap();
            let id = store.insert(record("vanished"));
            store.update(&id, |r| {
                r.status = ProcessStatus::Running;
                r.os_pid = Some(u32::MAX - 1);
            });
        }
        let reloaded = ProcessStore::with_snapshot(dir.path(), 100).unwrap();
        // Backdate, then TTL-clean.
        for mut rec in reloaded.records.iter_mut() {
            rec.updated_at = Utc::now() - Duration::hours(1);
            rec.completed_at = Some(Utc::now() - Duration::hours(1));
        }
        assert_eq!(reloaded.cleanup(60), 1);
    }
}
