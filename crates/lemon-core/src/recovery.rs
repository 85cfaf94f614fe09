// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! Context-overflow recovery.
//!
//! When the model reports `context_length_exceeded`, the session gets one —
//! and only one — recovery attempt per overflow condition: compact the
//! conversation and re-drive the stream.  The attempt is tagged with a
//! signature of the session at the moment recovery begins; results carrying
//! any other signature are stale and silently dropped.

use lemon_model::{Entry, EntryBody, Message, Role};
use serde_json::json;

/// Snapshot of the session identity a recovery result must match.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecoverySignature {
    pub session_id: String,
    pub leaf_id: Option<String>,
    pub entry_count: usize,
    pub turn_index: u64,
    pub provider: String,
    pub model_id: String,
}

#[derive(Debug, Clone)]
pub enum RecoveryOutcome {
    /// Compaction produced a smaller entry list to resume with.
    Ok(Vec<Entry>),
    /// Compaction is impossible; the turn must surface the error.
    Error(String),
}

#[derive(Debug, Clone)]
pub struct RecoveryResult {
    pub signature: RecoverySignature,
    pub outcome: RecoveryOutcome,
}

/// What the session actor should do with a recovery result.
#[derive(Debug)]
pub enum RecoveryAction {
    /// Stale or unexpected result — drop it, flags unchanged.
    Ignore,
    /// Swap in the compacted entries and re-drive the model.
    Resume(Vec<Entry>),
    /// Clear flags, emit the terminal error, finalize the turn.
    Finalize(String),
}

/// Per-session recovery bookkeeping, held in the session state.
#[derive(Debug, Default, Clone)]
pub struct RecoveryState {
    pub in_progress: bool,
    pub attempted: bool,
    pub signature: Option<RecoverySignature>,
    pub error_reason: Option<String>,
    pub partial_state: Option<String>,
}

impl RecoveryState {
    /// Begin a recovery attempt for the given signature.
    pub fn begin(&mut self, signature: RecoverySignature, partial_state: Option<String>) {
        self.in_progress = true;
        self.attempted = true;
        self.signature = Some(signature);
        self.partial_state = partial_state;
        self.error_reason = None;
    }

    /// Apply one recovery task result.
    ///
    /// Results are accepted only while a recovery is in progress AND their
    /// signature matches the one captured at `begin`; everything else is
    /// ignored without touching any flags.
    pub fn handle_result(&mut self, result: RecoveryResult) -> RecoveryAction {
        if !self.in_progress {
            return RecoveryAction::Ignore;
        }
        match &self.signature {
            Some(sig) if *sig == result.signature => {}
            _ => return RecoveryAction::Ignore,
        }
        match result.outcome {
            RecoveryOutcome::Ok(entries) => {
                self.in_progress = false;
                RecoveryAction::Resume(entries)
            }
            RecoveryOutcome::Error(reason) => {
                self.error_reason = Some(reason.clone());
                self.reset();
                RecoveryAction::Finalize(reason)
            }
        }
    }

    /// Clear all recovery flags (turn finalization, or failed recovery).
    pub fn reset(&mut self) {
        self.in_progress = false;
        self.attempted = false;
        self.signature = None;
        self.partial_state = None;
    }
}

/// Deterministic compaction: keep the leading system message (when present)
/// and the most recent `keep_recent` entries, collapsing everything between
/// into a single system-event marker.
///
/// Fails with `cannot_compact` when there is nothing to drop — resuming with
/// an unchanged context would just overflow again.
pub fn compact_entries(entries: &[Entry], keep_recent: usize) -> Result<Vec<Entry>, String> {
    let system_prefix: Vec<Entry> = entries
        .iter()
        .take(1)
        .filter(|e| {
            matches!(
                &e.body,
                EntryBody::Message { message: Message { role: Role::System, .. } }
            )
        })
        .cloned()
        .collect();

    let body = &entries[system_prefix.len()..];
    if body.len() <= keep_recent {
        return Err("cannot_compact".to_string());
    }

    let dropped = body.len() - keep_recent;
    let mut compacted = system_prefix;
    compacted.push(Entry::system_event(
        "compaction",
        json!({ "dropped_entries": dropped }),
    ));
    compacted.extend(body[dropped..].iter().cloned());
    Ok(compacted)
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use lemon_model::Message;

    use super::*;

    fn sig(session: &str, turn: u64) -> RecoverySignature {
        RecoverySignature {
            session_id: session.to_string(),
            leaf_id: Some("leaf".to_string()),
            entry_count: 10,
            turn_index: turn,
            provider: "mock".to_string(),
            model_id: "mock-model".to_string(),
        }
    }

    // ── Single-retry bookkeeping (scenario S2 core) ───────────────────────────

    #[test]
    fn begin_marks_in_progress_and_attempted() {
        let mut state = RecoveryState::default();
        state.begin(sig("s", 1), Some("partial".into()));
        assert!(state.in_progress);
        assert!(state.attempted);
        assert_eq!(state.partial_state.as_deref(), Some("partial"));
    }

    #[test]
    fn stale_signature_results_are_silently_dropped() {
        let mut state = RecoveryState::default();
        state.begin(sig("s", 1), None);
        let action = state.handle_result(RecoveryResult {
            signature: sig("s", 99), // stale
            outcome: RecoveryOutcome::Error("cannot_compact".into()),
        });
        assert!(matches!(action, RecoveryAction::Ignore));
        // Flags unchanged.
        assert!(state.in_progress);
        assert!(state.attempted);
    }

    #[test]
    fn matching_error_outcome_clears_flags_and_finalizes() {
        let mut state = RecoveryState::default();
        state.begin(sig("s", 1), None);
        let action = state.handle_result(RecoveryResult {
            signature: sig("s", 1),
            outcome: RecoveryOutcome::Error("cannot_compact".into()),
        });
        match action {
            RecoveryAction::Finalize(reason) => assert_eq!(reason, "cannot_compact"),
            other => panic!("expected Finalize, got {other:?}"),
        }
        assert!(!state.in_progress);
        assert!(!state.attempted);
        assert_eq!(state.error_reason.as_deref(), Some("cannot_compact"));
    }

    #[test]
    fn matching_ok_outcome_resumes_and_keeps_attempted() {
        let mut state = RecoveryState::default();
        state.begin(sig("s", 1), None);
        let action = state.handle_result(RecoveryResult {
            signature: sig("s", 1),
            outcome: RecoveryOutcome::Ok(vec![Entry::message(Message::system("summary"))]),
        });
        assert!(matches!(action, RecoveryAction::Resume(_)));
        assert!(!state.in_progress);
        // A second overflow in the same turn must surface normally.
        assert!(state.attempted);
    }

    #[test]
    fn results_without_an_active_recovery_are_ignored() {
        let mut state = RecoveryState::default();
        let action = state.handle_result(RecoveryResult {
            signature: sig("s", 1),
            outcome: RecoveryOutcome::Ok(vec![]),
        });
        assert!(matches!(action, RecoveryAction::Ignore));
        assert!(!state.attempted);
    }

    // ── Compaction ────────────────────────────────────────────────────────────

    fn conversation(n: usize) -> Vec<Entry> {
        let mut entries = vec![Entry::message(Message::system("prompt"))];
        for i in 0..n {
            entries.push(Entry::message(Message::user(format!("msg {i}"))));
        }
        entries
    }

    #[test]
    fn compaction_keeps_system_and_recent_tail() {
        let entries = conversation(10);
        let compacted = compact_entries(&entries, 3).unwrap();
        // system + marker + 3 recent
        assert_eq!(compacted.len(), 5);
        match &compacted[0].body {
            EntryBody::Message { message } => assert_eq!(message.role, Role::System),
            other => panic!("expected system message first, got {other:?}"),
        }
        match &compacted[1].body {
            EntryBody::SystemEvent { name, data } => {
                assert_eq!(name, "compaction");
                assert_eq!(data["dropped_entries"], 7);
            }
            other => panic!("expected compaction marker, got {other:?}"),
        }
        match &compacted[4].body {
            EntryBody::Message { message } => assert_eq!(message.text(), "msg 9"),
            other => panic!("unexpected tail: {other:?}"),
        }
    }

    #[test]
    fn compaction_without_droppable_entries_fails() {
        let entries = conversation(2);
        let err = compact_entries(&entries, 5).unwrap_err();
        assert_eq!(err, "cannot_compact");
    }

    #[test]
    fn compaction_handles_missing_system_prefix() {
        let entries: Vec<Entry> = (0..6)
            .map(|i| Entry::message(Message::user(format!("m{i}"))))
            .collect();
        let compacted = compact_entries(&entries, 2).unwrap();
        // marker + 2 recent
        assert_eq!(compacted.len(), 3);
        assert!(matches!(
            &compacted[0].body,
            EntryBody::SystemEvent { .. }
        ));
    }
}
