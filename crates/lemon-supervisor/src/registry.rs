// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use dashmap::DashMap;
use tracing::debug;

use lemon_core::SessionHandle;

/// Global name → session map with unique keys.
///
/// Entries are monitored: each session root's watchdog removes its entry
/// when the owning actor dies, so a lookup never hands out a handle whose
/// actor is long gone (a short race window is inherent and tolerated — the
/// handle itself reports liveness).
pub struct SessionRegistry {
    entries: DashMap<String, SessionHandle>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
        }
    }

    /// Register a session under its id.  Fails when the key is taken.
    pub fn register(&self, handle: SessionHandle) -> anyhow::Result<()> {
        let id = handle.session_id.clone();
        match self.entries.entry(id.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                anyhow::bail!("session {id} is already registered")
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(handle);
                debug!(session_id = %id, "session registered");
                Ok(())
            }
        }
    }

    pub fn lookup(&self, session_id: &str) -> Option<SessionHandle> {
        self.entries.get(session_id).map(|e| e.value().clone())
    }

    pub fn remove(&self, session_id: &str) -> bool {
        let removed = self.entries.remove(session_id).is_some();
        if removed {
            debug!(session_id = %session_id, "session unregistered");
        }
        removed
    }

    pub fn list(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.entries.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}
