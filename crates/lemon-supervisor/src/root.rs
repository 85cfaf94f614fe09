// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! Per-session supervision and the top-level session supervisor.
//!
//! Each session gets a root supervising two children: the session actor
//! (always) and an optional subagent coordinator.  The strategy is
//! rest-for-one — when the actor dies its coordinator is torn down with it,
//! while a coordinator failure leaves the actor untouched — and the restart
//! policy is temporary: nothing is ever restarted; death surfaces to the
//! caller via the registry and health reports.

use std::sync::Arc;

use tracing::{debug, info};

use lemon_core::{Coordinator, SessionActor, SessionHandle, SessionOptions};

use crate::registry::SessionRegistry;

/// Liveness probe for a session's streaming helper (worker).  Returning
/// `false` while the actor is alive marks the session unhealthy.
pub type WorkerProbe = Arc<dyn Fn() -> bool + Send + Sync>;

/// The per-session root: holds the actor handle and the optional
/// coordinator, plus the worker probe health reporting consults.
pub struct SessionRoot {
    pub session_id: String,
    session: SessionHandle,
    coordinator: Option<Arc<Coordinator>>,
    worker_probe: WorkerProbe,
}

impl SessionRoot {
    /// The actor child, when still alive.
    pub fn get_session(&self) -> anyhow::Result<SessionHandle> {
        if self.session.is_alive() {
            Ok(self.session.clone())
        } else {
            anyhow::bail!("session {} is down", self.session_id)
        }
    }

    /// The coordinator child, when configured and the actor is alive
    /// (rest-for-one: a dead actor implies a torn-down coordinator).
    pub fn get_coordinator(&self) -> anyhow::Result<Arc<Coordinator>> {
        if !self.session.is_alive() {
            anyhow::bail!("session {} is down", self.session_id)
        }
        self.coordinator
            .clone()
            .ok_or_else(|| anyhow::anyhow!("session {} has no coordinator", self.session_id))
    }

    /// Child names with their current liveness.
    pub fn list_children(&self) -> Vec<(&'static str, bool)> {
        let actor_alive = self.session.is_alive();
        let mut children = vec![("session", actor_alive)];
        if self.coordinator.is_some() {
            // Rest-for-one: the coordinator only counts as up while the
            // actor is.
            children.push(("coordinator", actor_alive));
        }
        children
    }

    pub fn worker_alive(&self) -> bool {
        (self.worker_probe)()
    }
}

/// Top-level supervisor: starts sessions unlinked from the caller and keeps
/// the global registry current.
pub struct SessionSupervisor {
    pub(crate) registry: Arc<SessionRegistry>,
    /// Session roots for health reporting; pruned with the registry.
    pub(crate) roots: Arc<dashmap::DashMap<String, Arc<SessionRoot>>>,
}

impl SessionSupervisor {
    pub fn new() -> Self {
        Self {
            registry: Arc::new(SessionRegistry::new()),
            roots: Arc::new(dashmap::DashMap::new()),
        }
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    /// Start a session under supervision.
    pub fn start_session(
        &self,
        opts: SessionOptions,
        coordinator: Option<Arc<Coordinator>>,
    ) -> anyhow::Result<Arc<SessionRoot>> {
        self.start_session_with_probe(opts, coordinator, Arc::new(|| true))
    }

    /// Start a session with an explicit worker probe for health reporting.
    pub fn start_session_with_probe(
        &self,
        opts: SessionOptions,
        coordinator: Option<Arc<Coordinator>>,
        worker_probe: WorkerProbe,
    ) -> anyhow::Result<Arc<SessionRoot>> {
        // The actor runs on its own task: a caller crash never cascades
        // into the session.
        let (handle, join) = SessionActor::spawn(opts);
        let session_id = handle.session_id.clone();

        if let Err(e) = self.registry.register(handle.clone()) {
            // The key was taken; stop the just-spawned orphan actor.
            let orphan = handle.clone();
            tokio::spawn(async move {
                let _ = orphan.stop().await;
            });
            return Err(e);
        }

        let root = Arc::new(SessionRoot {
            session_id: session_id.clone(),
            session: handle,
            coordinator: coordinator.clone(),
            worker_probe,
        });
        self.roots.insert(session_id.clone(), Arc::clone(&root));

        // Watchdog: on actor death, tear down the coordinator (rest-for-one)
        // and prune the registry entry.  Temporary policy — no restart.
        let registry = Arc::clone(&self.registry);
        let roots = Arc::clone(&self.roots);
        tokio::spawn(async move {
            let outcome = join.await;
            if let Err(e) = outcome {
                debug!(session_id = %session_id, "session actor died abnormally: {e}");
            }
            if let Some(coordinator) = coordinator {
                let aborted = coordinator.abort_all();
                if !aborted.is_empty() {
                    debug!(
                        session_id = %session_id,
                        count = aborted.len(),
                        "tore down coordinator runs with the session"
                    );
                }
            }
            registry.remove(&session_id);
            roots.remove(&session_id);
            info!(session_id = %session_id, "session supervision ended");
        });

        Ok(root)
    }

    /// Gracefully stop a session by id.  Returns false for unknown ids.
    pub async fn stop_session(&self, session_id: &str) -> bool {
        match self.registry.lookup(session_id) {
            Some(handle) => {
                let _ = handle.stop().await;
                true
            }
            None => false,
        }
    }
}

impl Default for SessionSupervisor {
    fn default() -> Self {
        Self::new()
    }
}
