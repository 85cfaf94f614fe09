// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use serde::Serialize;

use crate::root::SessionSupervisor;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

impl HealthStatus {
    /// Sort weight: unhealthy sessions surface first.
    fn rank(&self) -> u8 {
        match self {
            Self::Unhealthy => 0,
            Self::Degraded => 1,
            Self::Healthy => 2,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionHealth {
    pub session_id: String,
    pub status: HealthStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OverallHealth {
    NoSessions,
    Healthy,
    Unhealthy,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthSummary {
    pub total: usize,
    pub healthy: usize,
    pub degraded: usize,
    pub unhealthy: usize,
    pub overall: OverallHealth,
}

impl SessionSupervisor {
    /// Per-session health, sorted so unhealthy sessions appear first.
    ///
    /// A session is unhealthy when its streaming-helper probe reports dead
    /// while the actor itself is still alive; it is degraded when its
    /// sandbox sidecar went away but the session keeps running without it.
    pub async fn health_all(&self) -> Vec<SessionHealth> {
        let mut report = Vec::new();
        for entry in self.roots.iter() {
            let root = entry.value();
            let Ok(session) = root.get_session() else {
                // Actor already dead: the watchdog is pruning this entry.
                continue;
            };
            let status = if !root.worker_alive() {
                HealthStatus::Unhealthy
            } else {
                match session.get_state().await {
                    Ok(state) if state.wasm_status.starts_with("unavailable") => {
                        HealthStatus::Degraded
                    }
                    Ok(_) => HealthStatus::Healthy,
                    // Actor died between the liveness check and the query.
                    Err(_) => continue,
                }
            };
            report.push(SessionHealth {
                session_id: root.session_id.clone(),
                status,
            });
        }
        report.sort_by(|a, b| {
            a.status
                .rank()
                .cmp(&b.status.rank())
                .then_with(|| a.session_id.cmp(&b.session_id))
        });
        report
    }

    /// Aggregate health: unhealthy wins, an empty fleet is `no_sessions`.
    pub async fn health_summary(&self) -> HealthSummary {
        let report = self.health_all().await;
        let total = report.len();
        let healthy = report
            .iter()
            .filter(|h| h.status == HealthStatus::Healthy)
            .count();
        let degraded = report
            .iter()
            .filter(|h| h.status == HealthStatus::Degraded)
            .count();
        let unhealthy = report
            .iter()
            .filter(|h| h.status == HealthStatus::Unhealthy)
            .count();
        let overall = if total == 0 {
            OverallHealth::NoSessions
        } else if unhealthy > 0 {
            OverallHealth::Unhealthy
        } else {
            OverallHealth::Healthy
        };
        HealthSummary {
            total,
            healthy,
            degraded,
            unhealthy,
            overall,
        }
    }
}
