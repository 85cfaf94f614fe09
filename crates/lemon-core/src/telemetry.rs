// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use tokio::sync::broadcast;
use tracing::warn;

/// Counters and incidents the runtime reports to observers.
#[derive(Debug, Clone)]
pub enum TelemetryEvent {
    /// `session.overflow_recovery.failure`
    OverflowRecoveryFailure {
        count: u32,
        session_id: String,
        reason: String,
    },
}

/// Broadcast sink for telemetry events.  Emission never blocks and never
/// fails; with no subscribers events are dropped after being logged.
pub struct Telemetry {
    tx: broadcast::Sender<TelemetryEvent>,
}

impl Telemetry {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(256);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TelemetryEvent> {
        self.tx.subscribe()
    }

    pub fn emit(&self, event: TelemetryEvent) {
        match &event {
            TelemetryEvent::OverflowRecoveryFailure {
                session_id, reason, ..
            } => {
                warn!(%session_id, %reason, "session.overflow_recovery.failure");
            }
        }
        let _ = self.tx.send(event);
    }
}

impl Default for Telemetry {
    fn default() -> Self {
        Self::new()
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscribers_receive_emitted_events() {
        let t = Telemetry::new();
        let mut rx = t.subscribe();
        t.emit(TelemetryEvent::OverflowRecoveryFailure {
            count: 1,
            session_id: "s1".into(),
            reason: "cannot_compact".into(),
        });
        let ev = rx.recv().await.unwrap();
        match ev {
            TelemetryEvent::OverflowRecoveryFailure { count, reason, .. } => {
                assert_eq!(count, 1);
                assert_eq!(reason, "cannot_compact");
            }
        }
    }

    #[test]
    fn emit_without_subscribers_does_not_panic() {
        let t = Telemetry::new();
        t.emit(TelemetryEvent::OverflowRecoveryFailure {
            count: 1,
            session_id: "s".into(),
            reason: "r".into(),
        });
    }
}
