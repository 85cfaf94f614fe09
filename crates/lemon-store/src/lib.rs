// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
mod process;
mod snapshot;
mod task;

pub use process::{ProcessRecord, ProcessStatus, ProcessStore, ProcessStoreStatus};
pub use snapshot::Snapshot;
pub use task::{TaskEvent, TaskRecord, TaskStatus, TaskStore};

use rand::RngCore;

/// Generate a collision-free 128-bit identifier as lowercase hex.
///
/// Used for process and task IDs; randomness (not a counter) so concurrent
/// creators never collide.
pub fn new_store_id() -> String {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;

    #[test]
    fn store_ids_are_32_hex_chars() {
        let id = new_store_id();
        assert_eq!(id.len(), 32);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[tokio::test]
    async fn one_hundred_concurrent_creators_produce_unique_ids() {
        let mut handles = Vec::new();
        for _ in 0..100 {
            handles.push(tokio::spawn(async { new_store_id() }));
        }
        let mut seen = HashSet::new();
        for h in handles {
            assert!(seen.insert(h.await.unwrap()));
        }
        assert_eq!(seen.len(), 100);
    }
}
