// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;

/// Environment variable whose value unlocks the encrypted secret store.
pub const MASTER_KEY_ENV: &str = "LEMON_SECRETS_MASTER_KEY";

/// Where a resolved secret came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SecretSource {
    Store,
    Env,
}

impl SecretSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Store => "store",
            Self::Env => "env",
        }
    }
}

/// Name-keyed secret lookup boundary.
///
/// The encrypted on-disk store is an external collaborator; the runtime only
/// consumes this trait.  [`MemorySecretStore`] backs tests and single-process
/// deployments, [`EnvSecretStore`] maps names directly to environment
/// variables.
#[async_trait]
pub trait SecretStore: Send + Sync {
    async fn exists(&self, name: &str) -> bool;
    async fn resolve(&self, name: &str) -> Option<String>;
}

/// In-memory store gated by the master key.
///
/// A store constructed without the master key behaves as empty: every lookup
/// misses, which lets callers fall back to the environment without treating
/// a locked store as an error.
pub struct MemorySecretStore {
    unlocked: bool,
    entries: Mutex<HashMap<String, String>>,
}

impl MemorySecretStore {
    /// Open the store, unlocking it iff `master_key` matches the key the
    /// entries were sealed with.
    pub fn open(
        entries: HashMap<String, String>,
        sealed_with: &str,
        master_key: Option<&str>,
    ) -> Self {
        let unlocked = master_key == Some(sealed_with);
        Self {
            unlocked,
            entries: Mutex::new(entries),
        }
    }

    /// Open using the master key from [`MASTER_KEY_ENV`].
    pub fn open_from_env(entries: HashMap<String, String>, sealed_with: &str) -> Self {
        let key = std::env::var(MASTER_KEY_ENV).ok();
        Self::open(entries, sealed_with, key.as_deref())
    }

    /// An unlocked store seeded with `entries` — the common test constructor.
    pub fn unlocked(entries: HashMap<String, String>) -> Self {
        Self {
            unlocked: true,
            entries: Mutex::new(entries),
        }
    }

    /// An empty, locked store.
    pub fn locked() -> Self {
        Self {
            unlocked: false,
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn insert(&self, name: impl Into<String>, value: impl Into<String>) {
        self.entries
            .lock()
            .unwrap()
            .insert(name.into(), value.into());
    }
}

#[async_trait]
impl SecretStore for MemorySecretStore {
    async fn exists(&self, name: &str) -> bool {
        self.unlocked && self.entries.lock().unwrap().contains_key(name)
    }

    async fn resolve(&self, name: &str) -> Option<String> {
        if !self.unlocked {
            return None;
        }
        self.entries.lock().unwrap().get(name).cloned()
    }
}

/// Store that maps secret names directly to environment variables.
pub struct EnvSecretStore;

#[async_trait]
impl SecretStore for EnvSecretStore {
    async fn exists(&self, name: &str) -> bool {
        std::env::var(name).map(|v| !v.is_empty()).unwrap_or(false)
    }

    async fn resolve(&self, name: &str) -> Option<String> {
        std::env::var(name).ok().filter(|v| !v.is_empty())
    }
}

/// Resolve `name` from the store, falling back to the process environment
/// when the store misses.  Reports which source produced the value.
pub async fn resolve_secret(
    store: &dyn SecretStore,
    name: &str,
) -> Option<(String, SecretSource)> {
    if let Some(v) = store.resolve(name).await {
        return Some((v, SecretSource::Store));
    }
    std::env::var(name)
        .ok()
        .filter(|v| !v.is_empty())
        .map(|v| (v, SecretSource::Env))
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
