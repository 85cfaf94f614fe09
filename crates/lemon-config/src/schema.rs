// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::collections::HashMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Serde default helper — returns `true`.
///
/// Used for config fields that should be enabled unless the user explicitly
/// sets them to `false`.  `#[serde(default)]` on a `bool` always falls back
/// to `bool::default()` (i.e. `false`), so a named function is required.
fn default_true() -> bool {
    true
}

fn default_reserve_tokens() -> usize {
    2048
}

fn default_memory_limit() -> u64 {
    64 * 1024 * 1024
}

fn default_timeout_ms() -> u64 {
    30_000
}

fn default_fuel_limit() -> u64 {
    1_000_000_000
}

fn default_invoke_depth() -> u32 {
    4
}

/// Top-level settings surface consumed by the session runtime.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Settings {
    /// Default extended-thinking level forwarded to the stream function.
    #[serde(default)]
    pub default_thinking_level: Option<String>,
    /// Named provider credentials.
    ///
    /// ```yaml
    /// providers:
    ///   anthropic:
    ///     api_key_secret: anthropic_api_key
    ///   github_copilot:
    ///     auth_source: oauth
    /// ```
    #[serde(default)]
    pub providers: HashMap<String, ProviderSettings>,
    #[serde(default)]
    pub tools: ToolsSettings,
    /// Directories searched for extension manifests (tools + hooks).
    #[serde(default)]
    pub extension_paths: Vec<PathBuf>,
    #[serde(default)]
    pub compaction: CompactionSettings,
    #[serde(default)]
    pub stores: StoreSettings,
}

/// Where a provider's credential comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthSource {
    ApiKey,
    Oauth,
}

/// Per-provider credential configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProviderSettings {
    /// Explicit API key; prefer secret indirection in version-controlled files.
    #[serde(default)]
    pub api_key: Option<String>,
    /// Name of a secret-store entry holding the key (or OAuth payload).
    #[serde(default)]
    pub api_key_secret: Option<String>,
    #[serde(default)]
    pub auth_source: Option<AuthSource>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ToolsSettings {
    #[serde(default)]
    pub wasm: WasmSettings,
}

/// Sandboxed (wasm sidecar) tool configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WasmSettings {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Accepted for compatibility; the runtime assumes artifacts are
    /// pre-built and never invokes a builder itself.
    #[serde(default)]
    pub auto_build: bool,
    /// Path to the sandbox runtime binary.
    #[serde(default)]
    pub runtime_path: Option<PathBuf>,
    /// Explicit tool artifacts to load.
    #[serde(default)]
    pub tool_paths: Vec<PathBuf>,
    /// Directories scanned for tool artifacts.
    #[serde(default)]
    pub discover_paths: Vec<PathBuf>,
    /// Per-invocation memory ceiling in bytes.
    #[serde(default = "default_memory_limit")]
    pub default_memory_limit: u64,
    /// Per-invocation wall-clock ceiling.
    #[serde(default = "default_timeout_ms")]
    pub default_timeout_ms: u64,
    /// Per-invocation fuel (instruction) ceiling.
    #[serde(default = "default_fuel_limit")]
    pub default_fuel_limit: u64,
    #[serde(default = "default_true")]
    pub cache_compiled: bool,
    #[serde(default)]
    pub cache_dir: Option<PathBuf>,
    /// Maximum host-callback re-entry depth for a single invoke.
    #[serde(default = "default_invoke_depth")]
    pub max_tool_invoke_depth: u32,
}

impl Default for WasmSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            auto_build: false,
            runtime_path: None,
            tool_paths: Vec::new(),
            discover_paths: Vec::new(),
            default_memory_limit: default_memory_limit(),
            default_timeout_ms: default_timeout_ms(),
            default_fuel_limit: default_fuel_limit(),
            cache_compiled: true,
            cache_dir: None,
            max_tool_invoke_depth: default_invoke_depth(),
        }
    }
}

/// Context-window compaction gate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompactionSettings {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Headroom kept free below the hard window so the compaction call itself
    /// still fits.
    #[serde(default = "default_reserve_tokens")]
    pub reserve_tokens: usize,
}

impl Default for CompactionSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            reserve_tokens: default_reserve_tokens(),
        }
    }
}

/// Where the process/task store snapshots live.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoreSettings {
    /// Snapshot directory; defaults to `~/.local/state/lemon` when unset.
    #[serde(default)]
    pub state_dir: Option<PathBuf>,
}

impl StoreSettings {
    pub fn resolved_state_dir(&self) -> PathBuf {
        self.state_dir.clone().unwrap_or_else(|| {
            dirs::state_dir()
                .or_else(dirs::data_local_dir)
                .unwrap_or_else(|| PathBuf::from("."))
                .join("lemon")
        })
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
