// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::path::PathBuf;
use std::sync::Arc;

use lemon_tools::Tool;

use crate::hooks::{HookFn, HookPriority};

/// A pre-compaction hook contributed by an extension.
pub struct ExtensionHook {
    pub priority: HookPriority,
    pub timeout_ms: u64,
    pub func: HookFn,
}

/// One loaded extension: tools appended to the session's registry and hooks
/// aggregated into its compaction-hook registry.
pub struct Extension {
    pub name: String,
    pub tools: Vec<Arc<dyn Tool>>,
    pub hooks: Vec<ExtensionHook>,
}

/// The extension-discovery boundary.
///
/// How extensions are found on disk (manifest format, skill layout) is an
/// external concern; the session only consumes this trait.  `load` is called
/// at session construction and again on `reload_extensions`.
pub trait ExtensionLoader: Send + Sync {
    fn load(&self, paths: &[PathBuf]) -> Vec<Extension>;
}

/// Loader for sessions without extensions.
pub struct NoExtensions;

impl ExtensionLoader for NoExtensions {
    fn load(&self, _paths: &[PathBuf]) -> Vec<Extension> {
        Vec::new()
    }
}

/// Static loader used by embedders (and tests) that construct their
/// extensions programmatically.
pub struct StaticExtensions {
    factory: Box<dyn Fn() -> Vec<Extension> + Send + Sync>,
}

impl StaticExtensions {
    pub fn new(factory: impl Fn() -> Vec<Extension> + Send + Sync + 'static) -> Self {
        Self {
            factory: Box::new(factory),
        }
    }
}

impl ExtensionLoader for StaticExtensions {
    fn load(&self, _paths: &[PathBuf]) -> Vec<Extension> {
        (self.factory)()
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
