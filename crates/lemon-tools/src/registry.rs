// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use serde_json::Value;

use lemon_model::ToolSchema;

use crate::tool::{AbortSignal, Tool, ToolResult};

/// Central registry holding the tools a session can dispatch.
///
/// Built from three sources: built-in defaults (or a caller-provided custom
/// list that replaces them), extension tools, and sidecar tools.  Extension
/// and sidecar tools are appended regardless of which base list is in use.
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self {
            tools: HashMap::new(),
        }
    }

    /// Compose a registry from a base list and appended extension tools.
    pub fn compose(
        base: Vec<Arc<dyn Tool>>,
        extensions: Vec<Arc<dyn Tool>>,
    ) -> Self {
        let mut reg = Self::new();
        for tool in base.into_iter().chain(extensions) {
            reg.register_arc(tool);
        }
        reg
    }

    pub fn register(&mut self, tool: impl Tool + 'static) {
        self.register_arc(Arc::new(tool));
    }

    pub fn register_arc(&mut self, tool: Arc<dyn Tool>) {
        self.tools.insert(tool.name().to_string(), tool);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    /// Schemas for all registered tools, sorted by name for stable prompts.
    pub fn schemas(&self) -> Vec<ToolSchema> {
        let mut schemas: Vec<ToolSchema> = self
            .tools
            .values()
            .map(|t| ToolSchema {
                name: t.name().to_string(),
                description: t.description().to_string(),
                parameters: t.parameters(),
            })
            .collect();
        schemas.sort_by(|a, b| a.name.cmp(&b.name));
        schemas
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tools.keys().cloned().collect();
        names.sort();
        names
    }

    pub async fn execute(
        &self,
        call_id: &str,
        name: &str,
        params: Value,
        cwd: &Path,
        signal: AbortSignal,
    ) -> ToolResult {
        match self.tools.get(name) {
            Some(tool) => tool.execute(call_id, params, cwd, signal).await,
            None => ToolResult::err(format!("unknown tool: {name}")),
        }
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
