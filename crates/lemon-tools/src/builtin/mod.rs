// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
mod bash;
mod web_fetch;

pub use bash::BashTool;
pub use web_fetch::WebFetchTool;

use std::sync::Arc;

use crate::tool::Tool;

/// The default built-in tool set for a new session.
///
/// A caller-provided custom tool list replaces these; extension and sidecar
/// tools are appended either way.
pub fn default_tools(store: Option<Arc<lemon_store::ProcessStore>>) -> Vec<Arc<dyn Tool>> {
    vec![
        Arc::new(BashTool {
            timeout_secs: 30,
            store,
        }),
        Arc::new(WebFetchTool::default()),
    ]
}
