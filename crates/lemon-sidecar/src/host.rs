// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};

use lemon_config::{resolve_secret, SecretStore};

/// Prefix of tool names routable only via the sandbox host-callback channel.
/// These never appear in `discover` output and can never be invoked from the
/// model side.
pub const RESERVED_PREFIX: &str = "__lemon.";

pub const SECRET_EXISTS_TOOL: &str = "__lemon.secret.exists";
pub const SECRET_RESOLVE_TOOL: &str = "__lemon.secret.resolve";

/// Handles `host_call` events from the sandbox: reserved tools and any
/// host-side tools the embedder chooses to expose.
#[async_trait]
pub trait HostCallHandler: Send + Sync {
    /// Run `tool` with `params`; `Err` becomes the callback's error field.
    async fn handle(&self, tool: &str, params: Value) -> Result<Value, String>;
}

/// Handler that rejects every host call.  Used when the embedder exposes no
/// host-side tools.
pub struct DenyAllHostHandler;

#[async_trait]
impl HostCallHandler for DenyAllHostHandler {
    async fn handle(&self, tool: &str, _params: Value) -> Result<Value, String> {
        Err(format!("unknown host tool: {tool}"))
    }
}

/// Routes the reserved `__lemon.secret.*` tools to the secret store and
/// delegates everything else to an optional fallback handler.
pub struct SecretHostRouter {
    store: Arc<dyn SecretStore>,
    fallback: Option<Arc<dyn HostCallHandler>>,
}

impl SecretHostRouter {
    pub fn new(store: Arc<dyn SecretStore>) -> Self {
        Self {
            store,
            fallback: None,
        }
    }

    pub fn with_fallback(mut self, fallback: Arc<dyn HostCallHandler>) -> Self {
        self.fallback = Some(fallback);
        self
    }
}

#[async_trait]
impl HostCallHandler for SecretHostRouter {
    async fn handle(&self, tool: &str, params: Value) -> Result<Value, String> {
        match tool {
            SECRET_EXISTS_TOOL => {
                let name = require_name(&params)?;
                // exists consults only the encrypted store; resolve is the
                // one with the env fallback.
                Ok(json!({ "exists": self.store.exists(name).await }))
            }
            SECRET_RESOLVE_TOOL => {
                let name = require_name(&params)?;
                match resolve_secret(self.store.as_ref(), name).await {
                    Some((value, source)) => {
                        Ok(json!({ "value": value, "source": source.as_str() }))
                    }
                    None => Err(format!("secret not found: {name}")),
                }
            }
            other => match &self.fallback {
                Some(f) => f.handle(other, params).await,
                None => Err(format!("unknown host tool: {other}")),
            },
        }
    }
}

fn require_name(params: &Value) -> Result<&str, String> {
    params
        .get("name")
        .and_then(Value::as_str)
        .filter(|n| !n.is_empty())
        .ok_or_else(|| "missing 'name'".to_string())
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
