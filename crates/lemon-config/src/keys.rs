// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! Per-turn, per-provider API-key resolution.
//!
//! Resolution order (first non-empty value wins):
//!
//! 1. the environment variable(s) mapped for the provider,
//! 2. the plain `providers.<name>.api_key` setting,
//! 3. the `providers.<name>.api_key_secret` entry in the secret store,
//! 4. the provider's default secret-store key.
//!
//! Store lookups are filtered by the provider's effective auth source:
//! OAuth providers only accept recognised OAuth payloads (and return the
//! extracted access token); API-key providers skip OAuth payloads entirely.
//! Providers that require an explicit `auth_source` resolve to nothing when
//! the setting is absent, regardless of other sources.

use serde_json::Value;

use crate::schema::{AuthSource, Settings};
use crate::secrets::SecretStore;

/// Static per-provider resolution rules.
#[derive(Debug, Clone, Copy)]
pub struct ProviderRule {
    pub provider: &'static str,
    pub env_vars: &'static [&'static str],
    /// Store key consulted when no explicit `api_key_secret` is configured.
    pub default_secret: &'static str,
    pub default_auth: Option<AuthSource>,
    /// When true, resolution yields nothing unless settings name an
    /// `auth_source` explicitly.
    pub requires_explicit_auth: bool,
}

const RULES: &[ProviderRule] = &[
    ProviderRule {
        provider: "openai",
        env_vars: &["OPENAI_API_KEY"],
        default_secret: "openai_api_key",
        default_auth: Some(AuthSource::ApiKey),
        requires_explicit_auth: false,
    },
    ProviderRule {
        provider: "anthropic",
        env_vars: &["ANTHROPIC_API_KEY"],
        default_secret: "anthropic_api_key",
        default_auth: Some(AuthSource::ApiKey),
        requires_explicit_auth: false,
    },
    ProviderRule {
        provider: "github_copilot",
        env_vars: &["GITHUB_COPILOT_API_KEY"],
        default_secret: "github_copilot_oauth",
        default_auth: Some(AuthSource::Oauth),
        requires_explicit_auth: false,
    },
    // The Codex variant is OAuth-only and must be opted into explicitly.
    ProviderRule {
        provider: "openai_codex",
        env_vars: &["OPENAI_CODEX_API_KEY"],
        default_secret: "openai_codex_oauth",
        default_auth: None,
        requires_explicit_auth: true,
    },
    ProviderRule {
        provider: "opencode",
        env_vars: &["OPENCODE_API_KEY"],
        default_secret: "opencode_api_key",
        default_auth: Some(AuthSource::ApiKey),
        requires_explicit_auth: false,
    },
    ProviderRule {
        provider: "google",
        env_vars: &["GEMINI_API_KEY", "GOOGLE_API_KEY"],
        default_secret: "google_oauth",
        default_auth: Some(AuthSource::Oauth),
        requires_explicit_auth: false,
    },
];

/// Look up the static rule for `provider`, synthesising a generic
/// `<NAME>_API_KEY` rule for providers not in the table.
pub fn provider_rule(provider: &str) -> ProviderRule {
    RULES
        .iter()
        .find(|r| r.provider == provider)
        .copied()
        .unwrap_or(ProviderRule {
            provider: "",
            env_vars: &[],
            default_secret: "",
            default_auth: Some(AuthSource::ApiKey),
            requires_explicit_auth: false,
        })
}

/// Resolve the API key for `provider` using the real process environment.
pub async fn resolve_api_key(
    provider: &str,
    settings: &Settings,
    store: &dyn SecretStore,
) -> Option<String> {
    resolve_api_key_with_env(provider, settings, store, |var| {
        std::env::var(var).ok()
    })
    .await
}

/// Resolve the API key for `provider` with an injected environment lookup.
pub async fn resolve_api_key_with_env<F>(
    provider: &str,
    settings: &Settings,
    store: &dyn SecretStore,
    env: F,
) -> Option<String>
where
    F: Fn(&str) -> Option<String>,
{
    let rule = provider_rule(provider);
    let provider_settings = settings.providers.get(provider);

    let explicit_auth = provider_settings.and_then(|p| p.auth_source);
    if rule.requires_explicit_auth && explicit_auth.is_none() {
        return None;
    }
    let auth = explicit_auth
        .or(rule.default_auth)
        .unwrap_or(AuthSource::ApiKey);

    // 1. Environment — the table's vars, then the generic <NAME>_API_KEY.
    for var in rule.env_vars {
        if let Some(v) = env(var).filter(|v| !v.is_empty()) {
            return Some(v);
        }
    }
    if rule.env_vars.is_empty() {
        let generic = format!("{}_API_KEY", provider.to_uppercase());
        if let Some(v) = env(&generic).filter(|v| !v.is_empty()) {
            return Some(v);
        }
    }

    // 2. Plain api_key setting.
    if let Some(v) = provider_settings
        .and_then(|p| p.api_key.clone())
        .filter(|v| !v.is_empty())
    {
        return Some(v);
    }

    // 3. Explicit api_key_secret in the store.
    if let Some(name) = provider_settings.and_then(|p| p.api_key_secret.as_deref()) {
        if let Some(raw) = store.resolve(name).await.filter(|v| !v.is_empty()) {
            return filter_store_value(raw, auth);
        }
    }

    // 4. Provider-default store key.
    if !rule.default_secret.is_empty() {
        if let Some(raw) = store
            .resolve(rule.default_secret)
            .await
            .filter(|v| !v.is_empty())
        {
            return filter_store_value(raw, auth);
        }
    }

    None
}

/// Apply the auth-source filter to a raw store value.
///
/// For OAuth providers an unrecognised payload resolves to nothing — an
/// explicitly configured secret that turns out not to be an OAuth payload is
/// a misconfiguration, not a plain key.  For API-key providers an OAuth
/// payload is skipped so resolution can continue (explicit secrets fall
/// through to the default key; the default key is the end of the chain).
fn filter_store_value(raw: String, auth: AuthSource) -> Option<String> {
    match auth {
        AuthSource::Oauth => parse_oauth_payload(&raw),
        AuthSource::ApiKey => {
            if is_oauth_payload(&raw) {
                None
            } else {
                Some(raw)
            }
        }
    }
}

/// True when `raw` is a JSON object carrying a `type` field — the marker the
/// secret store uses for OAuth payloads.
fn is_oauth_payload(raw: &str) -> bool {
    serde_json::from_str::<Value>(raw)
        .ok()
        .map(|v| v.get("type").and_then(Value::as_str).is_some())
        .unwrap_or(false)
}

/// Extract the usable credential from a recognised OAuth payload.
///
/// - `{"type":"oauth","access_token":...}` → the access token.
/// - `{"type":"oauth_project","access_token":...,"project_id":...}` → a
///   composed `{"token":...,"projectId":...}` JSON string for providers that
///   need both pieces on the wire.
///
/// Anything else — including JSON with an unknown `type` — yields `None`.
fn parse_oauth_payload(raw: &str) -> Option<String> {
    let v: Value = serde_json::from_str(raw).ok()?;
    match v.get("type")?.as_str()? {
        "oauth" => v
            .get("access_token")
            .and_then(Value::as_str)
            .map(str::to_string),
        "oauth_project" => {
            let token = v
                .get("access_token")
                .or_else(|| v.get("token"))?
                .as_str()?;
            let project = v
                .get("project_id")
                .or_else(|| v.get("projectId"))?
                .as_str()?;
            Some(
                serde_json::json!({ "token": token, "projectId": project }).to_string(),
            )
        }
        _ => None,
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
