// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::debug;

use lemon_model::Trust;

use crate::tool::{AbortSignal, Tool, ToolResult};

const MAX_BODY: usize = 200_000;

/// Fetch a URL and return its body as text.
///
/// Everything this tool returns is external content, so its results are
/// tagged untrusted and sentinel-wrapped before re-entering the
/// conversation.
pub struct WebFetchTool {
    pub timeout_secs: u64,
}

impl Default for WebFetchTool {
    fn default() -> Self {
        Self { timeout_secs: 20 }
    }
}

#[async_trait]
impl Tool for WebFetchTool {
    fn name(&self) -> &str {
        "web_fetch"
    }

    fn description(&self) -> &str {
        "Fetches a URL over HTTP(S) and returns the response body as text. \
         Bodies longer than 200,000 characters are truncated."
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "url": {
                    "type": "string",
                    "description": "The http(s) URL to fetch"
                }
            },
            "required": ["url"],
            "additionalProperties": false
        })
    }

    fn trust(&self) -> Trust {
        Trust::Untrusted
    }

    async fn execute(
        &self,
        _call_id: &str,
        params: Value,
        _cwd: &Path,
        signal: AbortSignal,
    ) -> ToolResult {
        let url = match params.get("url").and_then(Value::as_str) {
            Some(u) if u.starts_with("http://") || u.starts_with("https://") => u.to_string(),
            Some(u) => return ToolResult::err(format!("unsupported URL scheme: {u}")),
            None => return ToolResult::err("missing 'url' argument"),
        };

        debug!(%url, "web_fetch tool");

        let client = match reqwest::Client::builder()
            .timeout(Duration::from_secs(self.timeout_secs))
            .build()
        {
            Ok(c) => c,
            Err(e) => return ToolResult::err(format!("client error: {e}")),
        };

        let response = tokio::select! {
            biased;
            _ = signal.cancelled() => {
                return ToolResult::err("fetch aborted")
                    .with_detail("cancelled", json!(true));
            }
            r = client.get(&url).send() => r,
        };

        match response {
            Ok(resp) => {
                let status = resp.status().as_u16();
                let body = tokio::select! {
                    biased;
                    _ = signal.cancelled() => {
                        return ToolResult::err("fetch aborted")
                            .with_detail("cancelled", json!(true));
                    }
                    b = resp.text() => b.unwrap_or_default(),
                };
                let truncated = body.len() > MAX_BODY;
                let content: String = body.chars().take(MAX_BODY).collect();
                ToolResult::ok(content)
                    .untrusted()
                    .with_detail("status", json!(status))
                    .with_detail("url", json!(url))
                    .with_detail("truncated", json!(truncated))
            }
            Err(e) => ToolResult::err(format!("fetch failed: {e}")).untrusted(),
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[tokio::test]
    async fn missing_url_is_an_error() {
        let t = WebFetchTool::default();
        let out = t
            .execute("c", json!({}), Path::new("."), AbortSignal::new())
            .await;
        assert!(out.is_error);
        assert!(out.content.contains("missing 'url'"));
    }

    #[tokio::test]
    async fn non_http_scheme_is_rejected() {
        let t = WebFetchTool::default();
        let out = t
            .execute(
                "c",
                json!({"url": "file:///etc/passwd"}),
                Path::new("."),
                AbortSignal::new(),
            )
            .await;
        assert!(out.is_error);
        assert!(out.content.contains("unsupported URL scheme"));
    }

    #[test]
    fn declares_untrusted_output() {
        assert_eq!(WebFetchTool::default().trust(), Trust::Untrusted);
    }

    #[tokio::test]
    async fn aborted_fetch_reports_cancelled() {
        let t = WebFetchTool::default();
        let signal = AbortSignal::new();
        signal.abort();
        // Unroutable address; the abort must win before any timeout.
        let out = t
            .execute(
                "c",
                json!({"url": "http://192.0.2.1:9/"}),
                Path::new("."),
                signal,
            )
            .await;
        assert!(out.is_error);
        assert_eq!(out.details["cancelled"], true);
    }
}
