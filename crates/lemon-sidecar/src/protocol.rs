// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! Wire frames for the sandbox sidecar protocol.
//!
//! Every frame is one JSON object per line over the runtime's stdin/stdout.
//! Host → sidecar frames carry a correlation `id`; the sidecar answers each
//! with exactly one `response` frame echoing that id.  The only frame the
//! sidecar originates is `event` (host-callback requests), which correlates
//! back to the outer `invoke` via `request_id`.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Sandboxed tool capabilities.
///
/// `http`, `tool_invoke` and `secrets` require per-session approval before
/// first use unless an allow-policy grants them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    WorkspaceRead,
    Http,
    ToolInvoke,
    Secrets,
}

impl Capability {
    pub fn requires_approval(&self) -> bool {
        matches!(self, Self::Http | Self::ToolInvoke | Self::Secrets)
    }
}

/// One sandboxed tool as reported by `discover`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDescriptor {
    pub name: String,
    #[serde(default)]
    pub path: Option<String>,
    #[serde(default)]
    pub description: String,
    /// JSON Schema of the tool's parameters.
    #[serde(default)]
    pub schema: Value,
    #[serde(default)]
    pub capabilities: Vec<Capability>,
    #[serde(default)]
    pub warnings: Vec<String>,
}

impl ToolDescriptor {
    /// True when any declared capability needs the approval gate.
    pub fn needs_approval(&self) -> bool {
        self.capabilities.iter().any(Capability::requires_approval)
    }
}

/// Frames the host writes to the sidecar's stdin.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutFrame {
    Hello {
        id: String,
    },
    Discover {
        id: String,
    },
    Invoke {
        id: String,
        tool: String,
        params_json: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        call_ctx: Option<Value>,
    },
    HostCallResult {
        id: String,
        call_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        output_json: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    Shutdown {
        id: String,
    },
}

impl OutFrame {
    pub fn id(&self) -> &str {
        match self {
            Self::Hello { id }
            | Self::Discover { id }
            | Self::Invoke { id, .. }
            | Self::HostCallResult { id, .. }
            | Self::Shutdown { id } => id,
        }
    }
}

/// Frames the sidecar writes to its stdout.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InFrame {
    Response(ResponseFrame),
    Event(EventFrame),
}

/// A correlated response.  The body is kept as a raw map because its shape
/// depends on the request the id belongs to; typed views are extracted with
/// [`ResponseFrame::parse`].
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ResponseFrame {
    pub id: String,
    #[serde(flatten)]
    pub body: Map<String, Value>,
}

impl ResponseFrame {
    pub fn parse<T: serde::de::DeserializeOwned>(&self) -> anyhow::Result<T> {
        Ok(serde_json::from_value(Value::Object(self.body.clone()))?)
    }

    /// The `error` field, when present and non-null.
    pub fn error(&self) -> Option<&str> {
        self.body.get("error").and_then(Value::as_str)
    }
}

/// A sidecar-originated event.  `host_call` is the only event in use: the
/// sandbox asks the host to run a reserved or host-side tool mid-invoke.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct EventFrame {
    pub event: String,
    /// The outer `invoke` this callback belongs to.
    pub request_id: String,
    pub call_id: String,
    #[serde(default)]
    pub tool: String,
    #[serde(default)]
    pub params_json: String,
}

// ── Typed response bodies ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct HelloResponse {
    pub version: String,
    #[serde(default)]
    pub name: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct DiscoverResponse {
    #[serde(default)]
    pub tools: Vec<ToolDescriptor>,
    #[serde(default)]
    pub warnings: Vec<String>,
    #[serde(default)]
    pub errors: Vec<String>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct InvokeResponse {
    #[serde(default)]
    pub output_json: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub logs: Vec<String>,
    #[serde(default)]
    pub details: Map<String, Value>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AcceptedResponse {
    pub accepted: bool,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StoppedResponse {
    pub stopped: bool,
}

/// Per-invocation resource limits forwarded in `call_ctx`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvokeLimits {
    pub memory_limit: u64,
    pub timeout_ms: u64,
    pub fuel_limit: u64,
    pub max_tool_invoke_depth: u32,
}

impl From<&lemon_config::WasmSettings> for InvokeLimits {
    fn from(w: &lemon_config::WasmSettings) -> Self {
        Self {
            memory_limit: w.default_memory_limit,
            timeout_ms: w.default_timeout_ms,
            fuel_limit: w.default_fuel_limit,
            max_tool_invoke_depth: w.max_tool_invoke_depth,
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn invoke_frame_serializes_with_type_tag() {
        let f = OutFrame::Invoke {
            id: "7".into(),
            tool: "call_host".into(),
            params_json: "{}".into(),
            call_ctx: None,
        };
        let line = serde_json::to_string(&f).unwrap();
        assert!(line.contains("\"type\":\"invoke\""));
        assert!(!line.contains("call_ctx"), "absent ctx must be omitted: {line}");
    }

    #[test]
    fn response_frame_parses_typed_bodies() {
        let line = r#"{"type":"response","id":"1","version":"1","name":"fake-runtime"}"#;
        let frame: InFrame = serde_json::from_str(line).unwrap();
        match frame {
            InFrame::Response(r) => {
                assert_eq!(r.id, "1");
                let hello: HelloResponse = r.parse().unwrap();
                assert_eq!(hello.version, "1");
                assert_eq!(hello.name.as_deref(), Some("fake-runtime"));
            }
            other => panic!("wrong frame: {other:?}"),
        }
    }

    #[test]
    fn host_call_event_round_trips() {
        let line = r#"{"type":"event","event":"host_call","request_id":"3","call_id":"host-call-1","tool":"host_echo","params_json":"{\"message\":\"hi\"}"}"#;
        let frame: InFrame = serde_json::from_str(line).unwrap();
        match frame {
            InFrame::Event(e) => {
                assert_eq!(e.event, "host_call");
                assert_eq!(e.request_id, "3");
                assert_eq!(e.call_id, "host-call-1");
                assert_eq!(e.tool, "host_echo");
            }
            other => panic!("wrong frame: {other:?}"),
        }
    }

    #[test]
    fn descriptor_approval_detection() {
        let plain = ToolDescriptor {
            name: "fmt".into(),
            path: None,
            description: String::new(),
            schema: json!({"type": "object"}),
            capabilities: vec![Capability::WorkspaceRead],
            warnings: vec![],
        };
        assert!(!plain.needs_approval());

        let netty = ToolDescriptor {
            capabilities: vec![Capability::WorkspaceRead, Capability::Http],
            ..plain.clone()
        };
        assert!(netty.needs_approval());
    }

    #[test]
    fn invoke_limits_derive_from_settings_defaults() {
        let w = lemon_config::WasmSettings::default();
        let limits = InvokeLimits::from(&w);
        assert_eq!(limits.timeout_ms, w.default_timeout_ms);
        assert_eq!(limits.max_tool_invoke_depth, w.max_tool_invoke_depth);
    }

    #[test]
    fn response_error_accessor_ignores_null() {
        let line = r#"{"type":"response","id":"9","output_json":"{}","error":null}"#;
        let frame: InFrame = serde_json::from_str(line).unwrap();
        if let InFrame::Response(r) = frame {
            assert!(r.error().is_none());
        } else {
            panic!("wrong frame");
        }
    }
}
