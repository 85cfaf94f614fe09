// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! The sidecar channel: a correlated request/response layer over the sandbox
//! runtime's stdin/stdout.
//!
//! ```text
//!   invoke()/discover()/hello() ──► write task ──► sidecar stdin
//!                                                      │
//!   pending map (id → oneshot) ◄── read task ◄── sidecar stdout
//!                                      │
//!                              host_call events ──► HostCallHandler
//! ```
//!
//! One reader task owns stdout and resolves pending requests by id; host
//! callbacks are dispatched from it onto their own tasks so a slow host tool
//! never blocks frame delivery.  When the transport dies (EOF, decode error,
//! process exit) the channel moves to `Stopped` and every outstanding
//! request fails with [`ChannelError::Closed`].

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::StreamExt;
use serde_json::{json, Value};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, oneshot};
use tokio_util::codec::{FramedRead, LinesCodec};
use tracing::{debug, warn};

use lemon_config::WasmSettings;

use crate::host::{HostCallHandler, RESERVED_PREFIX};
use crate::protocol::{
    DiscoverResponse, EventFrame, HelloResponse, InFrame, InvokeLimits, InvokeResponse, OutFrame,
    ResponseFrame, StoppedResponse, ToolDescriptor,
};

/// Timeout for control frames (hello / discover / shutdown / callback acks).
const CONTROL_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Unstarted,
    Started,
    Ready,
    Running,
    Stopping,
    Stopped,
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum ChannelError {
    #[error("sidecar channel closed")]
    Closed,
    #[error("sidecar channel not ready (state {0:?})")]
    NotReady(ChannelState),
    #[error("sidecar response timed out after {0}ms")]
    Timeout(u64),
    #[error("tool '{0}' is reserved for host callbacks")]
    ReservedTool(String),
    #[error("sidecar protocol error: {0}")]
    Protocol(String),
}

struct Inner {
    pending: Mutex<HashMap<String, oneshot::Sender<ResponseFrame>>>,
    /// call_id → outer invoke request id, for host-callback correlation.
    host_calls: Mutex<HashMap<String, String>>,
    /// outer invoke request id → host re-entries so far.
    depth: Mutex<HashMap<String, u32>>,
    state: Mutex<ChannelState>,
    outstanding_invokes: AtomicUsize,
}

impl Inner {
    fn set_state(&self, state: ChannelState) {
        *self.state.lock().unwrap() = state;
    }

    fn state(&self) -> ChannelState {
        *self.state.lock().unwrap()
    }

    /// Fail every outstanding request and forget callback bookkeeping.
    /// Dropping the senders resolves each waiter with [`ChannelError::Closed`].
    fn drain(&self) {
        self.pending.lock().unwrap().clear();
        self.host_calls.lock().unwrap().clear();
        self.depth.lock().unwrap().clear();
    }
}

pub struct SidecarChannel {
    inner: Arc<Inner>,
    write_tx: mpsc::Sender<String>,
    next_id: AtomicU64,
    limits: InvokeLimits,
    child: Mutex<Option<Child>>,
}

impl SidecarChannel {
    /// Spawn the runtime binary and attach a channel to its stdio.
    pub fn spawn(
        runtime_path: &Path,
        settings: &WasmSettings,
        host: Arc<dyn HostCallHandler>,
    ) -> anyhow::Result<Self> {
        let mut cmd = Command::new(runtime_path);
        for path in &settings.tool_paths {
            cmd.arg("--tool").arg(path);
        }
        for path in &settings.discover_paths {
            cmd.arg("--discover").arg(path);
        }
        cmd.stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn()?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| anyhow::anyhow!("sidecar stdin unavailable"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| anyhow::anyhow!("sidecar stdout unavailable"))?;
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(async move {
                let mut lines = FramedRead::new(BufReader::new(stderr), LinesCodec::new());
                while let Some(Ok(line)) = lines.next().await {
                    debug!(target: "sidecar", "{line}");
                }
            });
        }

        let channel = Self::from_transport(stdout, stdin, host, InvokeLimits::from(settings));
        *channel.child.lock().unwrap() = Some(child);
        Ok(channel)
    }

    /// Attach a channel to an arbitrary transport.  Tests drive this with an
    /// in-process fake runtime over `tokio::io::duplex`.
    pub fn from_transport(
        reader: impl AsyncRead + Send + Unpin + 'static,
        writer: impl AsyncWrite + Send + Unpin + 'static,
        host: Arc<dyn HostCallHandler>,
        limits: InvokeLimits,
    ) -> Self {
        let inner = Arc::new(Inner {
            pending: Mutex::new(HashMap::new()),
            host_calls: Mutex::new(HashMap::new()),
            depth: Mutex::new(HashMap::new()),
            state: Mutex::new(ChannelState::Started),
            outstanding_invokes: AtomicUsize::new(0),
        });

        let (write_tx, mut write_rx) = mpsc::channel::<String>(64);

        // Writer task: serializes all outbound frames onto one stream.
        tokio::spawn(async move {
            let mut writer = writer;
            while let Some(line) = write_rx.recv().await {
                if writer.write_all(line.as_bytes()).await.is_err() {
                    break;
                }
                if writer.write_all(b"\n").await.is_err() {
                    break;
                }
                if writer.flush().await.is_err() {
                    break;
                }
            }
        });

        // Reader task: resolves responses, dispatches host callbacks.
        let reader_inner = Arc::clone(&inner);
        let reader_write_tx = write_tx.clone();
        let max_depth = limits.max_tool_invoke_depth;
        let callback_id = Arc::new(AtomicU64::new(1_000_000));
        tokio::spawn(async move {
            let mut frames = FramedRead::new(reader, LinesCodec::new());
            while let Some(item) = frames.next().await {
                let line = match item {
                    Ok(line) => line,
                    Err(e) => {
                        warn!("sidecar framing error: {e}");
                        break;
                    }
                };
                if line.trim().is_empty() {
                    continue;
                }
                match serde_json::from_str::<InFrame>(&line) {
                    Ok(InFrame::Response(resp)) => {
                        let waiter = reader_inner.pending.lock().unwrap().remove(&resp.id);
                        match waiter {
                            Some(tx) => {
                                let _ = tx.send(resp);
                            }
                            // Stray response (e.g. after a timeout or a
                            // depth-failed invoke) — ignore, never crash.
                            None => debug!(id = %resp.id, "dropping uncorrelated response"),
                        }
                    }
                    Ok(InFrame::Event(event)) if event.event == "host_call" => {
                        let inner = Arc::clone(&reader_inner);
                        let write_tx = reader_write_tx.clone();
                        let host = Arc::clone(&host);
                        let callback_id = Arc::clone(&callback_id);
                        tokio::spawn(async move {
                            handle_host_call(inner, write_tx, host, callback_id, event, max_depth)
                                .await;
                        });
                    }
                    Ok(InFrame::Event(event)) => {
                        debug!(event = %event.event, "ignoring unknown sidecar event");
                    }
                    Err(e) => {
                        warn!("unparseable sidecar frame (ignored): {e}");
                    }
                }
            }
            // Transport gone: fail everything still waiting.
            reader_inner.set_state(ChannelState::Stopped);
            reader_inner.drain();
            debug!("sidecar channel reader stopped");
        });

        Self {
            inner,
            write_tx,
            next_id: AtomicU64::new(1),
            limits,
            child: Mutex::new(None),
        }
    }

    pub fn state(&self) -> ChannelState {
        self.inner.state()
    }

    /// Perform the handshake.  Must complete before any other request.
    pub async fn hello(&self) -> Result<HelloResponse, ChannelError> {
        let id = self.fresh_id();
        let resp = self
            .request(OutFrame::Hello { id }, CONTROL_TIMEOUT)
            .await?;
        let hello: HelloResponse = resp
            .parse()
            .map_err(|e| ChannelError::Protocol(e.to_string()))?;
        self.inner.set_state(ChannelState::Ready);
        Ok(hello)
    }

    /// Enumerate the sandboxed tools.
    pub async fn discover(&self) -> Result<DiscoverResponse, ChannelError> {
        self.ensure_ready()?;
        let id = self.fresh_id();
        let resp = self
            .request(OutFrame::Discover { id }, CONTROL_TIMEOUT)
            .await?;
        resp.parse()
            .map_err(|e| ChannelError::Protocol(e.to_string()))
    }

    /// Run a sandboxed tool.  The per-tool wall-clock limit doubles as the
    /// response deadline; resource limits ride along in `call_ctx`.
    pub async fn invoke(
        &self,
        tool: &str,
        params_json: impl Into<String>,
    ) -> Result<InvokeResponse, ChannelError> {
        if tool.starts_with(RESERVED_PREFIX) {
            return Err(ChannelError::ReservedTool(tool.to_string()));
        }
        self.ensure_ready()?;

        let id = self.fresh_id();
        self.inner
            .outstanding_invokes
            .fetch_add(1, Ordering::SeqCst);
        self.inner.set_state(ChannelState::Running);

        let frame = OutFrame::Invoke {
            id: id.clone(),
            tool: tool.to_string(),
            params_json: params_json.into(),
            call_ctx: Some(json!({ "limits": self.limits })),
        };
        let timeout = Duration::from_millis(self.limits.timeout_ms);
        let result = self.request(frame, timeout).await;

        // Invoke bookkeeping: depth tracking ends with the invoke, and the
        // channel drops back to Ready when the last invoke completes.
        self.inner.depth.lock().unwrap().remove(&id);
        if self
            .inner
            .outstanding_invokes
            .fetch_sub(1, Ordering::SeqCst)
            == 1
            && self.inner.state() == ChannelState::Running
        {
            self.inner.set_state(ChannelState::Ready);
        }

        result.and_then(|resp| {
            resp.parse()
                .map_err(|e| ChannelError::Protocol(e.to_string()))
        })
    }

    /// Graceful shutdown: `shutdown` frame, then reap the child.
    pub async fn shutdown(&self) {
        self.inner.set_state(ChannelState::Stopping);
        let id = self.fresh_id();
        match self
            .request(OutFrame::Shutdown { id }, CONTROL_TIMEOUT)
            .await
            .and_then(|r| {
                r.parse::<StoppedResponse>()
                    .map_err(|e| ChannelError::Protocol(e.to_string()))
            }) {
            Ok(stopped) if stopped.stopped => debug!("sidecar acknowledged shutdown"),
            Ok(_) | Err(_) => debug!("sidecar shutdown not acknowledged; killing"),
        }
        if let Some(mut child) = self.child.lock().unwrap().take() {
            let _ = child.start_kill();
        }
        self.inner.set_state(ChannelState::Stopped);
        self.inner.drain();
    }

    fn ensure_ready(&self) -> Result<(), ChannelError> {
        match self.inner.state() {
            ChannelState::Ready | ChannelState::Running => Ok(()),
            other => Err(ChannelError::NotReady(other)),
        }
    }

    fn fresh_id(&self) -> String {
        self.next_id.fetch_add(1, Ordering::SeqCst).to_string()
    }

    async fn request(
        &self,
        frame: OutFrame,
        timeout: Duration,
    ) -> Result<ResponseFrame, ChannelError> {
        let id = frame.id().to_string();
        let (tx, rx) = oneshot::channel();
        self.inner.pending.lock().unwrap().insert(id.clone(), tx);

        let line = serde_json::to_string(&frame)
            .map_err(|e| ChannelError::Protocol(e.to_string()))?;
        if self.write_tx.send(line).await.is_err() {
            self.inner.pending.lock().unwrap().remove(&id);
            self.inner.set_state(ChannelState::Stopped);
            return Err(ChannelError::Closed);
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(resp)) => {
                if let Some(error) = resp.error() {
                    // Errors reported by the sidecar still correlate and
                    // parse; surface them through the typed response so the
                    // caller decides.  Invoke errors stay in-band.
                    debug!(id = %id, error, "sidecar reported an error response");
                }
                Ok(resp)
            }
            Ok(Err(_)) => Err(ChannelError::Closed),
            Err(_) => {
                self.inner.pending.lock().unwrap().remove(&id);
                Err(ChannelError::Timeout(timeout.as_millis() as u64))
            }
        }
    }
}

/// Run one host callback and return the result to the sandbox.
///
/// Re-entrancy is bounded per outer invoke: when the counter passes the
/// configured maximum the outer invoke is failed directly and the sandbox
/// receives an error callback result so it can unwind.
async fn handle_host_call(
    inner: Arc<Inner>,
    write_tx: mpsc::Sender<String>,
    host: Arc<dyn HostCallHandler>,
    callback_id: Arc<AtomicU64>,
    event: EventFrame,
    max_depth: u32,
) {
    let depth = {
        let mut depths = inner.depth.lock().unwrap();
        let d = depths.entry(event.request_id.clone()).or_insert(0);
        *d += 1;
        *d
    };

    if depth > max_depth {
        warn!(
            request_id = %event.request_id,
            depth,
            max_depth,
            "host call depth exceeded; failing outer invoke"
        );
        // Fail the outer invoke now; a later sidecar response for this id
        // is dropped as uncorrelated.
        if let Some(tx) = inner.pending.lock().unwrap().remove(&event.request_id) {
            let mut body = serde_json::Map::new();
            body.insert(
                "error".to_string(),
                Value::String(format!(
                    "host call depth {depth} exceeds the configured maximum {max_depth}"
                )),
            );
            let _ = tx.send(ResponseFrame {
                id: event.request_id.clone(),
                body,
            });
        }
        send_host_result(
            &write_tx,
            &callback_id,
            &event.call_id,
            None,
            Some("host call depth exceeded".to_string()),
        )
        .await;
        return;
    }

    inner
        .host_calls
        .lock()
        .unwrap()
        .insert(event.call_id.clone(), event.request_id.clone());

    let params: Value = serde_json::from_str(&event.params_json).unwrap_or(Value::Null);
    let outcome = host.handle(&event.tool, params).await;

    inner.host_calls.lock().unwrap().remove(&event.call_id);

    match outcome {
        Ok(output) => {
            send_host_result(
                &write_tx,
                &callback_id,
                &event.call_id,
                Some(output.to_string()),
                None,
            )
            .await
        }
        Err(error) => {
            send_host_result(&write_tx, &callback_id, &event.call_id, None, Some(error)).await
        }
    }
}

async fn send_host_result(
    write_tx: &mpsc::Sender<String>,
    callback_id: &AtomicU64,
    call_id: &str,
    output_json: Option<String>,
    error: Option<String>,
) {
    let frame = OutFrame::HostCallResult {
        id: callback_id.fetch_add(1, Ordering::SeqCst).to_string(),
        call_id: call_id.to_string(),
        output_json,
        error,
    };
    match serde_json::to_string(&frame) {
        Ok(line) => {
            let _ = write_tx.send(line).await;
        }
        Err(e) => warn!("failed to serialize host_call_result: {e}"),
    }
}

// ── Startup helper ────────────────────────────────────────────────────────────

/// Why the wasm tool surface is (or is not) available.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WasmStatus {
    Ready,
    Disabled,
    Unavailable(String),
}

impl WasmStatus {
    pub fn describe(&self) -> String {
        match self {
            Self::Ready => "ready".to_string(),
            Self::Disabled => "disabled".to_string(),
            Self::Unavailable(reason) => format!("unavailable: {reason}"),
        }
    }
}

/// Outcome of starting the sandbox runtime for a session.
pub struct SidecarStart {
    pub channel: Option<Arc<SidecarChannel>>,
    pub tools: Vec<ToolDescriptor>,
    pub status: WasmStatus,
}

impl SidecarStart {
    fn unavailable(reason: impl Into<String>) -> Self {
        Self {
            channel: None,
            tools: Vec::new(),
            status: WasmStatus::Unavailable(reason.into()),
        }
    }
}

/// Start the sandbox runtime, handshake, and discover its tools.
///
/// Never fails the session: a missing or broken runtime yields an empty tool
/// list and a `wasm_status` reason.
pub async fn start_sidecar(
    settings: &WasmSettings,
    host: Arc<dyn HostCallHandler>,
) -> SidecarStart {
    if !settings.enabled {
        return SidecarStart {
            channel: None,
            tools: Vec::new(),
            status: WasmStatus::Disabled,
        };
    }
    let Some(runtime_path) = settings.runtime_path.as_deref() else {
        return SidecarStart::unavailable("no runtime_path configured");
    };
    if !runtime_path.exists() {
        return SidecarStart::unavailable(format!(
            "runtime binary not found: {}",
            runtime_path.display()
        ));
    }

    let channel = match SidecarChannel::spawn(runtime_path, settings, host) {
        Ok(c) => c,
        Err(e) => return SidecarStart::unavailable(format!("spawn failed: {e}")),
    };
    if let Err(e) = channel.hello().await {
        return SidecarStart::unavailable(format!("handshake failed: {e}"));
    }
    let discovered = match channel.discover().await {
        Ok(d) => d,
        Err(e) => return SidecarStart::unavailable(format!("discover failed: {e}")),
    };
    for warning in &discovered.warnings {
        warn!("sidecar discover warning: {warning}");
    }
    for error in &discovered.errors {
        warn!("sidecar discover error: {error}");
    }

    SidecarStart {
        channel: Some(Arc::new(channel)),
        tools: discovered.tools,
        status: WasmStatus::Ready,
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
