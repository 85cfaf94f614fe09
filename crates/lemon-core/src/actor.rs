// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! The session actor: a single task owning one conversation and driving the
//! model ↔ tool loop.
//!
//! ```text
//!   SessionHandle ──► mpsc::Sender<Command> ──► actor task
//!                                                  │ select! over
//!                                                  │ mailbox + model stream
//!   subscribers  ◄── per-subscriber channels ◄─────┘
//! ```
//!
//! All mutation goes through the mailbox; observers use snapshot queries or
//! stream subscriptions.  The actor stays responsive mid-turn (steer, abort,
//! subscribe all work while streaming) by selecting between the mailbox and
//! the model stream.  Every turn ends by funneling through exactly one
//! terminal-frame emission.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use serde_json::{json, Value};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use lemon_config::{resolve_api_key, EnvSecretStore, SecretStore, Settings};
use lemon_model::{
    new_hex_id, Message, ModelRef, StopReason, StreamContext, StreamError, StreamEvent, StreamFn,
    StreamOptions, ToolCallFrame, Trust, Usage,
};
use lemon_sidecar::{start_sidecar, SecretHostRouter, SidecarChannel, WasmStatus};
use lemon_store::ProcessStore;
use lemon_tools::{
    builtin::default_tools, trust_metadata, wrap_untrusted, AbortSignal, KeyStyle, PolicyDecision,
    Tool, ToolPolicy, ToolRegistry,
};

use crate::conversation::ConversationManager;
use crate::dispatch::SidecarTool;
use crate::events::{SessionEvent, SubscribeMode};
use crate::extensions::{ExtensionLoader, NoExtensions};
use crate::hooks::{HookOptions, HookRegistry};
use crate::recovery::{
    compact_entries, RecoveryAction, RecoveryOutcome, RecoveryResult, RecoverySignature,
    RecoveryState,
};
use crate::telemetry::{Telemetry, TelemetryEvent};

/// Deadline for the overflow-recovery task.
const RECOVERY_DEADLINE: Duration = Duration::from_secs(10);
/// Entries preserved verbatim by overflow compaction.
const COMPACTION_KEEP_RECENT: usize = 8;

/// Construction options for [`SessionActor::spawn`].
pub struct SessionOptions {
    pub cwd: PathBuf,
    pub model: ModelRef,
    pub stream_fn: StreamFn,
    pub settings: Settings,
    /// Custom tool list; replaces the built-in defaults when set.
    /// Extension and sidecar tools are appended either way.
    pub tools: Option<Vec<Arc<dyn Tool>>>,
    pub session_id: Option<String>,
    pub parent_session: Option<String>,
    pub secret_store: Arc<dyn SecretStore>,
    pub extension_loader: Arc<dyn ExtensionLoader>,
    pub process_store: Option<Arc<ProcessStore>>,
    pub policy: Arc<ToolPolicy>,
    pub telemetry: Arc<Telemetry>,
    pub hooks: Arc<HookRegistry>,
}

impl SessionOptions {
    pub fn new(cwd: impl Into<PathBuf>, model: ModelRef, stream_fn: StreamFn) -> Self {
        Self {
            cwd: cwd.into(),
            model,
            stream_fn,
            settings: Settings::default(),
            tools: None,
            session_id: None,
            parent_session: None,
            secret_store: Arc::new(EnvSecretStore),
            extension_loader: Arc::new(NoExtensions),
            process_store: None,
            policy: Arc::new(ToolPolicy::allow_all()),
            telemetry: Arc::new(Telemetry::new()),
            hooks: Arc::new(HookRegistry::new()),
        }
    }
}

/// Point-in-time view of the session.
#[derive(Debug, Clone)]
pub struct SessionSnapshot {
    pub session_id: String,
    pub parent_session: Option<String>,
    pub model: ModelRef,
    pub turn_index: u64,
    pub is_streaming: bool,
    pub entry_count: usize,
    pub leaf_id: Option<String>,
    pub steering_queued: usize,
    pub subscriber_count: usize,
    pub tool_names: Vec<String>,
    pub wasm_tool_names: Vec<String>,
    pub wasm_status: String,
    pub recovery_in_progress: bool,
    pub recovery_attempted: bool,
    pub last_error: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct SessionStats {
    pub turns: u64,
    pub entries: usize,
    pub tool_calls: u64,
    pub usage: Usage,
    pub subscriber_count: usize,
}

enum Command {
    Prompt(String),
    Steer(String),
    Subscribe {
        mode: SubscribeMode,
        reply: oneshot::Sender<(String, mpsc::UnboundedReceiver<SessionEvent>)>,
    },
    Unsubscribe(String),
    GetState(oneshot::Sender<SessionSnapshot>),
    GetStats(oneshot::Sender<SessionStats>),
    Abort,
    ReloadExtensions,
    Stop(Option<oneshot::Sender<()>>),
    /// Arbitrary foreign message; ignored (never crashes the session).
    Extern(Value),
}

/// Cheap-to-clone handle to a running session actor.
#[derive(Clone)]
pub struct SessionHandle {
    pub session_id: String,
    cmd_tx: mpsc::Sender<Command>,
    hooks: Arc<HookRegistry>,
    telemetry: Arc<Telemetry>,
}

impl SessionHandle {
    /// Begin a turn (non-blocking).
    pub async fn prompt(&self, text: impl Into<String>) -> anyhow::Result<()> {
        self.send(Command::Prompt(text.into())).await
    }

    /// Queue a mid-turn interjection.
    pub async fn steer(&self, text: impl Into<String>) -> anyhow::Result<()> {
        self.send(Command::Steer(text.into())).await
    }

    /// Subscribe for events; returns the subscription id and, for stream
    /// mode, the channel events arrive on (poll subscribers receive no
    /// frames and use [`SessionHandle::get_state`] snapshots).
    pub async fn subscribe(
        &self,
        mode: SubscribeMode,
    ) -> anyhow::Result<(String, mpsc::UnboundedReceiver<SessionEvent>)> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Subscribe { mode, reply }).await?;
        Ok(rx.await?)
    }

    pub async fn unsubscribe(&self, id: impl Into<String>) -> anyhow::Result<()> {
        self.send(Command::Unsubscribe(id.into())).await
    }

    pub async fn get_state(&self) -> anyhow::Result<SessionSnapshot> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::GetState(reply)).await?;
        Ok(rx.await?)
    }

    pub async fn get_stats(&self) -> anyhow::Result<SessionStats> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::GetStats(reply)).await?;
        Ok(rx.await?)
    }

    /// Abort the in-flight turn (no-op when idle).
    pub async fn abort(&self) -> anyhow::Result<()> {
        self.send(Command::Abort).await
    }

    pub async fn reload_extensions(&self) -> anyhow::Result<()> {
        self.send(Command::ReloadExtensions).await
    }

    /// Stop the session gracefully; resolves once cleanup has run.
    pub async fn stop(&self) -> anyhow::Result<()> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Stop(Some(reply))).await?;
        let _ = rx.await;
        Ok(())
    }

    /// Inject an arbitrary foreign message (exercises the ignore path).
    pub async fn send_extern(&self, value: Value) -> anyhow::Result<()> {
        self.send(Command::Extern(value)).await
    }

    pub fn is_alive(&self) -> bool {
        !self.cmd_tx.is_closed()
    }

    /// The session's compaction-hook registry.
    pub fn hooks(&self) -> &Arc<HookRegistry> {
        &self.hooks
    }

    pub fn telemetry(&self) -> &Arc<Telemetry> {
        &self.telemetry
    }

    async fn send(&self, cmd: Command) -> anyhow::Result<()> {
        self.cmd_tx
            .send(cmd)
            .await
            .map_err(|_| anyhow::anyhow!("session {} has stopped", self.session_id))
    }
}

struct Subscriber {
    mode: SubscribeMode,
    tx: mpsc::UnboundedSender<SessionEvent>,
}

enum MidTurn {
    Continue,
    Aborted,
    Shutdown,
}

enum TurnExit {
    Idle,
    Next(String),
    Shutdown,
}

enum ErrorFlow {
    /// Recovery succeeded; re-drive the stream with the compacted context.
    Resume,
    /// The turn was finalized with a terminal frame.
    Finalized(TurnExit),
}

pub struct SessionActor {
    session_id: String,
    parent_session: Option<String>,
    cwd: PathBuf,
    model: ModelRef,
    stream_fn: StreamFn,
    settings: Settings,
    secret_store: Arc<dyn SecretStore>,
    extension_loader: Arc<dyn ExtensionLoader>,
    policy: Arc<ToolPolicy>,
    telemetry: Arc<Telemetry>,
    hooks: Arc<HookRegistry>,

    cmd_rx: mpsc::Receiver<Command>,
    conversation: ConversationManager,
    registry: ToolRegistry,
    base_tools: Vec<Arc<dyn Tool>>,
    sidecar_tools: Vec<Arc<dyn Tool>>,
    /// Sidecar tools whose capabilities require the approval gate, with the
    /// capability list as the human-readable reason.
    sidecar_approval: HashMap<String, String>,
    extension_hook_ids: Vec<String>,
    sidecar: Option<Arc<SidecarChannel>>,
    wasm_status: WasmStatus,
    wasm_tool_names: Vec<String>,

    subscribers: HashMap<String, Subscriber>,
    steering: std::collections::VecDeque<String>,
    turn_index: u64,
    is_streaming: bool,
    terminal_sent: bool,
    abort_signal: AbortSignal,
    recovery: RecoveryState,
    last_error: Option<String>,
    stats: SessionStats,
}

impl SessionActor {
    /// Spawn a session actor, returning its handle and join handle.
    ///
    /// The join handle resolves when the actor has fully cleaned up; the
    /// supervisor monitors it for liveness.
    pub fn spawn(opts: SessionOptions) -> (SessionHandle, JoinHandle<()>) {
        let session_id = opts
            .session_id
            .clone()
            .unwrap_or_else(new_hex_id);
        let (cmd_tx, cmd_rx) = mpsc::channel(256);

        let handle = SessionHandle {
            session_id: session_id.clone(),
            cmd_tx,
            hooks: Arc::clone(&opts.hooks),
            telemetry: Arc::clone(&opts.telemetry),
        };

        let join = tokio::spawn(async move {
            let mut actor = SessionActor::build(session_id, opts, cmd_rx).await;
            actor.run().await;
        });

        (handle, join)
    }

    async fn build(
        session_id: String,
        opts: SessionOptions,
        cmd_rx: mpsc::Receiver<Command>,
    ) -> Self {
        let base_tools = opts
            .tools
            .unwrap_or_else(|| default_tools(opts.process_store.clone()));

        let mut actor = Self {
            session_id,
            parent_session: opts.parent_session,
            cwd: opts.cwd,
            model: opts.model,
            stream_fn: opts.stream_fn,
            settings: opts.settings,
            secret_store: opts.secret_store,
            extension_loader: opts.extension_loader,
            policy: opts.policy,
            telemetry: opts.telemetry,
            hooks: opts.hooks,
            cmd_rx,
            conversation: ConversationManager::new(),
            registry: ToolRegistry::new(),
            base_tools,
            sidecar_tools: Vec::new(),
            sidecar_approval: HashMap::new(),
            extension_hook_ids: Vec::new(),
            sidecar: None,
            wasm_status: WasmStatus::Disabled,
            wasm_tool_names: Vec::new(),
            subscribers: HashMap::new(),
            steering: std::collections::VecDeque::new(),
            turn_index: 0,
            is_streaming: false,
            terminal_sent: false,
            abort_signal: AbortSignal::new(),
            recovery: RecoveryState::default(),
            last_error: None,
            stats: SessionStats::default(),
        };

        actor.start_sidecar().await;
        actor.load_extensions();
        info!(session_id = %actor.session_id, "session started");
        actor
    }

    /// Start the sandbox sidecar when wasm is enabled; failures degrade the
    /// wasm tool surface, never the session.
    async fn start_sidecar(&mut self) {
        let wasm = self.settings.tools.wasm.clone();
        let host = Arc::new(SecretHostRouter::new(Arc::clone(&self.secret_store)));
        let start = start_sidecar(&wasm, host).await;
        if let WasmStatus::Unavailable(reason) = &start.status {
            warn!(session_id = %self.session_id, %reason, "sidecar unavailable");
        }
        self.wasm_status = start.status;
        self.wasm_tool_names = start.tools.iter().map(|t| t.name.clone()).collect();
        self.sidecar_tools = if let Some(channel) = &start.channel {
            start
                .tools
                .iter()
                .map(|descriptor| {
                    if descriptor.needs_approval() {
                        let caps = descriptor
                            .capabilities
                            .iter()
                            .map(|c| format!("{c:?}"))
                            .collect::<Vec<_>>()
                            .join(", ");
                        self.sidecar_approval
                            .insert(descriptor.name.clone(), caps);
                    }
                    Arc::new(SidecarTool::new(descriptor.clone(), Arc::clone(channel)))
                        as Arc<dyn Tool>
                })
                .collect()
        } else {
            Vec::new()
        };
        self.sidecar = start.channel;
    }

    /// (Re)load extensions: their tools append to the registry and their
    /// hooks register as pre-compaction hooks.
    fn load_extensions(&mut self) {
        for id in self.extension_hook_ids.drain(..) {
            self.hooks.unregister_hook(&id);
        }
        let extensions = self
            .extension_loader
            .load(&self.settings.extension_paths);

        let mut appended: Vec<Arc<dyn Tool>> = Vec::new();
        for ext in extensions {
            debug!(session_id = %self.session_id, extension = %ext.name, "loading extension");
            appended.extend(ext.tools);
            for hook in ext.hooks {
                let id = self.hooks.register_hook(
                    &self.session_id,
                    hook.func,
                    HookOptions {
                        priority: hook.priority,
                        timeout_ms: hook.timeout_ms,
                    },
                );
                self.extension_hook_ids.push(id);
            }
        }
        appended.extend(self.sidecar_tools.iter().cloned());
        self.registry = ToolRegistry::compose(self.base_tools.clone(), appended);
    }

    async fn run(mut self) {
        loop {
            let Some(cmd) = self.cmd_rx.recv().await else {
                break;
            };
            match cmd {
                Command::Prompt(text) => {
                    let mut next = Some(self.with_steering_prefix(text));
                    while let Some(t) = next.take() {
                        match self.run_turn(t).await {
                            TurnExit::Idle => {}
                            TurnExit::Next(t) => next = Some(t),
                            TurnExit::Shutdown => {
                                self.cleanup().await;
                                return;
                            }
                        }
                    }
                }
                // Steering while idle starts a fresh turn.
                Command::Steer(text) => {
                    let mut next = Some(self.with_steering_prefix(text));
                    while let Some(t) = next.take() {
                        match self.run_turn(t).await {
                            TurnExit::Idle => {}
                            TurnExit::Next(t) => next = Some(t),
                            TurnExit::Shutdown => {
                                self.cleanup().await;
                                return;
                            }
                        }
                    }
                }
                Command::Abort => {
                    // Nothing in flight.
                    debug!(session_id = %self.session_id, "abort while idle ignored");
                }
                Command::Stop(reply) => {
                    self.cleanup().await;
                    if let Some(reply) = reply {
                        let _ = reply.send(());
                    }
                    return;
                }
                other => {
                    let _ = self.handle_common_command(other);
                }
            }
        }
        self.cleanup().await;
    }

    /// Commands valid in every state (idle and mid-turn).
    fn handle_common_command(&mut self, cmd: Command) -> MidTurn {
        match cmd {
            Command::Subscribe { mode, reply } => {
                let id = new_hex_id();
                let (tx, rx) = mpsc::unbounded_channel();
                self.subscribers.insert(id.clone(), Subscriber { mode, tx });
                let _ = reply.send((id, rx));
                MidTurn::Continue
            }
            Command::Unsubscribe(id) => {
                if self.subscribers.remove(&id).is_none() {
                    debug!(session_id = %self.session_id, %id, "unsubscribe for unknown id ignored");
                }
                MidTurn::Continue
            }
            Command::GetState(reply) => {
                let _ = reply.send(self.snapshot());
                MidTurn::Continue
            }
            Command::GetStats(reply) => {
                let mut stats = self.stats.clone();
                stats.entries = self.conversation.len();
                stats.subscriber_count = self.subscribers.len();
                let _ = reply.send(stats);
                MidTurn::Continue
            }
            Command::ReloadExtensions => {
                self.load_extensions();
                MidTurn::Continue
            }
            Command::Extern(value) => {
                debug!(session_id = %self.session_id, ?value, "ignoring foreign message");
                MidTurn::Continue
            }
            Command::Prompt(text) | Command::Steer(text) => {
                // Only reachable mid-turn; queue as an interjection.
                self.steering.push_back(text);
                MidTurn::Continue
            }
            Command::Abort => MidTurn::Aborted,
            Command::Stop(reply) => {
                if let Some(reply) = reply {
                    let _ = reply.send(());
                }
                MidTurn::Shutdown
            }
        }
    }

    fn with_steering_prefix(&mut self, text: String) -> String {
        if self.steering.is_empty() {
            return text;
        }
        let mut parts: Vec<String> = self.steering.drain(..).collect();
        parts.push(text);
        parts.join("\n")
    }

    // ── The turn state machine ────────────────────────────────────────────────

    async fn run_turn(&mut self, text: String) -> TurnExit {
        // Preparing.
        self.turn_index += 1;
        self.stats.turns += 1;
        self.is_streaming = true;
        self.terminal_sent = false;
        self.last_error = None;
        self.abort_signal = AbortSignal::new();
        self.fan_out(SessionEvent::TurnStarted {
            turn_index: self.turn_index,
        });
        self.conversation.append_message(Message::user(&text));

        let api_key = resolve_api_key(
            &self.model.provider,
            &self.settings,
            self.secret_store.as_ref(),
        )
        .await;

        let mut turn_messages: Vec<Message> = Vec::new();
        let mut partial_text = String::new();

        // Streaming ↔ ToolDispatch until a terminal condition.
        loop {
            let context = StreamContext {
                messages: self.conversation.messages(),
                tools: self.registry.schemas(),
            };
            let options = StreamOptions {
                api_key: api_key.clone(),
            };
            let stream = match (self.stream_fn)(self.model.clone(), context, options).await {
                Ok(s) => s,
                Err(e) => match self.handle_stream_error(e, &partial_text).await {
                    ErrorFlow::Resume => continue,
                    ErrorFlow::Finalized(exit) => return exit,
                },
            };

            match self
                .consume_stream(stream, &mut turn_messages, &mut partial_text)
                .await
            {
                StreamFlow::Reinvoke => continue,
                StreamFlow::Exit(exit) => return exit,
                StreamFlow::RecoveredResume => continue,
            }
        }
    }

    async fn consume_stream(
        &mut self,
        mut stream: lemon_model::EventStream,
        turn_messages: &mut Vec<Message>,
        partial_text: &mut String,
    ) -> StreamFlow {
        let mut pending_calls: Vec<ToolCallFrame> = Vec::new();

        loop {
            tokio::select! {
                biased;
                maybe_cmd = self.cmd_rx.recv() => {
                    let Some(cmd) = maybe_cmd else {
                        return StreamFlow::Exit(self.finalize_canceled("session_stopped", TurnExit::Shutdown));
                    };
                    match self.handle_common_command(cmd) {
                        MidTurn::Continue => {}
                        MidTurn::Aborted => {
                            self.abort_signal.abort();
                            return StreamFlow::Exit(self.finalize_canceled("user_abort", TurnExit::Idle));
                        }
                        MidTurn::Shutdown => {
                            self.abort_signal.abort();
                            return StreamFlow::Exit(self.finalize_canceled("session_stopped", TurnExit::Shutdown));
                        }
                    }
                }
                maybe_ev = stream.next() => {
                    let Some(item) = maybe_ev else {
                        // The stream ended without a Done frame; subscribers
                        // must still see a terminal.
                        return StreamFlow::Exit(self.finalize_error(
                            "stream ended unexpectedly",
                            Some(partial_text.clone()),
                        ));
                    };
                    match item {
                        Err(e) => {
                            return match self.handle_stream_error(e, partial_text).await {
                                ErrorFlow::Resume => StreamFlow::RecoveredResume,
                                ErrorFlow::Finalized(exit) => StreamFlow::Exit(exit),
                            };
                        }
                        Ok(ev) => {
                            if let Some(flow) = self
                                .handle_stream_event(ev, &mut pending_calls, turn_messages, partial_text)
                                .await
                            {
                                return flow;
                            }
                        }
                    }
                }
            }
        }
    }

    /// Handle one in-order stream event.  Returns `Some` when the stream
    /// loop must stop (terminal or re-invoke).
    async fn handle_stream_event(
        &mut self,
        ev: StreamEvent,
        pending_calls: &mut Vec<ToolCallFrame>,
        turn_messages: &mut Vec<Message>,
        partial_text: &mut String,
    ) -> Option<StreamFlow> {
        match ev {
            StreamEvent::Start => None,
            StreamEvent::TextStart { index } => {
                self.fan_out(SessionEvent::TextStart { index });
                None
            }
            StreamEvent::TextDelta { index, text } => {
                partial_text.push_str(&text);
                self.fan_out(SessionEvent::TextDelta { index, text });
                None
            }
            StreamEvent::TextEnd { index } => {
                self.fan_out(SessionEvent::TextEnd { index });
                None
            }
            StreamEvent::ToolCallStart { index, call } => {
                self.fan_out(SessionEvent::ToolCallStart { index, call });
                None
            }
            StreamEvent::ToolCallEnd { index, call } => {
                self.conversation
                    .append(lemon_model::Entry::new(lemon_model::EntryBody::ToolCall {
                        call_id: call.id.clone(),
                        name: call.name.clone(),
                        params: call.params.clone(),
                    }));
                pending_calls.push(call.clone());
                self.fan_out(SessionEvent::ToolCallEnd { index, call });
                None
            }
            StreamEvent::MessageEnd { message } => {
                let aborted = message.meta.stop_reason == Some(StopReason::Aborted);
                if let Some(usage) = &message.meta.usage {
                    self.stats.usage.add(usage);
                }
                self.conversation.append_message(message.clone());
                turn_messages.push(message.clone());
                self.fan_out(SessionEvent::MessageEnd { message });
                if aborted {
                    return Some(StreamFlow::Exit(
                        self.finalize_canceled("assistant_aborted", TurnExit::Idle),
                    ));
                }
                None
            }
            StreamEvent::Done { stop_reason, .. } => match stop_reason {
                StopReason::ToolUse => {
                    let calls = std::mem::take(pending_calls);
                    for call in calls {
                        if self.abort_signal.is_aborted() {
                            return Some(StreamFlow::Exit(
                                self.finalize_canceled("user_abort", TurnExit::Idle),
                            ));
                        }
                        let result_msg = self.execute_tool(&call).await;
                        turn_messages.push(result_msg);
                    }
                    Some(StreamFlow::Reinvoke)
                }
                StopReason::Aborted => Some(StreamFlow::Exit(
                    self.finalize_canceled("assistant_aborted", TurnExit::Idle),
                )),
                StopReason::EndTurn | StopReason::MaxTokens | StopReason::Error => Some(
                    StreamFlow::Exit(self.finalize_success(std::mem::take(turn_messages))),
                ),
            },
        }
    }

    // ── Tool dispatch ─────────────────────────────────────────────────────────

    async fn execute_tool(&mut self, call: &ToolCallFrame) -> Message {
        self.stats.tool_calls += 1;
        let declared_untrusted = self
            .registry
            .get(&call.name)
            .map(|t| t.trust() == Trust::Untrusted)
            .unwrap_or(false);
        let result = match self.registry.get(&call.name) {
            None => lemon_tools::ToolResult::err(format!("unknown tool: {}", call.name)),
            Some(tool) => {
                let approval_reason = self.sidecar_approval.get(&call.name).cloned();
                let decision = self
                    .policy
                    .check(
                        &self.session_id,
                        &call.name,
                        approval_reason.is_some(),
                        approval_reason.as_deref().unwrap_or(""),
                    )
                    .await;
                match decision {
                    PolicyDecision::Deny(reason) => {
                        info!(session_id = %self.session_id, tool = %call.name, "tool denied");
                        lemon_tools::ToolResult::err(reason)
                    }
                    PolicyDecision::Allow => {
                        debug!(session_id = %self.session_id, tool = %call.name, "tool call");
                        tool.execute(
                            &call.id,
                            call.params.clone(),
                            &self.cwd,
                            self.abort_signal.clone(),
                        )
                        .await
                    }
                }
            }
        };

        let untrusted = declared_untrusted || result.trust == Trust::Untrusted;
        let mut details = result.details.clone();
        if untrusted {
            let label = self
                .registry
                .get(&call.name)
                .map(|t| t.label())
                .unwrap_or_else(|| call.name.clone());
            details.extend(trust_metadata(
                &call.name,
                &label,
                &[Some("content")],
                true,
                KeyStyle::Snake,
            ));
        }

        let trust = if untrusted {
            Trust::Untrusted
        } else {
            Trust::Trusted
        };
        let mut message =
            Message::tool_result(&call.id, &result.content, trust).with_details(details);
        if untrusted {
            message = wrap_untrusted(vec![message]).remove(0);
        }

        self.conversation.append_message(message.clone());
        self.fan_out(SessionEvent::ToolResult {
            call_id: call.id.clone(),
            content: message.text(),
            is_error: result.is_error,
        });
        message
    }

    // ── Overflow recovery ─────────────────────────────────────────────────────

    fn signature(&self) -> RecoverySignature {
        RecoverySignature {
            session_id: self.session_id.clone(),
            leaf_id: self.conversation.leaf_id().map(str::to_string),
            entry_count: self.conversation.len(),
            turn_index: self.turn_index,
            provider: self.model.provider.clone(),
            model_id: self.model.id.clone(),
        }
    }

    async fn handle_stream_error(&mut self, error: StreamError, partial_text: &str) -> ErrorFlow {
        if error.is_overflow() && !self.recovery.attempted {
            return self.attempt_recovery(partial_text).await;
        }
        if error.is_overflow() {
            debug!(session_id = %self.session_id, "second overflow with recovery already attempted");
        }
        ErrorFlow::Finalized(self.finalize_error(
            &error.to_string(),
            (!partial_text.is_empty()).then(|| partial_text.to_string()),
        ))
    }

    async fn attempt_recovery(&mut self, partial_text: &str) -> ErrorFlow {
        info!(session_id = %self.session_id, "context overflow; attempting one-shot recovery");

        // Pre-compaction hooks run before anything is dropped.
        let hook_result = self
            .hooks
            .execute_hooks(&self.session_id, json!({ "reason": "overflow" }))
            .await;
        debug!(session_id = %self.session_id, ?hook_result, "pre-compaction hooks done");

        let signature = self.signature();
        self.recovery.begin(
            signature.clone(),
            (!partial_text.is_empty()).then(|| partial_text.to_string()),
        );

        // Monitored recovery task with a deadline; a crash or a missed
        // deadline is a failure outcome, never a hang.
        let entries = self.conversation.entries().to_vec();
        let task_sig = signature.clone();
        let task = tokio::spawn(async move {
            let outcome = match compact_entries(&entries, COMPACTION_KEEP_RECENT) {
                Ok(compacted) => RecoveryOutcome::Ok(compacted),
                Err(reason) => RecoveryOutcome::Error(reason),
            };
            RecoveryResult {
                signature: task_sig,
                outcome,
            }
        });
        let result = match tokio::time::timeout(RECOVERY_DEADLINE, task).await {
            Ok(Ok(result)) => result,
            Ok(Err(join_err)) => RecoveryResult {
                signature: signature.clone(),
                outcome: RecoveryOutcome::Error(format!("recovery task died: {join_err}")),
            },
            Err(_) => RecoveryResult {
                signature: signature.clone(),
                outcome: RecoveryOutcome::Error("recovery deadline exceeded".to_string()),
            },
        };

        match self.recovery.handle_result(result) {
            RecoveryAction::Resume(compacted) => {
                info!(session_id = %self.session_id, entries = compacted.len(), "overflow recovery succeeded; resuming");
                self.conversation.replace_entries(compacted);
                ErrorFlow::Resume
            }
            RecoveryAction::Finalize(reason) => {
                self.telemetry.emit(TelemetryEvent::OverflowRecoveryFailure {
                    count: 1,
                    session_id: self.session_id.clone(),
                    reason: reason.clone(),
                });
                ErrorFlow::Finalized(self.finalize_error(&reason, None))
            }
            RecoveryAction::Ignore => {
                // The result we just produced was stale against our own
                // signature — only possible if the session mutated mid-await.
                // Surface as a normal error.
                ErrorFlow::Finalized(self.finalize_error("stale recovery result", None))
            }
        }
    }

    // ── Finalization (the only terminal-frame emitters) ───────────────────────

    fn finalize_success(&mut self, messages: Vec<Message>) -> TurnExit {
        self.fan_terminal(SessionEvent::AgentEnd { messages });
        self.is_streaming = false;
        self.recovery.reset();
        match self.steering.pop_front() {
            Some(mut text) => {
                // Collapse any further queued interjections into one prompt.
                for extra in self.steering.drain(..) {
                    text.push('\n');
                    text.push_str(&extra);
                }
                TurnExit::Next(text)
            }
            None => TurnExit::Idle,
        }
    }

    fn finalize_canceled(&mut self, reason: &str, exit: TurnExit) -> TurnExit {
        self.fan_terminal(SessionEvent::Canceled {
            reason: reason.to_string(),
        });
        self.is_streaming = false;
        self.steering.clear();
        self.recovery.reset();
        exit
    }

    fn finalize_error(&mut self, reason: &str, partial_state: Option<String>) -> TurnExit {
        self.last_error = Some(reason.to_string());
        self.fan_terminal(SessionEvent::Error {
            reason: reason.to_string(),
            partial_state,
        });
        self.is_streaming = false;
        self.steering.clear();
        self.recovery.reset();
        TurnExit::Idle
    }

    // ── Subscriber fan-out ────────────────────────────────────────────────────

    fn fan_out(&mut self, event: SessionEvent) {
        self.subscribers.retain(|_, sub| {
            if sub.mode != SubscribeMode::Stream {
                return true;
            }
            sub.tx.send(event.clone()).is_ok()
        });
    }

    /// Emit the turn's terminal frame — at most once per turn.
    fn fan_terminal(&mut self, event: SessionEvent) {
        if self.terminal_sent {
            warn!(session_id = %self.session_id, "suppressing duplicate terminal frame");
            return;
        }
        self.terminal_sent = true;
        self.fan_out(event);
    }

    fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            session_id: self.session_id.clone(),
            parent_session: self.parent_session.clone(),
            model: self.model.clone(),
            turn_index: self.turn_index,
            is_streaming: self.is_streaming,
            entry_count: self.conversation.len(),
            leaf_id: self.conversation.leaf_id().map(str::to_string),
            steering_queued: self.steering.len(),
            subscriber_count: self.subscribers.len(),
            tool_names: self.registry.names(),
            wasm_tool_names: self.wasm_tool_names.clone(),
            wasm_status: self.wasm_status.describe(),
            recovery_in_progress: self.recovery.in_progress,
            recovery_attempted: self.recovery.attempted,
            last_error: self.last_error.clone(),
        }
    }

    /// Termination: abort in-flight work, terminal-frame live subscribers,
    /// shut the sidecar down, release hooks.
    async fn cleanup(&mut self) {
        self.abort_signal.abort();
        if self.is_streaming {
            self.fan_terminal(SessionEvent::Canceled {
                reason: "session_stopped".to_string(),
            });
            self.is_streaming = false;
        }
        if let Some(sidecar) = self.sidecar.take() {
            sidecar.shutdown().await;
        }
        self.hooks.unregister_all_hooks(&self.session_id);
        self.subscribers.clear();
        info!(session_id = %self.session_id, "session stopped");
    }
}

enum StreamFlow {
    /// Tool phase done; call the model again with the updated context.
    Reinvoke,
    /// Overflow recovery swapped the context; call the model again.
    RecoveredResume,
    /// The turn is over.
    Exit(TurnExit),
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
//
// The heavier end-to-end scenarios live in tests/session_tests.rs; these
// cover pure helpers.
