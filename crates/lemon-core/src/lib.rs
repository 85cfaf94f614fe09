// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
mod actor;
mod budget;
mod conversation;
mod coordinator;
mod dispatch;
mod events;
mod extensions;
mod hooks;
mod recovery;
mod telemetry;

pub use actor::{SessionActor, SessionHandle, SessionOptions, SessionSnapshot, SessionStats};
pub use budget::{
    BudgetExceeded, BudgetLimitKind, BudgetLimits, BudgetRemaining, BudgetTracker, BudgetUsage,
};
pub use conversation::ConversationManager;
pub use coordinator::{
    Coordinator, RunOptions, SubagentOutcome, SubagentResult, SubagentRunner, SubagentSpec,
    SubagentStatus,
};
pub use dispatch::{SidecarTool, SubagentTool};
pub use events::{SessionEvent, SubscribeMode};
pub use extensions::{Extension, ExtensionHook, ExtensionLoader, NoExtensions, StaticExtensions};
pub use hooks::{
    should_compact_with_hooks, HookExecution, HookFn, HookInfo, HookOptions, HookPriority,
    HookRegistry,
};
pub use recovery::{
    compact_entries, RecoveryAction, RecoveryOutcome, RecoveryResult, RecoverySignature,
    RecoveryState,
};
pub use telemetry::{Telemetry, TelemetryEvent};
