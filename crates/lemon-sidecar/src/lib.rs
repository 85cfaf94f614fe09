// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
mod channel;
mod host;
mod protocol;

pub use channel::{
    start_sidecar, ChannelError, ChannelState, SidecarChannel, SidecarStart, WasmStatus,
};
pub use host::{
    DenyAllHostHandler, HostCallHandler, SecretHostRouter, RESERVED_PREFIX, SECRET_EXISTS_TOOL,
    SECRET_RESOLVE_TOOL,
};
pub use protocol::{
    AcceptedResponse, Capability, DiscoverResponse, EventFrame, HelloResponse, InFrame,
    InvokeLimits, InvokeResponse, OutFrame, ResponseFrame, StoppedResponse, ToolDescriptor,
};
