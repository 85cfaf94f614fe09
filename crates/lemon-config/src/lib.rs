// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
mod keys;
mod loader;
mod schema;
mod secrets;

pub use keys::{resolve_api_key, resolve_api_key_with_env, provider_rule, ProviderRule};
pub use loader::load;
pub use schema::{
    AuthSource, CompactionSettings, ProviderSettings, Settings, StoreSettings, ToolsSettings,
    WasmSettings,
};
pub use secrets::{
    resolve_secret, EnvSecretStore, MemorySecretStore, SecretSource, SecretStore, MASTER_KEY_ENV,
};
