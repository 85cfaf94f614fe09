// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::path::{Path, PathBuf};

use anyhow::Context;
use tracing::debug;

use crate::Settings;

/// Ordered list of settings file locations searched from lowest to highest
/// priority.  Later files override earlier ones.
fn settings_search_paths() -> Vec<PathBuf> {
    let mut paths = Vec::new();

    // 1. System-wide default
    paths.push(PathBuf::from("/etc/lemon/settings.yaml"));
    paths.push(PathBuf::from("/etc/lemon/settings.yml"));

    // 2. XDG / home
    if let Some(home) = dirs::home_dir() {
        paths.push(home.join(".config/lemon/settings.yaml"));
        paths.push(home.join(".config/lemon/settings.yml"));
    }
    if let Some(cfg) = dirs::config_dir() {
        paths.push(cfg.join("lemon/settings.yaml"));
        paths.push(cfg.join("lemon/settings.yml"));
    }

    // 3. Workspace-local
    paths.push(PathBuf::from(".lemon/settings.yaml"));
    paths.push(PathBuf::from(".lemon/settings.yml"));

    paths
}

/// Load settings by merging all discovered YAML files.
/// The `extra` argument may provide an explicit path (e.g. a CLI flag).
pub fn load(extra: Option<&Path>) -> anyhow::Result<Settings> {
    let mut merged = serde_yaml::Value::Mapping(serde_yaml::Mapping::new());

    for path in settings_search_paths() {
        if path.is_file() {
            debug!(path = %path.display(), "loading settings layer");
            merge_file(&mut merged, &path)?;
        }
    }

    if let Some(p) = extra {
        debug!(path = %p.display(), "loading explicit settings");
        merge_file(&mut merged, p)?;
    }

    // Deserialize the merged YAML value into Settings, falling back to
    // defaults when no files were found.
    let settings: Settings =
        if matches!(merged, serde_yaml::Value::Mapping(ref m) if m.is_empty()) {
            Settings::default()
        } else {
            serde_yaml::from_value(merged).unwrap_or_default()
        };
    Ok(settings)
}

fn merge_file(dst: &mut serde_yaml::Value, path: &Path) -> anyhow::Result<()> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("reading {}", path.display()))?;
    let layer: serde_yaml::Value =
        serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))?;
    merge_yaml(dst, layer);
    Ok(())
}

/// Deep-merge `src` into `dst`; src wins on scalar conflicts.
fn merge_yaml(dst: &mut serde_yaml::Value, src: serde_yaml::Value) {
    match (dst, src) {
        (serde_yaml::Value::Mapping(d), serde_yaml::Value::Mapping(s)) => {
            for (k, v) in s {
                match d.get_mut(&k) {
                    Some(existing) => merge_yaml(existing, v),
                    None => {
                        d.insert(k, v);
                    }
                }
            }
        }
        (d, s) => *d = s,
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
