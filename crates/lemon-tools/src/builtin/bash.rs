// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::process::Command;
use tracing::debug;

use lemon_store::{ProcessRecord, ProcessStatus, ProcessStore};

use crate::tool::{AbortSignal, Tool, ToolResult};

const OUTPUT_LIMIT: usize = 100_000;

/// Shell execution with a wall-clock timeout and abort support.
///
/// The child runs in its own process group so that cancellation kills the
/// whole tree, not just the shell.  Every spawn is registered in the process
/// store (when one is attached) with its output mirrored into the record's
/// bounded log buffer.
pub struct BashTool {
    pub timeout_secs: u64,
    pub store: Option<Arc<ProcessStore>>,
}

impl Default for BashTool {
    fn default() -> Self {
        Self {
            timeout_secs: 30,
            store: None,
        }
    }
}

#[async_trait]
impl Tool for BashTool {
    fn name(&self) -> &str {
        "bash"
    }

    fn description(&self) -> &str {
        "Executes a shell command and returns its combined output.\n\
         Output is limited to 100,000 characters and truncated beyond that.\n\
         The default timeout is 30 seconds; pass timeout_secs for longer runs.\n\
         Non-zero exit codes are reported as errors with the exit code included."
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "command": {
                    "type": "string",
                    "description": "The shell command to execute"
                },
                "workdir": {
                    "type": "string",
                    "description": "Working directory (optional, defaults to the session cwd)"
                },
                "timeout_secs": {
                    "type": "integer",
                    "description": "Execution timeout in seconds (optional)"
                }
            },
            "required": ["command"],
            "additionalProperties": false
        })
    }

    async fn execute(
        &self,
        _call_id: &str,
        params: Value,
        cwd: &Path,
        signal: AbortSignal,
    ) -> ToolResult {
        let command = match params.get("command").and_then(Value::as_str) {
            Some(c) => c.to_string(),
            None => return ToolResult::err("missing 'command' argument"),
        };
        let workdir = params
            .get("workdir")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| cwd.display().to_string());
        let timeout = params
            .get("timeout_secs")
            .and_then(Value::as_u64)
            .unwrap_or(self.timeout_secs);

        debug!(cmd = %command, "bash tool");

        let mut cmd = Command::new("sh");
        cmd.arg("-c")
            .arg(&command)
            .current_dir(&workdir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        put_in_own_process_group(&mut cmd);

        let mut child = match cmd.spawn() {
            Ok(c) => c,
            Err(e) => return ToolResult::err(format!("spawn error: {e}")),
        };
        let pid = child.id();

        let record_id = self.store.as_ref().map(|store| {
            let mut record = ProcessRecord::new(&command, &workdir);
            record.status = ProcessStatus::Running;
            record.os_pid = pid;
            record.started_at = Some(chrono::Utc::now());
            store.insert(record)
        });

        let outcome = tokio::select! {
            biased;
            _ = signal.cancelled() => {
                kill_process_group(pid);
                Outcome::Aborted
            }
            _ = tokio::time::sleep(Duration::from_secs(timeout)) => {
                kill_process_group(pid);
                Outcome::TimedOut
            }
            result = child.wait_with_output() => match result {
                Ok(output) => Outcome::Finished(output),
                Err(e) => Outcome::WaitFailed(e.to_string()),
            },
        };

        match outcome {
            Outcome::Finished(output) => {
                let stdout = String::from_utf8_lossy(&output.stdout);
                let stderr = String::from_utf8_lossy(&output.stderr);
                let exit_code = output.status.code();

                if let (Some(store), Some(id)) = (&self.store, &record_id) {
                    let lines: Vec<String> = stdout
                        .lines()
                        .chain(stderr.lines())
                        .map(str::to_string)
                        .collect();
                    store.append_log(id, lines);
                    store.update(id, |r| {
                        r.status = if output.status.success() {
                            ProcessStatus::Completed
                        } else {
                            ProcessStatus::Error
                        };
                        r.exit_code = exit_code;
                        r.completed_at = Some(chrono::Utc::now());
                    });
                }

                let mut content = String::new();
                if !stdout.is_empty() {
                    content.push_str(&truncate(&stdout, OUTPUT_LIMIT));
                }
                if !stderr.is_empty() {
                    if !content.is_empty() {
                        content.push('\n');
                    }
                    content.push_str("[stderr]\n");
                    content.push_str(&truncate(&stderr, OUTPUT_LIMIT));
                }
                if content.is_empty() {
                    content = format!("[exit {}]", exit_code.unwrap_or(-1));
                }

                let details = details(exit_code, false);
                if output.status.success() {
                    ToolResult::ok(content).with_details(details)
                } else {
                    ToolResult::err(format!("[exit {}]\n{content}", exit_code.unwrap_or(-1)))
                        .with_details(details)
                }
            }
            Outcome::Aborted => {
                self.finish_record(&record_id, ProcessStatus::Killed, None);
                ToolResult::err("command aborted").with_details(details(None, true))
            }
            Outcome::TimedOut => {
                self.finish_record(&record_id, ProcessStatus::Killed, None);
                ToolResult::err(format!("timeout after {timeout}s"))
                    .with_details(details(None, true))
            }
            Outcome::WaitFailed(e) => {
                self.finish_record(&record_id, ProcessStatus::Error, None);
                ToolResult::err(format!("wait error: {e}"))
            }
        }
    }
}

enum Outcome {
    Finished(std::process::Output),
    Aborted,
    TimedOut,
    WaitFailed(String),
}

impl BashTool {
    fn finish_record(
        &self,
        record_id: &Option<String>,
        status: ProcessStatus,
        exit_code: Option<i32>,
    ) {
        if let (Some(store), Some(id)) = (&self.store, record_id) {
            store.update(id, |r| {
                r.status = status;
                r.exit_code = exit_code;
                r.completed_at = Some(chrono::Utc::now());
            });
        }
    }
}

fn details(exit_code: Option<i32>, cancelled: bool) -> serde_json::Map<String, Value> {
    let mut m = serde_json::Map::new();
    m.insert(
        "exit_code".to_string(),
        exit_code.map(|c| json!(c)).unwrap_or(Value::Null),
    );
    m.insert("cancelled".to_string(), json!(cancelled));
    m
}

fn truncate(s: &str, limit: usize) -> String {
    if s.len() <= limit {
        s.to_string()
    } else {
        format!("{}...[truncated {} bytes]", &s[..limit], s.len() - limit)
    }
}

#[cfg(unix)]
fn put_in_own_process_group(cmd: &mut Command) {
    // The whole tree must die on abort; a fresh process group makes
    // kill(-pgid) reach grandchildren the shell may have spawned.
    unsafe {
        cmd.pre_exec(|| {
            libc::setpgid(0, 0);
            Ok(())
        });
    }
}

#[cfg(not(unix))]
fn put_in_own_process_group(_cmd: &mut Command) {}

#[cfg(unix)]
fn kill_process_group(pid: Option<u32>) {
    if let Some(pid) = pid {
        unsafe {
            libc::kill(-(pid as i32), libc::SIGKILL);
        }
    }
}

#[cfg(not(unix))]
fn kill_process_group(_pid: Option<u32>) {}

// ─── Unit tests ──────────────────────────────────────────────────────────────
