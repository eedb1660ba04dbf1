//! The agent as an opaque coroutine.
//!
//! Modeled as a single request/response: a prompt, a working directory, an
//! allow-list of tool names, and a deadline. The concrete adapter invokes
//! the agent CLI as a subprocess: `std::process::Command` plus a watcher
//! thread that kills the child on deadline or cancellation, rather than a
//! tmux session — this system only needs the final text and exit code,
//! not a human-watchable pane.

use crate::retry::{classify_agent_message, Cancel, ErrorKind};
use std::io::Write;
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// A single invocation of the agent.
#[derive(Debug, Clone)]
pub struct AgentRequest {
    pub prompt: String,
    pub cwd: PathBuf,
    pub allowed_tools: Vec<String>,
    pub deadline: Duration,
}

/// What the agent returned.
#[derive(Debug, Clone)]
pub struct AgentResult {
    pub text: String,
    pub session_id: String,
}

/// Error raised by an agent invocation.
#[derive(Debug, Clone)]
pub struct AgentError {
    pub message: String,
}

impl AgentError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    pub fn classify(&self) -> ErrorKind {
        classify_agent_message(&self.message)
    }
}

impl std::fmt::Display for AgentError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.message)
    }
}
impl std::error::Error for AgentError {}

impl From<crate::retry::Cancelled> for AgentError {
    fn from(_: crate::retry::Cancelled) -> Self {
        AgentError::new("operation cancelled")
    }
}

pub type AResult<T> = Result<T, AgentError>;

/// The agent's interface, as seen by the phase runtime.
pub trait Agent: Send + Sync {
    fn invoke(&self, cancel: &Cancel, req: &AgentRequest) -> AResult<AgentResult>;
}

/// Invokes the agent CLI (default: `claude`) as a subprocess, writing the
/// prompt to stdin and reading a JSON result from stdout.
///
/// Expected stdout shape: `{"result": "...", "session_id": "..."}` — the
/// same envelope `claude --print --output-format json` emits. Anything else
/// is treated as plain text and handed back as
/// the raw text with an empty session id, since phase handlers are required
/// to tolerate non-ideal completions.
pub struct ClaudeCliAgent {
    pub command: String,
}

impl ClaudeCliAgent {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
        }
    }
}

impl Default for ClaudeCliAgent {
    fn default() -> Self {
        Self::new("claude")
    }
}

impl Agent for ClaudeCliAgent {
    fn invoke(&self, cancel: &Cancel, req: &AgentRequest) -> AResult<AgentResult> {
        if cancel.is_cancelled() {
            return Err(AgentError::new("operation cancelled"));
        }

        let mut cmd = Command::new(&self.command);
        cmd.current_dir(&req.cwd)
            .arg("--print")
            .arg("--output-format")
            .arg("json");
        if !req.allowed_tools.is_empty() {
            cmd.arg("--allowedTools").arg(req.allowed_tools.join(","));
        }
        cmd.stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let mut child = cmd
            .spawn()
            .map_err(|e| AgentError::new(format!("failed to spawn agent: {e}")))?;

        if let Some(mut stdin) = child.stdin.take() {
            let _ = stdin.write_all(req.prompt.as_bytes());
        }

        let killed = Arc::new(AtomicBool::new(false));
        let deadline_hit = Arc::new(AtomicBool::new(false));
        let pid = child.id();
        let watcher_killed = killed.clone();
        let watcher_deadline = deadline_hit.clone();
        let cancel_clone = cancel.clone();
        let deadline = req.deadline;
        let watcher = std::thread::spawn(move || {
            let start = Instant::now();
            loop {
                if watcher_killed.load(Ordering::SeqCst) {
                    return;
                }
                if cancel_clone.is_cancelled() {
                    kill_pid(pid);
                    return;
                }
                if start.elapsed() >= deadline {
                    watcher_deadline.store(true, Ordering::SeqCst);
                    kill_pid(pid);
                    return;
                }
                std::thread::sleep(Duration::from_millis(100));
            }
        });

        let output = child
            .wait_with_output()
            .map_err(|e| AgentError::new(format!("agent process error: {e}")));
        killed.store(true, Ordering::SeqCst);
        let _ = watcher.join();

        if deadline_hit.load(Ordering::SeqCst) {
            return Err(AgentError::new("agent invocation exceeded its deadline"));
        }
        if cancel.is_cancelled() {
            return Err(AgentError::new("operation cancelled"));
        }

        let output = output?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            return Err(AgentError::new(format!(
                "agent exited with {:?}: {stderr}",
                output.status.code()
            )));
        }

        let stdout = String::from_utf8_lossy(&output.stdout).to_string();
        Ok(parse_agent_output(&stdout))
    }
}

fn parse_agent_output(stdout: &str) -> AgentResult {
    match serde_json::from_str::<serde_json::Value>(stdout.trim()) {
        Ok(v) => AgentResult {
            text: v["result"].as_str().unwrap_or(stdout).to_string(),
            session_id: v["session_id"].as_str().unwrap_or("").to_string(),
        },
        Err(_) => AgentResult {
            text: stdout.to_string(),
            session_id: String::new(),
        },
    }
}

#[cfg(unix)]
fn kill_pid(pid: u32) {
    unsafe {
        libc::kill(pid as i32, libc::SIGTERM);
    }
}

#[cfg(not(unix))]
fn kill_pid(_pid: u32) {}
