//! Server process lifecycle management.
//!
//! Spawns MCP server child processes with piped stdio, checks liveness,
//! drains stderr into the log, and terminates processes (close stdin, wait a
//! grace period, then kill).

use std::collections::VecDeque;
use std::process::Stdio;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::io::AsyncRead;
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::task::JoinHandle;

use super::config::ServerConfig;
use super::errors::McpError;
use super::transport::LineReader;

// ─── Constants ───────────────────────────────────────────────────────────────

/// Stderr lines retained for failure diagnostics.
const STDERR_TAIL_LINES: usize = 20;

/// Max characters of retained stderr rendered into an error message.
const STDERR_TAIL_CHARS: usize = 2000;

// ─── ServerProcess ───────────────────────────────────────────────────────────

/// A spawned server process and its stdio handles, before they are wired up.
pub struct LaunchedProcess {
    pub process: ServerProcess,
    pub stdin: ChildStdin,
    pub stdout: ChildStdout,
    pub stderr: Option<ChildStderr>,
}

/// Handle to a running server child process.
pub struct ServerProcess {
    name: String,
    child: Child,
    pid: Option<u32>,
}

impl ServerProcess {
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Non-blocking liveness check.
    pub fn is_alive(&mut self) -> bool {
        match self.child.try_wait() {
            Ok(None) => true,
            Ok(Some(_)) => false,
            Err(_) => false,
        }
    }

    /// Wait up to `grace` for the process to exit on its own, then kill it.
    ///
    /// Callers close stdin first so a well-behaved server can exit cleanly.
    /// Idempotent: an already-exited process is a no-op.
    pub async fn terminate(&mut self, grace: Duration) {
        if !self.is_alive() {
            return;
        }

        match tokio::time::timeout(grace, self.child.wait()).await {
            Ok(Ok(status)) => {
                tracing::debug!(server = %self.name, pid = ?self.pid, %status, "server exited");
            }
            _ => {
                tracing::warn!(
                    server = %self.name,
                    pid = ?self.pid,
                    grace_ms = grace.as_millis() as u64,
                    "server did not exit in time, killing"
                );
                if let Err(e) = self.child.kill().await {
                    tracing::warn!(server = %self.name, error = %e, "failed to kill server process");
                }
            }
        }
    }
}

// ─── Spawning ────────────────────────────────────────────────────────────────

/// Spawn a server process with stdin/stdout/stderr piped separately.
pub fn launch(config: &ServerConfig) -> Result<LaunchedProcess, McpError> {
    let mut cmd = Command::new(&config.command);
    cmd.args(&config.args);

    for (key, value) in &config.env {
        cmd.env(key, value);
    }

    if let Some(dir) = &config.working_directory {
        cmd.current_dir(dir);
    }

    // Windows: prevent console window from appearing for child processes
    #[cfg(target_os = "windows")]
    {
        const CREATE_NO_WINDOW: u32 = 0x08000000;
        cmd.creation_flags(CREATE_NO_WINDOW);
    }

    cmd.stdin(Stdio::piped());
    cmd.stdout(Stdio::piped());
    cmd.stderr(Stdio::piped());
    cmd.kill_on_drop(true);

    let mut child = cmd.spawn().map_err(|e| McpError::LaunchFailure {
        name: config.name.clone(),
        reason: format!("{}: {e}", config.command_line()),
    })?;

    let stdin = child.stdin.take().ok_or_else(|| McpError::LaunchFailure {
        name: config.name.clone(),
        reason: "failed to capture stdin".into(),
    })?;

    let stdout = child.stdout.take().ok_or_else(|| McpError::LaunchFailure {
        name: config.name.clone(),
        reason: "failed to capture stdout".into(),
    })?;

    let stderr = child.stderr.take();
    let pid = child.id();

    tracing::info!(
        server = %config.name,
        pid = ?pid,
        command = %config.command_line(),
        "launched MCP server process"
    );

    Ok(LaunchedProcess {
        process: ServerProcess {
            name: config.name.clone(),
            child,
            pid,
        },
        stdin,
        stdout,
        stderr,
    })
}

// ─── Stderr ──────────────────────────────────────────────────────────────────

/// Ring buffer of the most recent stderr lines.
#[derive(Debug, Clone, Default)]
pub struct StderrTail {
    lines: Arc<Mutex<VecDeque<String>>>,
}

impl StderrTail {
    fn push(&self, line: String) {
        let mut lines = self.lines.lock().unwrap_or_else(PoisonError::into_inner);
        if lines.len() == STDERR_TAIL_LINES {
            lines.pop_front();
        }
        lines.push_back(line);
    }

    /// Retained lines joined by newlines, keeping the last
    /// `STDERR_TAIL_CHARS` characters.
    pub fn render(&self) -> String {
        let joined = self
            .lines
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .cloned()
            .collect::<Vec<_>>()
            .join("\n");

        let count = joined.chars().count();
        if count <= STDERR_TAIL_CHARS {
            return joined;
        }
        let tail: String = joined.chars().skip(count - STDERR_TAIL_CHARS).collect();
        format!("(truncated)...{tail}")
    }
}

/// Drain a server's stderr into the log. Never feeds protocol state.
pub fn spawn_stderr_logger<R>(server_name: String, stderr: R, tail: StderrTail) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = LineReader::new(stderr);
        loop {
            match lines.read_line().await {
                Ok(Some(line)) => {
                    tracing::warn!(target: "tool_bridge::stderr", server = %server_name, "{line}");
                    tail.push(line);
                }
                Ok(None) => break,
                Err(e) => {
                    tracing::debug!(server = %server_name, error = %e, "stderr reader ended");
                    break;
                }
            }
        }
    })
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;

    #[test]
    fn test_stderr_tail_keeps_last_lines() {
        let tail = StderrTail::default();
        for i in 0..30 {
            tail.push(format!("line {i}"));
        }
        let rendered = tail.render();
        assert!(rendered.starts_with("line 10"));
        assert!(rendered.ends_with("line 29"));
        assert_eq!(rendered.lines().count(), STDERR_TAIL_LINES);
    }

    #[test]
    fn test_stderr_tail_truncates_long_output() {
        let tail = StderrTail::default();
        tail.push("x".repeat(5000));
        let rendered = tail.render();
        assert!(rendered.starts_with("(truncated)..."));
        assert_eq!(rendered.chars().count(), STDERR_TAIL_CHARS + "(truncated)...".len());
    }

    #[tokio::test]
    async fn test_stderr_logger_fills_tail() {
        let (mut writer, reader) = tokio::io::duplex(256);
        let tail = StderrTail::default();
        let task = spawn_stderr_logger("ocr".into(), reader, tail.clone());

        writer
            .write_all(b"Traceback (most recent call last):\nImportError: paddle\n")
            .await
            .unwrap();
        drop(writer);
        task.await.unwrap();

        assert_eq!(
            tail.render(),
            "Traceback (most recent call last):\nImportError: paddle"
        );
    }

    #[tokio::test]
    async fn test_launch_missing_executable() {
        let config = ServerConfig::new("ghost", "/nonexistent/bin/definitely-not-here");
        let err = launch(&config).err().unwrap();
        assert!(matches!(err, McpError::LaunchFailure { name, .. } if name == "ghost"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_terminate_is_idempotent() {
        let config = ServerConfig::new("cat", "cat");
        let LaunchedProcess {
            mut process, stdin, ..
        } = launch(&config).unwrap();
        assert!(process.is_alive());

        drop(stdin);
        process.terminate(Duration::from_secs(2)).await;
        assert!(!process.is_alive());
        process.terminate(Duration::from_secs(2)).await;
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_terminate_kills_after_grace() {
        let config = ServerConfig::new("sleeper", "sleep").with_args(["30"]);
        let mut launched = launch(&config).unwrap();
        launched
            .process
            .terminate(Duration::from_millis(100))
            .await;
        assert!(!launched.process.is_alive());
    }
}
