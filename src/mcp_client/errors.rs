//! MCP client error types.
//!
//! Every surfaced failure carries the server name plus whatever diagnostic
//! context was available when it happened (attempt count, tool name, whether
//! the child process was still alive, recent stderr).

use thiserror::Error;

/// Errors that can occur during MCP client operations.
#[derive(Debug, Error)]
pub enum McpError {
    /// The server name is absent from the loaded configuration.
    #[error("no configuration for server '{name}'")]
    ConfigNotFound {
        name: String,
    },

    /// The server entry exists but cannot be launched over stdio.
    #[error("invalid configuration for server '{name}': {reason}")]
    ConfigInvalid {
        name: String,
        reason: String,
    },

    /// Configuration file could not be located, read or parsed.
    #[error("config error: {reason}")]
    ConfigError {
        reason: String,
    },

    /// The server process could not be started.
    #[error("failed to launch server '{name}': {reason}")]
    LaunchFailure {
        name: String,
        reason: String,
    },

    /// The `initialize` response did not arrive in time.
    #[error(
        "server '{name}' initialize timed out after {timeout_ms}ms{} (process alive: {process_alive}){}",
        call_suffix(.tool, .attempts),
        stderr_suffix(.stderr)
    )]
    HandshakeTimeout {
        name: String,
        timeout_ms: u64,
        process_alive: bool,
        stderr: String,
        /// Tool call that triggered the connect, if any.
        tool: Option<String>,
        /// Attempt of that tool call; 0 outside a call.
        attempts: u32,
    },

    /// The handshake failed for a reason other than a timeout.
    #[error(
        "server '{name}' initialization failed{}: {reason} (process alive: {process_alive}){}",
        call_suffix(.tool, .attempts),
        stderr_suffix(.stderr)
    )]
    HandshakeFailure {
        name: String,
        reason: String,
        process_alive: bool,
        stderr: String,
        tool: Option<String>,
        attempts: u32,
    },

    /// Every attempt of a tool call timed out.
    #[error(
        "tool call '{tool}' on server '{server}' timed out after {attempts} attempt(s), last timeout {timeout_ms}ms (process alive: {process_alive})"
    )]
    CallTimeout {
        server: String,
        tool: String,
        attempts: u32,
        timeout_ms: u64,
        process_alive: bool,
    },

    /// The server answered with a JSON-RPC `error` object. Never retried.
    #[error("server '{server}' rejected tool call '{tool}' on attempt {attempts} [{code}]: {message}")]
    RemoteError {
        server: String,
        tool: String,
        attempts: u32,
        code: i64,
        message: String,
        data: Option<serde_json::Value>,
    },

    /// Write or read failure on the process streams.
    #[error(
        "transport error for server '{server}' after {attempts} attempt(s): {reason} (process alive: {process_alive})"
    )]
    TransportFailure {
        server: String,
        tool: Option<String>,
        attempts: u32,
        process_alive: bool,
        reason: String,
    },

    /// A stdout line could not be interpreted. Only ever logged by the router.
    #[error("protocol error from server '{server}': {reason}")]
    ProtocolError {
        server: String,
        reason: String,
    },
}

impl McpError {
    /// Transport-level faults that the call executor retries with a fresh
    /// connection.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            McpError::CallTimeout { .. }
                | McpError::TransportFailure { .. }
                | McpError::HandshakeTimeout { .. }
                | McpError::HandshakeFailure { .. }
        )
    }

    /// Failures raised while establishing a connection.
    pub fn is_connect_failure(&self) -> bool {
        matches!(
            self,
            McpError::LaunchFailure { .. }
                | McpError::HandshakeTimeout { .. }
                | McpError::HandshakeFailure { .. }
        )
    }

    /// Misconfiguration that no amount of retrying will fix.
    pub fn is_startup_fatal(&self) -> bool {
        matches!(
            self,
            McpError::ConfigNotFound { .. }
                | McpError::ConfigInvalid { .. }
                | McpError::ConfigError { .. }
                | McpError::LaunchFailure { .. }
        )
    }

    /// Tag a connection-level failure with the tool call and attempt it
    /// happened on.
    pub(crate) fn with_call_context(self, tool: &str, attempt: u32) -> Self {
        let tool = Some(tool.to_string());
        match self {
            McpError::TransportFailure {
                server,
                process_alive,
                reason,
                ..
            } => McpError::TransportFailure {
                server,
                tool,
                attempts: attempt,
                process_alive,
                reason,
            },
            McpError::HandshakeTimeout {
                name,
                timeout_ms,
                process_alive,
                stderr,
                ..
            } => McpError::HandshakeTimeout {
                name,
                timeout_ms,
                process_alive,
                stderr,
                tool,
                attempts: attempt,
            },
            McpError::HandshakeFailure {
                name,
                reason,
                process_alive,
                stderr,
                ..
            } => McpError::HandshakeFailure {
                name,
                reason,
                process_alive,
                stderr,
                tool,
                attempts: attempt,
            },
            other => other,
        }
    }

    /// Record whether the server process was still running.
    pub(crate) fn with_process_alive(mut self, alive: bool) -> Self {
        if let McpError::TransportFailure { process_alive, .. } = &mut self {
            *process_alive = alive;
        }
        self
    }
}

fn call_suffix(tool: &Option<String>, attempts: &u32) -> String {
    match tool {
        Some(tool) => format!(" during tool call '{tool}' (attempt {attempts})"),
        None => String::new(),
    }
}

fn stderr_suffix(stderr: &str) -> String {
    if stderr.is_empty() {
        String::new()
    } else {
        format!(" | stderr: {}", stderr.trim())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(McpError::CallTimeout {
            server: "ocr".into(),
            tool: "ocr".into(),
            attempts: 3,
            timeout_ms: 1000,
            process_alive: true,
        }
        .is_retryable());
        assert!(McpError::TransportFailure {
            server: "notion".into(),
            tool: None,
            attempts: 1,
            process_alive: false,
            reason: "broken pipe".into(),
        }
        .is_retryable());
        assert!(!McpError::RemoteError {
            server: "notion".into(),
            tool: "API-post-search".into(),
            attempts: 1,
            code: -32602,
            message: "bad args".into(),
            data: None,
        }
        .is_retryable());
        assert!(!McpError::LaunchFailure {
            name: "notion".into(),
            reason: "No such file or directory".into(),
        }
        .is_retryable());
    }

    #[test]
    fn test_connect_failure_and_fatal_classification() {
        let launch = McpError::LaunchFailure {
            name: "ocr".into(),
            reason: "not found".into(),
        };
        assert!(launch.is_connect_failure());
        assert!(launch.is_startup_fatal());

        let handshake = McpError::HandshakeTimeout {
            name: "ocr".into(),
            timeout_ms: 500,
            process_alive: true,
            stderr: String::new(),
            tool: None,
            attempts: 0,
        };
        assert!(handshake.is_connect_failure());
        assert!(!handshake.is_startup_fatal());

        let invalid = McpError::ConfigInvalid {
            name: "remote".into(),
            reason: "url transport is not supported".into(),
        };
        assert!(invalid.is_startup_fatal());
        assert!(!invalid.is_connect_failure());
    }

    #[test]
    fn test_handshake_message_includes_stderr() {
        let err = McpError::HandshakeFailure {
            name: "ocr".into(),
            reason: "server closed stdout".into(),
            process_alive: false,
            stderr: "ModuleNotFoundError: paddleocr\n".into(),
            tool: None,
            attempts: 0,
        };
        let msg = err.to_string();
        assert!(msg.contains("process alive: false"));
        assert!(msg.ends_with("| stderr: ModuleNotFoundError: paddleocr"));
    }

    #[test]
    fn test_with_call_context_tags_transport_failure() {
        let err = McpError::TransportFailure {
            server: "notion".into(),
            tool: None,
            attempts: 0,
            process_alive: false,
            reason: "write failed".into(),
        }
        .with_call_context("API-get-self", 2)
        .with_process_alive(true);
        match err {
            McpError::TransportFailure {
                tool,
                attempts,
                process_alive,
                ..
            } => {
                assert_eq!(tool.as_deref(), Some("API-get-self"));
                assert_eq!(attempts, 2);
                assert!(process_alive);
            }
            other => panic!("expected TransportFailure, got {other:?}"),
        }
    }

    #[test]
    fn test_with_call_context_tags_handshake_failures() {
        let err = McpError::HandshakeTimeout {
            name: "ocr".into(),
            timeout_ms: 1000,
            process_alive: true,
            stderr: String::new(),
            tool: None,
            attempts: 0,
        }
        .with_call_context("extract", 3);
        assert!(
            matches!(&err, McpError::HandshakeTimeout { tool: Some(tool), attempts: 3, .. } if tool == "extract"),
            "{err:?}"
        );
        assert!(err
            .to_string()
            .contains("during tool call 'extract' (attempt 3)"));

        let err = McpError::HandshakeFailure {
            name: "ocr".into(),
            reason: "server closed stdout".into(),
            process_alive: false,
            stderr: String::new(),
            tool: None,
            attempts: 0,
        }
        .with_call_context("extract", 1);
        assert!(matches!(err, McpError::HandshakeFailure { attempts: 1, .. }));
    }

    #[test]
    fn test_with_process_alive_leaves_other_variants() {
        let err = McpError::ConfigNotFound { name: "x".into() }.with_process_alive(true);
        assert!(matches!(err, McpError::ConfigNotFound { .. }));
    }
}
