//! MCP Client: high-level interface for tool execution.
//!
//! `call` composes connection setup, id allocation, the request write, a
//! bounded wait and the retry policy. Transport faults (timeouts, broken
//! streams, failed handshakes) tear the connection down and retry on a fresh
//! process; a JSON-RPC `error` from the server is returned immediately.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::Instant;

use serde_json::Value;
use tokio::sync::{Mutex, OwnedMutexGuard};
use uuid::Uuid;

use super::config::{McpConfig, ServerConfig};
use super::connection::RequestFault;
use super::errors::McpError;
use super::manager::{ConnectionManager, ConnectionState};
use super::policy::{CallPolicy, ClientSettings, DispatchMode};
use super::types::{InitializeResult, JsonRpcRequest, ServerInfo, ToolCallOutcome};

// ─── McpClient ───────────────────────────────────────────────────────────────

/// Client for every server named in one [`McpConfig`].
pub struct McpClient {
    manager: ConnectionManager,
    /// Per-server call gate used in [`DispatchMode::Serialized`].
    gates: StdMutex<HashMap<String, Arc<Mutex<()>>>>,
}

/// Failure of a single attempt, with the connection it ran on.
struct AttemptFailure {
    error: McpError,
    connection: Option<Uuid>,
}

impl McpClient {
    /// Create a client using the config file's `client` settings.
    pub fn new(config: McpConfig) -> Self {
        let settings = config.client.clone();
        Self::with_settings(config, settings)
    }

    /// Create a client with explicit settings.
    pub fn with_settings(config: McpConfig, settings: ClientSettings) -> Self {
        Self {
            manager: ConnectionManager::new(config, settings),
            gates: StdMutex::new(HashMap::new()),
        }
    }

    pub fn settings(&self) -> &ClientSettings {
        self.manager.settings()
    }

    // ─── Lifecycle ───────────────────────────────────────────────────────

    /// Connect to a server ahead of the first call.
    pub async fn ensure_connected(&self, server: &str) -> Result<(), McpError> {
        self.manager.ensure_connected(server).await.map(|_| ())
    }

    /// Shut down a specific server.
    pub async fn shutdown_server(&self, server: &str) {
        self.manager.shutdown(server).await;
    }

    /// Shut down all servers gracefully.
    pub async fn shutdown_all(&self) {
        self.manager.shutdown_all().await;
    }

    // ─── Tool Execution ──────────────────────────────────────────────────

    /// Call a tool and return its `result`.
    ///
    /// `policy` overrides the server's configured policy for this call.
    pub async fn call(
        &self,
        server: &str,
        tool_name: &str,
        arguments: Value,
        policy: Option<CallPolicy>,
    ) -> Result<Value, McpError> {
        self.call_detailed(server, tool_name, arguments, policy)
            .await
            .map(|outcome| outcome.result)
    }

    /// Call a tool and return the result with attempt and timing data.
    pub async fn call_detailed(
        &self,
        server: &str,
        tool_name: &str,
        arguments: Value,
        policy: Option<CallPolicy>,
    ) -> Result<ToolCallOutcome, McpError> {
        let start = Instant::now();
        let config = self.manager.server_config(server)?;
        let policy =
            policy.unwrap_or_else(|| config.effective_policy(self.settings().default_policy));
        let max_attempts = policy.attempts();

        let mut attempt = 1;
        loop {
            let gate = self.dispatch_gate(server).await;
            match self
                .attempt(server, tool_name, &arguments, &policy, attempt)
                .await
            {
                Ok(result) => {
                    let elapsed_ms = start.elapsed().as_millis() as u64;
                    tracing::debug!(server, tool = tool_name, attempt, elapsed_ms, "tool call completed");
                    return Ok(ToolCallOutcome {
                        server: server.to_string(),
                        tool_name: tool_name.to_string(),
                        result,
                        attempts: attempt,
                        elapsed_ms,
                    });
                }
                Err(AttemptFailure { error, connection }) => {
                    if !error.is_retryable() {
                        tracing::error!(server, tool = tool_name, attempt, error = %error, "tool call failed");
                        return Err(error);
                    }
                    if attempt >= max_attempts {
                        tracing::error!(server, tool = tool_name, attempt, error = %error, "tool call failed, attempts exhausted");
                        // The next call must not reuse a hung process.
                        if let Some(id) = connection {
                            self.manager.teardown_if_current(server, id).await;
                        }
                        return Err(error);
                    }

                    tracing::warn!(
                        server,
                        tool = tool_name,
                        attempt,
                        max_attempts,
                        error = %error,
                        "tool call attempt failed, reconnecting"
                    );
                    if let Some(id) = connection {
                        self.manager.teardown_if_current(server, id).await;
                    }
                    drop(gate);

                    let backoff = policy.backoff_after_attempt(attempt);
                    if !backoff.is_zero() {
                        tokio::time::sleep(backoff).await;
                    }
                    attempt += 1;
                }
            }
        }
    }

    async fn attempt(
        &self,
        server: &str,
        tool_name: &str,
        arguments: &Value,
        policy: &CallPolicy,
        attempt: u32,
    ) -> Result<Value, AttemptFailure> {
        let conn = self
            .manager
            .ensure_connected(server)
            .await
            .map_err(|error| AttemptFailure {
                error: error.with_call_context(tool_name, attempt),
                connection: None,
            })?;

        let timeout = policy.timeout_for_attempt(attempt);
        let fail = |error: McpError| AttemptFailure {
            error,
            connection: Some(conn.id()),
        };

        let response = match conn
            .request(
                |id| JsonRpcRequest::tool_call(id, tool_name, arguments.clone()),
                timeout,
            )
            .await
        {
            Ok(response) => response,
            Err(RequestFault::TimedOut) => {
                return Err(fail(McpError::CallTimeout {
                    server: server.to_string(),
                    tool: tool_name.to_string(),
                    attempts: attempt,
                    timeout_ms: timeout.as_millis() as u64,
                    process_alive: conn.process_alive().await,
                }))
            }
            Err(RequestFault::Closed) => {
                return Err(fail(McpError::TransportFailure {
                    server: server.to_string(),
                    tool: Some(tool_name.to_string()),
                    attempts: attempt,
                    process_alive: conn.process_alive().await,
                    reason: "connection closed before the response arrived".into(),
                }))
            }
            Err(RequestFault::Transport(e)) => {
                let process_alive = conn.process_alive().await;
                return Err(fail(
                    e.with_call_context(tool_name, attempt)
                        .with_process_alive(process_alive),
                ));
            }
        };

        if let Some(err) = response.error {
            return Err(fail(McpError::RemoteError {
                server: server.to_string(),
                tool: tool_name.to_string(),
                attempts: attempt,
                code: err.code,
                message: err.message,
                data: err.data,
            }));
        }

        Ok(response.result.unwrap_or(Value::Null))
    }

    /// In serialized mode, the server's gate is held for one whole attempt
    /// including any teardown it triggers, but not across the backoff sleep.
    async fn dispatch_gate(&self, server: &str) -> Option<OwnedMutexGuard<()>> {
        if self.settings().dispatch == DispatchMode::Pipelined {
            return None;
        }
        let gate = self
            .gates
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(server.to_string())
            .or_default()
            .clone();
        Some(gate.lock_owned().await)
    }

    // ─── Queries ─────────────────────────────────────────────────────────

    pub fn state(&self, server: &str) -> ConnectionState {
        self.manager.state(server)
    }

    /// `serverInfo` reported by the server's initialize response.
    pub fn server_info(&self, server: &str) -> Option<ServerInfo> {
        self.initialize_result(server)
            .and_then(|init| init.server_info)
    }

    pub fn initialize_result(&self, server: &str) -> Option<InitializeResult> {
        self.manager.initialize_result(server)
    }

    /// Outstanding requests on the server's current connection.
    pub fn pending_count(&self, server: &str) -> usize {
        self.manager.pending_count(server)
    }

    /// Processes launched for the server so far.
    pub fn launch_count(&self, server: &str) -> u32 {
        self.manager.launch_count(server)
    }

    /// Get the list of all configured server names.
    pub fn configured_servers(&self) -> Vec<String> {
        self.manager.config().configured_servers()
    }

    /// Resolve a server's launch config without connecting.
    pub fn resolve_config(&self, server: &str) -> Result<ServerConfig, McpError> {
        self.manager.config().resolve(server)
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mcp_client::config::ServerEntry;

    fn entry(command: &str) -> ServerEntry {
        ServerEntry {
            command: Some(command.into()),
            ..ServerEntry::default()
        }
    }

    fn test_client(entries: Vec<(&str, ServerEntry)>) -> McpClient {
        let servers = entries
            .into_iter()
            .map(|(name, entry)| (name.to_string(), entry))
            .collect();
        McpClient::new(McpConfig::from_servers(servers))
    }

    #[test]
    fn test_new_client_empty() {
        let client = test_client(vec![]);
        assert!(client.configured_servers().is_empty());
        assert_eq!(client.state("anything"), ConnectionState::Disconnected);
        assert_eq!(client.pending_count("anything"), 0);
    }

    #[test]
    fn test_configured_servers() {
        let client = test_client(vec![
            ("paddleocr", entry("python")),
            ("notion", entry("npx")),
        ]);
        assert_eq!(client.configured_servers(), vec!["notion", "paddleocr"]);
    }

    #[tokio::test]
    async fn test_unknown_server_is_config_not_found() {
        let client = test_client(vec![]);
        let err = client
            .call("nope", "echo", serde_json::json!({}), None)
            .await
            .unwrap_err();
        assert!(matches!(err, McpError::ConfigNotFound { name } if name == "nope"));
        assert_eq!(client.state("nope"), ConnectionState::Disconnected);
        assert_eq!(client.launch_count("nope"), 0);
    }

    #[tokio::test]
    async fn test_url_server_fails_fast() {
        let client = test_client(vec![(
            "remote",
            ServerEntry {
                url: Some("https://mcp.example.com".into()),
                ..ServerEntry::default()
            },
        )]);
        let err = client
            .call("remote", "search", Value::Null, None)
            .await
            .unwrap_err();
        assert!(err.is_startup_fatal());
        assert_eq!(client.launch_count("remote"), 0);
        assert_eq!(client.state("remote"), ConnectionState::Failed);
    }

    #[tokio::test]
    async fn test_launch_failure_is_not_retried() {
        let client = test_client(vec![("ghost", entry("/nonexistent/bin/tool-server"))]);
        let err = client
            .call("ghost", "echo", Value::Null, Some(CallPolicy::heavyweight()))
            .await
            .unwrap_err();
        assert!(matches!(err, McpError::LaunchFailure { .. }));
        assert_eq!(client.launch_count("ghost"), 1);
        assert_eq!(client.state("ghost"), ConnectionState::Failed);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_echo_call_returns_result() {
        let script = r#"
            read init
            echo '{"jsonrpc":"2.0","id":1,"result":{"serverInfo":{"name":"sh-echo"}}}'
            read initialized
            read call
            echo '{"jsonrpc":"2.0","id":2,"result":{"x":1}}'
            while read line; do :; done
        "#;
        let client = test_client(vec![(
            "echo",
            ServerEntry {
                command: Some("sh".into()),
                args: vec!["-c".into(), script.into()],
                ..ServerEntry::default()
            },
        )]);

        let outcome = client
            .call_detailed("echo", "echo", serde_json::json!({"x": 1}), None)
            .await
            .unwrap();
        assert_eq!(outcome.result, serde_json::json!({"x": 1}));
        assert_eq!(outcome.attempts, 1);
        assert_eq!(
            client.server_info("echo").and_then(|i| i.name).as_deref(),
            Some("sh-echo")
        );
        client.shutdown_all().await;
        assert_eq!(client.state("echo"), ConnectionState::Disconnected);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_call_times_out_when_server_stops_reading() {
        let script = r#"
            read init
            echo '{"jsonrpc":"2.0","id":1,"result":{}}'
            read initialized
            exec sleep 30
        "#;
        let servers = [(
            "stuck".to_string(),
            ServerEntry {
                command: Some("sh".into()),
                args: vec!["-c".into(), script.into()],
                ..ServerEntry::default()
            },
        )]
        .into_iter()
        .collect();
        let settings = ClientSettings {
            shutdown_grace_seconds: 1,
            ..ClientSettings::default()
        };
        let client = McpClient::with_settings(McpConfig::from_servers(servers), settings);
        let policy = CallPolicy {
            timeout_base_ms: 300,
            max_attempts: 1,
            backoff_ms: 0,
            escalate_timeout: false,
        };

        let started = Instant::now();
        let err = tokio::time::timeout(
            std::time::Duration::from_secs(10),
            client.call(
                "stuck",
                "ocr",
                serde_json::json!({ "image": "x".repeat(1024 * 1024) }),
                Some(policy),
            ),
        )
        .await
        .expect("call must finish within its own timeout")
        .unwrap_err();

        assert!(
            matches!(&err, McpError::CallTimeout { tool, attempts: 1, timeout_ms: 300, process_alive: true, .. } if tool == "ocr"),
            "{err:?}"
        );
        assert_eq!(client.state("stuck"), ConnectionState::Disconnected);
        assert_eq!(client.pending_count("stuck"), 0);
        assert!(started.elapsed() < std::time::Duration::from_secs(5));
    }
}
