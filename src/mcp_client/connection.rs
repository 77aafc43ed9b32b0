//! One live connection to an MCP server process.
//!
//! A [`Connection`] owns the child process, the write half of its stdio, the
//! request registry, and the two background tasks (response router, stderr
//! logger). It is only handed out after the initialize handshake succeeded,
//! so nothing can write a tool call before the server has answered
//! `initialize`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use uuid::Uuid;

use super::config::ServerConfig;
use super::errors::McpError;
use super::lifecycle::{self, LaunchedProcess, ServerProcess, StderrTail};
use super::policy::ClientSettings;
use super::registry::{PendingResponse, RequestRegistry};
use super::router;
use super::transport::LineWriter;
use super::types::{
    InitializeParams, InitializeResult, JsonRpcNotification, JsonRpcRequest, JsonRpcResponse,
    METHOD_INITIALIZE, METHOD_INITIALIZED,
};

/// How long teardown waits for a background task to notice EOF before
/// aborting it.
const TASK_JOIN_TIMEOUT: Duration = Duration::from_millis(500);

// ─── RequestFault ────────────────────────────────────────────────────────────

/// Why a request on a connection produced no response.
#[derive(Debug)]
pub enum RequestFault {
    /// No response within the caller's timeout. The id has been abandoned.
    TimedOut,
    /// The pending slot was dropped (stdout EOF under `fail_pending`, or the
    /// connection was torn down).
    Closed,
    /// The request could not be written.
    Transport(McpError),
}

// ─── Connection ──────────────────────────────────────────────────────────────

pub struct Connection {
    id: Uuid,
    server_name: String,
    process: Mutex<ServerProcess>,
    /// Per-connection write lock, held for one line at a time.
    writer: Mutex<LineWriter>,
    registry: Arc<RequestRegistry>,
    /// Set by the router on stdout EOF.
    closed: Arc<AtomicBool>,
    shut_down: AtomicBool,
    router_task: StdMutex<Option<JoinHandle<()>>>,
    stderr_task: StdMutex<Option<JoinHandle<()>>>,
    stderr_tail: StderrTail,
    initialize: InitializeResult,
    connected_at: DateTime<Utc>,
    shutdown_grace: Duration,
}

impl Connection {
    /// Launch the server, start the background tasks and run the handshake.
    ///
    /// On handshake failure the half-open connection is torn down before the
    /// error is returned; the error carries process liveness and the stderr
    /// tail.
    pub async fn open(config: &ServerConfig, settings: &ClientSettings) -> Result<Self, McpError> {
        let LaunchedProcess {
            process,
            stdin,
            stdout,
            stderr,
        } = lifecycle::launch(config)?;

        let id = Uuid::new_v4();
        let registry = Arc::new(RequestRegistry::new(&config.name));
        let closed = Arc::new(AtomicBool::new(false));
        let stderr_tail = StderrTail::default();

        let router_task = router::spawn_router(
            config.name.clone(),
            stdout,
            registry.clone(),
            closed.clone(),
            settings.on_eof,
        );
        let stderr_task = stderr.map(|stderr| {
            lifecycle::spawn_stderr_logger(config.name.clone(), stderr, stderr_tail.clone())
        });

        let mut connection = Self {
            id,
            server_name: config.name.clone(),
            process: Mutex::new(process),
            writer: Mutex::new(LineWriter::new(&config.name, stdin)),
            registry,
            closed,
            shut_down: AtomicBool::new(false),
            router_task: StdMutex::new(Some(router_task)),
            stderr_task: StdMutex::new(stderr_task),
            stderr_tail,
            initialize: InitializeResult::default(),
            connected_at: Utc::now(),
            shutdown_grace: settings.shutdown_grace(),
        };

        let handshake_timeout = config.handshake_timeout(settings.handshake_timeout());
        match connection.handshake(settings, handshake_timeout).await {
            Ok(initialize) => {
                tracing::info!(
                    server = %config.name,
                    connection = %connection.id,
                    server_info = ?initialize.server_info,
                    protocol_version = ?initialize.protocol_version,
                    "MCP server initialized"
                );
                connection.initialize = initialize;
                connection.connected_at = Utc::now();
                Ok(connection)
            }
            Err(fault) => {
                let process_alive = connection.process_alive().await;
                connection.shutdown().await;
                let stderr = connection.stderr_tail.render();
                let err = match fault {
                    RequestFault::TimedOut => McpError::HandshakeTimeout {
                        name: config.name.clone(),
                        timeout_ms: handshake_timeout.as_millis() as u64,
                        process_alive,
                        stderr,
                        tool: None,
                        attempts: 0,
                    },
                    RequestFault::Closed => McpError::HandshakeFailure {
                        name: config.name.clone(),
                        reason: "server closed stdout before answering initialize".into(),
                        process_alive,
                        stderr,
                        tool: None,
                        attempts: 0,
                    },
                    RequestFault::Transport(e) => McpError::HandshakeFailure {
                        name: config.name.clone(),
                        reason: match e {
                            McpError::TransportFailure { reason, .. } => reason,
                            other => other.to_string(),
                        },
                        process_alive,
                        stderr,
                        tool: None,
                        attempts: 0,
                    },
                };
                tracing::error!(server = %config.name, error = %err, "MCP handshake failed");
                Err(err)
            }
        }
    }

    async fn handshake(
        &self,
        settings: &ClientSettings,
        timeout: Duration,
    ) -> Result<InitializeResult, RequestFault> {
        let params = InitializeParams::new(&settings.protocol_version, settings.client_info());
        let params = serde_json::to_value(params).map_err(|e| {
            RequestFault::Transport(self.transport_error(format!("failed to encode initialize: {e}")))
        })?;

        let response = self
            .request(
                |id| JsonRpcRequest::new(id, METHOD_INITIALIZE, Some(params)),
                timeout,
            )
            .await?;

        if let Some(err) = response.error {
            return Err(RequestFault::Transport(self.transport_error(format!(
                "initialize rejected [{}]: {}",
                err.code, err.message
            ))));
        }

        let initialize = match response.result {
            Some(result) => serde_json::from_value(result).unwrap_or_else(|e| {
                tracing::warn!(server = %self.server_name, error = %e, "unexpected initialize result shape");
                InitializeResult::default()
            }),
            None => InitializeResult::default(),
        };

        self.notify(METHOD_INITIALIZED, None)
            .await
            .map_err(RequestFault::Transport)?;

        Ok(initialize)
    }

    // ─── Requests ────────────────────────────────────────────────────────

    /// Send a request and wait up to `timeout` for its response.
    ///
    /// `build` receives the freshly allocated id. One deadline covers both
    /// the write (including waiting for the write lock) and the wait for the
    /// response; on expiry the id is abandoned so a late response is dropped
    /// by the router.
    pub async fn request<F>(&self, build: F, timeout: Duration) -> Result<JsonRpcResponse, RequestFault>
    where
        F: FnOnce(u64) -> JsonRpcRequest,
    {
        let deadline = Instant::now() + timeout;
        let Some(pending) = register_unless_closed(&self.registry, &self.closed, &self.shut_down) else {
            return Err(RequestFault::Transport(
                self.transport_error("connection is closed".into()),
            ));
        };
        let id = pending.id;
        let request = build(id);

        let written = tokio::time::timeout_at(deadline, async {
            let mut writer = self.writer.lock().await;
            writer.send(&request).await
        })
        .await;
        match written {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                self.registry.abandon(id);
                return Err(RequestFault::Transport(e));
            }
            Err(_) => {
                self.registry.abandon(id);
                // A partial line may be left in the pipe.
                self.closed.store(true, Ordering::SeqCst);
                tracing::warn!(
                    server = %self.server_name,
                    id,
                    method = %request.method,
                    timeout_ms = timeout.as_millis() as u64,
                    "request write timed out, server is not reading stdin"
                );
                return Err(RequestFault::TimedOut);
            }
        }
        tracing::debug!(server = %self.server_name, id, method = %request.method, "request sent");

        match tokio::time::timeout_at(deadline, pending.recv()).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) => Err(RequestFault::Closed),
            Err(_) => {
                self.registry.abandon(id);
                tracing::warn!(
                    server = %self.server_name,
                    id,
                    method = %request.method,
                    timeout_ms = timeout.as_millis() as u64,
                    "request timed out, abandoning id"
                );
                Err(RequestFault::TimedOut)
            }
        }
    }

    /// Send a notification (no id, no response).
    pub async fn notify(&self, method: &str, params: Option<Value>) -> Result<(), McpError> {
        let notification = JsonRpcNotification::new(method, params);
        self.writer.lock().await.send(&notification).await
    }

    // ─── State ───────────────────────────────────────────────────────────

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn server_name(&self) -> &str {
        &self.server_name
    }

    pub fn initialize_result(&self) -> &InitializeResult {
        &self.initialize
    }

    pub fn connected_at(&self) -> DateTime<Utc> {
        self.connected_at
    }

    pub fn pending_count(&self) -> usize {
        self.registry.len()
    }

    /// Whether stdout has closed or the connection was shut down.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst) || self.shut_down.load(Ordering::SeqCst)
    }

    /// Stdout still open and the child still running.
    pub async fn is_alive(&self) -> bool {
        if self.is_closed() {
            return false;
        }
        self.process_alive().await
    }

    /// Whether the child is still running, regardless of stream state.
    pub async fn process_alive(&self) -> bool {
        self.process.lock().await.is_alive()
    }

    /// Recent stderr output of the server.
    pub fn stderr_tail(&self) -> String {
        self.stderr_tail.render()
    }

    // ─── Teardown ────────────────────────────────────────────────────────

    /// Close stdin, terminate the process, stop both background tasks and
    /// fail whatever is still pending. Idempotent.
    pub async fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }
        tracing::info!(server = %self.server_name, connection = %self.id, "shutting down MCP server connection");

        // A writer stuck on a full pipe holds the lock; killing the process
        // unblocks it.
        match tokio::time::timeout(TASK_JOIN_TIMEOUT, self.writer.lock()).await {
            Ok(mut writer) => writer.close().await,
            Err(_) => {
                tracing::warn!(server = %self.server_name, "stdin writer busy, terminating without closing stdin");
            }
        }
        self.process.lock().await.terminate(self.shutdown_grace).await;

        join_task(&self.server_name, &self.router_task).await;
        join_task(&self.server_name, &self.stderr_task).await;

        let failed = self.registry.fail_all();
        if failed > 0 {
            tracing::debug!(server = %self.server_name, failed, "failed pending requests on teardown");
        }
    }

    fn transport_error(&self, reason: String) -> McpError {
        McpError::TransportFailure {
            server: self.server_name.clone(),
            tool: None,
            attempts: 0,
            process_alive: false,
            reason,
        }
    }
}

/// Register the next request unless the connection is already closed.
///
/// `closed` is checked again after registering: the router sets it before
/// draining the registry on EOF, so a request registered concurrently with
/// the drain is either drained or sees the flag here.
fn register_unless_closed(
    registry: &RequestRegistry,
    closed: &AtomicBool,
    shut_down: &AtomicBool,
) -> Option<PendingResponse> {
    let is_closed = || closed.load(Ordering::SeqCst) || shut_down.load(Ordering::SeqCst);
    if is_closed() {
        return None;
    }
    let pending = registry.register_next();
    if is_closed() {
        registry.abandon(pending.id);
        return None;
    }
    Some(pending)
}

/// Wait briefly for a background task to finish on its own, then abort it.
async fn join_task(server_name: &str, slot: &StdMutex<Option<JoinHandle<()>>>) {
    let handle = slot.lock().unwrap_or_else(PoisonError::into_inner).take();
    let Some(mut handle) = handle else {
        return;
    };
    if tokio::time::timeout(TASK_JOIN_TIMEOUT, &mut handle).await.is_err() {
        tracing::debug!(server = %server_name, "background task still running, aborting");
        handle.abort();
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
