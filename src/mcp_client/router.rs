//! Response router: the background task that reads the server's stdout.
//!
//! Each line is parsed as a JSON-RPC message and, when it carries one of our
//! ids, handed to the [`RequestRegistry`]. Malformed lines, notifications,
//! server-initiated requests and unknown ids are logged and dropped; nothing
//! a server writes can stop the loop short of closing the stream.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde_json::Value;
use tokio::io::AsyncRead;
use tokio::task::JoinHandle;

use super::errors::McpError;
use super::policy::EofPolicy;
use super::registry::RequestRegistry;
use super::transport::LineReader;
use super::types::JsonRpcResponse;

/// What happened to one stdout line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteOutcome {
    /// Delivered to the waiting caller.
    Resolved(u64),
    /// Well-formed response whose id nobody is waiting for.
    UnknownId(Value),
    /// Server-to-client notification.
    Notification(String),
    /// Server-to-client request (has both `method` and `id`).
    ServerRequest(String),
    /// Not JSON, or JSON that is not a JSON-RPC message.
    Malformed,
}

/// Route a single stdout line.
pub fn route_line(server_name: &str, line: &str, registry: &RequestRegistry) -> RouteOutcome {
    let value: Value = match serde_json::from_str(line) {
        Ok(v) => v,
        Err(e) => {
            log_protocol_error(server_name, format!("unparseable line ({e}): {}", preview(line)));
            return RouteOutcome::Malformed;
        }
    };

    let Some(object) = value.as_object() else {
        log_protocol_error(server_name, format!("non-object message: {}", preview(line)));
        return RouteOutcome::Malformed;
    };

    if let Some(method) = object.get("method").and_then(Value::as_str) {
        let method = method.to_string();
        if object.contains_key("id") {
            tracing::debug!(server = %server_name, method = %method, "ignoring server-initiated request");
            return RouteOutcome::ServerRequest(method);
        }
        tracing::debug!(server = %server_name, method = %method, "ignoring server notification");
        return RouteOutcome::Notification(method);
    }

    if !object.contains_key("id") {
        log_protocol_error(server_name, format!("message without id or method: {}", preview(line)));
        return RouteOutcome::Malformed;
    }

    let response: JsonRpcResponse = match serde_json::from_value(value) {
        Ok(r) => r,
        Err(e) => {
            log_protocol_error(server_name, format!("invalid response object ({e}): {}", preview(line)));
            return RouteOutcome::Malformed;
        }
    };

    match response.numeric_id() {
        Some(id) => {
            if registry.resolve(id, response) {
                RouteOutcome::Resolved(id)
            } else {
                RouteOutcome::UnknownId(Value::from(id))
            }
        }
        None => {
            tracing::debug!(server = %server_name, id = %response.id, "response id is not one of ours");
            RouteOutcome::UnknownId(response.id)
        }
    }
}

/// Start the router loop for one connection.
///
/// On EOF or a read error the loop sets `closed` and exits. With
/// [`EofPolicy::FailPending`] it also drains the registry so waiters fail
/// immediately; otherwise they run into their own timeout.
pub fn spawn_router<R>(
    server_name: String,
    reader: R,
    registry: Arc<RequestRegistry>,
    closed: Arc<AtomicBool>,
    on_eof: EofPolicy,
) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = LineReader::new(reader);
        loop {
            match lines.read_line().await {
                Ok(Some(line)) => {
                    tracing::trace!(server = %server_name, line = %preview(&line), "<- stdout");
                    route_line(&server_name, &line, &registry);
                }
                Ok(None) => {
                    tracing::warn!(server = %server_name, "server stdout closed, response reader exiting");
                    break;
                }
                Err(e) => {
                    tracing::warn!(server = %server_name, error = %e, "error reading server stdout");
                    break;
                }
            }
        }

        closed.store(true, Ordering::SeqCst);
        if on_eof == EofPolicy::FailPending {
            let failed = registry.fail_all();
            if failed > 0 {
                tracing::warn!(server = %server_name, failed, "failed pending requests on stdout EOF");
            }
        }
    })
}

fn log_protocol_error(server_name: &str, reason: String) {
    let err = McpError::ProtocolError {
        server: server_name.to_string(),
        reason,
    };
    tracing::warn!(error = %err, "dropping stdout line");
}

/// First 200 chars of a line, for log messages.
fn preview(line: &str) -> String {
    const MAX: usize = 200;
    match line.char_indices().nth(MAX) {
        Some((idx, _)) => format!("{}...(truncated)", &line[..idx]),
        None => line.to_string(),
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::io::AsyncWriteExt;

    #[tokio::test]
    async fn test_scenario_echo_result() {
        let registry = RequestRegistry::new("echo");
        let pending = registry.register(3);
        let outcome = route_line(
            "echo",
            r#"{"jsonrpc":"2.0","id":3,"result":{"x":1}}"#,
            &registry,
        );
        assert_eq!(outcome, RouteOutcome::Resolved(3));
        let msg = pending.recv().await.unwrap();
        assert_eq!(msg.result, Some(serde_json::json!({"x": 1})));
    }

    #[test]
    fn test_unknown_id_does_not_touch_other_pending() {
        let registry = RequestRegistry::new("test");
        let _a = registry.register(1);
        let outcome = route_line("test", r#"{"jsonrpc":"2.0","id":42,"result":{}}"#, &registry);
        assert_eq!(outcome, RouteOutcome::UnknownId(serde_json::json!(42)));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_malformed_lines() {
        let registry = RequestRegistry::new("test");
        for line in [
            "Starting server on stdio...",
            "{not json",
            "[1,2,3]",
            r#"{"jsonrpc":"2.0"}"#,
        ] {
            assert_eq!(route_line("test", line, &registry), RouteOutcome::Malformed, "{line}");
        }
    }

    #[test]
    fn test_notification_and_server_request_are_not_responses() {
        let registry = RequestRegistry::new("test");
        let _pending = registry.register(1);

        let note = route_line(
            "test",
            r#"{"jsonrpc":"2.0","method":"notifications/message","params":{}}"#,
            &registry,
        );
        assert_eq!(note, RouteOutcome::Notification("notifications/message".into()));

        // A server request that reuses id 1 must not resolve our request 1.
        let req = route_line("test", r#"{"jsonrpc":"2.0","id":1,"method":"ping"}"#, &registry);
        assert_eq!(req, RouteOutcome::ServerRequest("ping".into()));
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn test_string_id_is_correlated() {
        let registry = RequestRegistry::new("test");
        let pending = registry.register(8);
        let outcome = route_line("test", r#"{"jsonrpc":"2.0","id":"8","result":true}"#, &registry);
        assert_eq!(outcome, RouteOutcome::Resolved(8));
        assert_eq!(pending.recv().await.unwrap().result, Some(serde_json::json!(true)));
    }

    #[test]
    fn test_preview_truncates_on_char_boundary() {
        let long = "é".repeat(300);
        let p = preview(&long);
        assert!(p.ends_with("...(truncated)"));
        assert_eq!(preview("short"), "short");
    }

    #[tokio::test]
    async fn test_router_survives_garbage_and_routes_out_of_order() {
        let (mut server_side, client_side) = tokio::io::duplex(4096);
        let registry = Arc::new(RequestRegistry::new("test"));
        let closed = Arc::new(AtomicBool::new(false));

        let first = registry.register(1);
        let second = registry.register(2);

        let task = spawn_router(
            "test".into(),
            client_side,
            registry.clone(),
            closed.clone(),
            EofPolicy::AwaitTimeout,
        );

        server_side
            .write_all(
                b"garbage line\n{\"jsonrpc\":\"2.0\",\"id\":99,\"result\":0}\n\
                  {\"jsonrpc\":\"2.0\",\"id\":2,\"result\":\"two\"}\n\
                  {\"jsonrpc\":\"2.0\",\"id\":1,\"result\":\"one\"}\n",
            )
            .await
            .unwrap();

        assert_eq!(second.recv().await.unwrap().result, Some(serde_json::json!("two")));
        assert_eq!(first.recv().await.unwrap().result, Some(serde_json::json!("one")));

        drop(server_side);
        task.await.unwrap();
        assert!(closed.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_eof_leaves_pending_for_timeout_by_default() {
        let (server_side, client_side) = tokio::io::duplex(64);
        let registry = Arc::new(RequestRegistry::new("test"));
        let closed = Arc::new(AtomicBool::new(false));
        let pending = registry.register(1);

        let task = spawn_router(
            "test".into(),
            client_side,
            registry.clone(),
            closed.clone(),
            EofPolicy::AwaitTimeout,
        );
        drop(server_side);
        task.await.unwrap();

        assert!(closed.load(Ordering::SeqCst));
        assert_eq!(registry.len(), 1);
        let waited = tokio::time::timeout(Duration::from_millis(50), pending.recv()).await;
        assert!(waited.is_err(), "pending request should still be waiting");
    }

    #[tokio::test]
    async fn test_eof_fail_pending_drains_registry() {
        let (server_side, client_side) = tokio::io::duplex(64);
        let registry = Arc::new(RequestRegistry::new("test"));
        let closed = Arc::new(AtomicBool::new(false));
        let pending = registry.register(1);

        let task = spawn_router(
            "test".into(),
            client_side,
            registry.clone(),
            closed.clone(),
            EofPolicy::FailPending,
        );
        drop(server_side);
        task.await.unwrap();

        assert!(registry.is_empty());
        assert!(pending.recv().await.is_err());
    }
}
