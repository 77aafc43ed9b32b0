//! Request registry: correlates JSON-RPC ids with waiting callers.
//!
//! Provides:
//! - A per-connection monotonic id generator
//! - `register` / `resolve` / `abandon` over a mutex-protected map of
//!   one-shot result slots
//!
//! The map lock is never held across an `.await`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use tokio::sync::oneshot;

use super::types::JsonRpcResponse;

// ─── PendingRequest ──────────────────────────────────────────────────────────

/// Registry-side record of an outstanding request.
#[derive(Debug)]
struct PendingRequest {
    slot: oneshot::Sender<JsonRpcResponse>,
    created_at: DateTime<Utc>,
}

/// Caller-side handle for an outstanding request.
#[derive(Debug)]
pub struct PendingResponse {
    pub id: u64,
    pub created_at: DateTime<Utc>,
    rx: oneshot::Receiver<JsonRpcResponse>,
}

/// The slot was dropped without a response (abandoned or drained).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotClosed;

impl PendingResponse {
    /// Wait for the correlated response.
    pub async fn recv(self) -> Result<JsonRpcResponse, SlotClosed> {
        self.rx.await.map_err(|_| SlotClosed)
    }
}

// ─── RequestRegistry ─────────────────────────────────────────────────────────

/// Concurrency-safe `id → pending slot` map plus the id counter.
#[derive(Debug)]
pub struct RequestRegistry {
    server_name: String,
    next_id: AtomicU64,
    pending: Mutex<HashMap<u64, PendingRequest>>,
}

impl RequestRegistry {
    /// Create an empty registry; ids start at 1.
    pub fn new(server_name: &str) -> Self {
        Self {
            server_name: server_name.to_string(),
            next_id: AtomicU64::new(1),
            pending: Mutex::new(HashMap::new()),
        }
    }

    /// Allocate the next request id.
    pub fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Allocate an id and register a slot for it in one step.
    pub fn register_next(&self) -> PendingResponse {
        let id = self.next_id();
        self.register(id)
    }

    /// Register a result slot for `id`.
    ///
    /// Ids come from [`next_id`](Self::next_id) and are never reused while
    /// outstanding; registering an id twice replaces the stale slot, whose
    /// waiter then observes [`SlotClosed`].
    pub fn register(&self, id: u64) -> PendingResponse {
        let (tx, rx) = oneshot::channel();
        let created_at = Utc::now();
        let previous = self.lock().insert(
            id,
            PendingRequest {
                slot: tx,
                created_at,
            },
        );
        if previous.is_some() {
            tracing::warn!(server = %self.server_name, id, "replaced an outstanding request slot");
        }
        PendingResponse { id, created_at, rx }
    }

    /// Remove the entry for `id` and fulfil it.
    ///
    /// Returns `false` when no entry exists (late response after a timeout,
    /// or a spurious id); that case is logged and otherwise ignored.
    pub fn resolve(&self, id: u64, message: JsonRpcResponse) -> bool {
        let entry = self.lock().remove(&id);
        let Some(entry) = entry else {
            tracing::debug!(server = %self.server_name, id, "no pending request for response id, dropping");
            return false;
        };

        let waited_ms = (Utc::now() - entry.created_at).num_milliseconds();
        if entry.slot.send(message).is_err() {
            tracing::debug!(server = %self.server_name, id, "caller stopped waiting before response arrived");
            return false;
        }
        tracing::trace!(server = %self.server_name, id, waited_ms, "resolved pending request");
        true
    }

    /// Remove the entry for `id` without resolving it.
    pub fn abandon(&self, id: u64) -> bool {
        self.lock().remove(&id).is_some()
    }

    /// Drop every pending slot; their waiters observe [`SlotClosed`].
    pub fn fail_all(&self) -> usize {
        let drained: Vec<_> = self.lock().drain().collect();
        drained.len()
    }

    /// Number of outstanding requests.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Creation time of the oldest outstanding request.
    pub fn oldest_pending(&self) -> Option<DateTime<Utc>> {
        self.lock().values().map(|p| p.created_at).min()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<u64, PendingRequest>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn response(id: u64, result: serde_json::Value) -> JsonRpcResponse {
        JsonRpcResponse {
            jsonrpc: Some("2.0".into()),
            id: serde_json::json!(id),
            result: Some(result),
            error: None,
        }
    }

    #[test]
    fn test_next_id_is_monotonic_from_one() {
        let registry = RequestRegistry::new("test");
        assert_eq!(registry.next_id(), 1);
        assert_eq!(registry.next_id(), 2);
        assert_eq!(registry.next_id(), 3);
    }

    #[test]
    fn test_each_registry_has_its_own_counter() {
        let a = RequestRegistry::new("a");
        let b = RequestRegistry::new("b");
        a.next_id();
        a.next_id();
        assert_eq!(b.next_id(), 1);
    }

    #[tokio::test]
    async fn test_resolve_fulfils_matching_slot() {
        let registry = RequestRegistry::new("test");
        let pending = registry.register(3);
        assert!(registry.resolve(3, response(3, serde_json::json!({"x": 1}))));
        let msg = pending.recv().await.unwrap();
        assert_eq!(msg.result, Some(serde_json::json!({"x": 1})));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_resolve_unknown_id_is_noop() {
        let registry = RequestRegistry::new("test");
        let _pending = registry.register(1);
        assert!(!registry.resolve(99, response(99, serde_json::json!(null))));
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn test_abandon_blocks_late_response() {
        let registry = RequestRegistry::new("test");
        let pending = registry.register(5);
        assert!(registry.abandon(5));
        assert!(!registry.abandon(5));
        assert!(!registry.resolve(5, response(5, serde_json::json!("late"))));
        assert_eq!(pending.recv().await, Err(SlotClosed));
    }

    #[tokio::test]
    async fn test_fail_all_closes_every_slot() {
        let registry = RequestRegistry::new("test");
        let a = registry.register_next();
        let b = registry.register_next();
        assert_eq!(registry.fail_all(), 2);
        assert_eq!(a.recv().await, Err(SlotClosed));
        assert_eq!(b.recv().await, Err(SlotClosed));
        assert!(registry.oldest_pending().is_none());
    }

    #[tokio::test]
    async fn test_concurrent_ids_resolve_their_own_slot() {
        let registry = Arc::new(RequestRegistry::new("test"));
        let handles: Vec<_> = (0..64).map(|_| registry.register_next()).collect();

        // Resolve in reverse order from another task.
        let ids: Vec<u64> = handles.iter().map(|h| h.id).collect();
        let resolver = {
            let registry = registry.clone();
            tokio::spawn(async move {
                for id in ids.into_iter().rev() {
                    assert!(registry.resolve(id, response(id, serde_json::json!(id))));
                }
            })
        };

        for handle in handles {
            let id = handle.id;
            let msg = handle.recv().await.unwrap();
            assert_eq!(msg.result, Some(serde_json::json!(id)));
        }
        resolver.await.unwrap();
        assert!(registry.is_empty());
    }
}
