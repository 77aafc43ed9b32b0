//! Connection manager: one connection slot per named server.
//!
//! `ensure_connected` returns the live connection when there is one and
//! otherwise (re)establishes it. Connect attempts for the same server are
//! serialized: concurrent callers queue on the slot's connect lock and pick
//! up whatever connection the first caller produced, so two processes are
//! never launched for one server name.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex, MutexGuard, PoisonError};

use serde::Serialize;
use tokio::sync::Mutex;
use uuid::Uuid;

use super::config::{McpConfig, ServerConfig};
use super::connection::Connection;
use super::errors::McpError;
use super::policy::ClientSettings;
use super::types::InitializeResult;

// ─── ConnectionState ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Ready,
    Failed,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Ready => "ready",
            ConnectionState::Failed => "failed",
        };
        f.write_str(s)
    }
}

// ─── ServerSlot ──────────────────────────────────────────────────────────────

#[derive(Default)]
struct SlotStatus {
    state: Option<ConnectionState>,
    current: Option<Arc<Connection>>,
    /// Resolved once, on first connect.
    config: Option<Arc<ServerConfig>>,
    launches: u32,
}

#[derive(Default)]
struct ServerSlot {
    status: StdMutex<SlotStatus>,
    /// Held for the whole of a connect or teardown.
    connect_lock: Mutex<()>,
}

impl ServerSlot {
    fn status(&self) -> MutexGuard<'_, SlotStatus> {
        self.status.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn current(&self) -> Option<Arc<Connection>> {
        self.status().current.clone()
    }

    fn launches(&self) -> u32 {
        self.status().launches
    }

    fn set_state(&self, state: ConnectionState) {
        self.status().state = Some(state);
    }
}

// ─── ConnectionManager ───────────────────────────────────────────────────────

pub struct ConnectionManager {
    config: McpConfig,
    settings: ClientSettings,
    slots: StdMutex<HashMap<String, Arc<ServerSlot>>>,
}

impl ConnectionManager {
    pub fn new(config: McpConfig, settings: ClientSettings) -> Self {
        Self {
            config,
            settings,
            slots: StdMutex::new(HashMap::new()),
        }
    }

    pub fn settings(&self) -> &ClientSettings {
        &self.settings
    }

    pub fn config(&self) -> &McpConfig {
        &self.config
    }

    /// The resolved launch config for a server, resolved on first use.
    ///
    /// Names absent from the config never get a slot. A configured server
    /// whose entry fails to resolve is marked `Failed`.
    pub fn server_config(&self, server: &str) -> Result<Arc<ServerConfig>, McpError> {
        if let Some(config) = self
            .existing_slot(server)
            .and_then(|slot| slot.status().config.clone())
        {
            return Ok(config);
        }

        if !self.config.servers.contains_key(server) {
            return Err(McpError::ConfigNotFound {
                name: server.to_string(),
            });
        }

        let slot = self.slot(server);
        match self.config.resolve(server) {
            Ok(resolved) => {
                let mut status = slot.status();
                Ok(status.config.get_or_insert(Arc::new(resolved)).clone())
            }
            Err(e) => {
                slot.set_state(ConnectionState::Failed);
                Err(e)
            }
        }
    }

    /// Return the ready connection for `server`, connecting if needed.
    pub async fn ensure_connected(&self, server: &str) -> Result<Arc<Connection>, McpError> {
        let config = self.server_config(server)?;
        let slot = self.slot(server);

        if let Some(conn) = slot.current() {
            if conn.is_alive().await {
                return Ok(conn);
            }
        }

        let _connecting = slot.connect_lock.lock().await;

        // Another caller may have connected while we waited for the lock.
        if let Some(conn) = slot.current() {
            if conn.is_alive().await {
                return Ok(conn);
            }
            tracing::warn!(server, connection = %conn.id(), "MCP server connection is no longer alive, reconnecting");
            slot.status().current = None;
            conn.shutdown().await;
        }

        slot.set_state(ConnectionState::Connecting);
        let launch = {
            let mut status = slot.status();
            status.launches += 1;
            status.launches
        };
        tracing::info!(server, launch, "connecting to MCP server");

        match Connection::open(&config, &self.settings).await {
            Ok(conn) => {
                let conn = Arc::new(conn);
                let mut status = slot.status();
                status.current = Some(conn.clone());
                status.state = Some(ConnectionState::Ready);
                Ok(conn)
            }
            Err(e) => {
                slot.set_state(ConnectionState::Failed);
                Err(e)
            }
        }
    }

    /// Tear down the server's connection if it is still `connection_id`.
    ///
    /// A connection that has already been replaced is left alone.
    pub async fn teardown_if_current(&self, server: &str, connection_id: Uuid) -> bool {
        let Some(slot) = self.existing_slot(server) else {
            return false;
        };
        let _connecting = slot.connect_lock.lock().await;

        let conn = {
            let mut status = slot.status();
            let is_current = status
                .current
                .as_ref()
                .is_some_and(|conn| conn.id() == connection_id);
            if is_current {
                status.state = Some(ConnectionState::Disconnected);
                status.current.take()
            } else {
                None
            }
        };

        match conn {
            Some(conn) => {
                conn.shutdown().await;
                true
            }
            None => false,
        }
    }

    /// Tear down whatever connection the server has.
    pub async fn shutdown(&self, server: &str) {
        let Some(slot) = self.existing_slot(server) else {
            return;
        };
        let _connecting = slot.connect_lock.lock().await;

        let conn = {
            let mut status = slot.status();
            if status.state.is_some() {
                status.state = Some(ConnectionState::Disconnected);
            }
            status.current.take()
        };
        if let Some(conn) = conn {
            conn.shutdown().await;
        }
    }

    /// Tear down every connection concurrently.
    pub async fn shutdown_all(&self) {
        let names: Vec<String> = self
            .lock_slots()
            .keys()
            .cloned()
            .collect();
        futures::future::join_all(names.iter().map(|name| self.shutdown(name))).await;
    }

    // ─── Diagnostics ─────────────────────────────────────────────────────

    /// Current state of a server's connection.
    ///
    /// A `Ready` connection whose stdout has since closed reports
    /// `Disconnected`.
    pub fn state(&self, server: &str) -> ConnectionState {
        let Some(slot) = self.existing_slot(server) else {
            return ConnectionState::Disconnected;
        };
        let (state, closed) = {
            let status = slot.status();
            let closed = status.current.as_ref().is_some_and(|conn| conn.is_closed());
            (status.state, closed)
        };
        match state {
            Some(ConnectionState::Ready) if closed => ConnectionState::Disconnected,
            Some(state) => state,
            None => ConnectionState::Disconnected,
        }
    }

    /// How many processes have been launched for a server.
    pub fn launch_count(&self, server: &str) -> u32 {
        self.existing_slot(server)
            .map(|slot| slot.launches())
            .unwrap_or(0)
    }

    pub fn pending_count(&self, server: &str) -> usize {
        self.existing_slot(server)
            .and_then(|slot| slot.current())
            .map(|conn| conn.pending_count())
            .unwrap_or(0)
    }

    pub fn initialize_result(&self, server: &str) -> Option<InitializeResult> {
        self.existing_slot(server)
            .and_then(|slot| slot.current())
            .map(|conn| conn.initialize_result().clone())
    }

    fn slot(&self, server: &str) -> Arc<ServerSlot> {
        self.lock_slots()
            .entry(server.to_string())
            .or_default()
            .clone()
    }

    fn existing_slot(&self, server: &str) -> Option<Arc<ServerSlot>> {
        self.lock_slots().get(server).cloned()
    }

    fn lock_slots(&self) -> MutexGuard<'_, HashMap<String, Arc<ServerSlot>>> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
