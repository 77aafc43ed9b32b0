//! MCP Client: JSON-RPC over stdio for locally launched tool servers.
//!
//! This module handles:
//! - Resolving named server configs (with `${VAR}` substitution)
//! - Spawning server child processes and draining their stderr
//! - Line-delimited JSON-RPC 2.0 over process stdio
//! - Correlating responses with callers by request id
//! - The initialize handshake and reconnect-on-failure
//! - Tool calls with timeout, retry and backoff

pub mod client;
pub mod config;
pub mod connection;
pub mod errors;
pub mod lifecycle;
pub mod manager;
pub mod policy;
pub mod registry;
pub mod router;
pub mod transport;
pub mod types;

// Re-exports for convenience
pub use client::McpClient;
pub use config::{find_config_path, ConfigFormat, McpConfig, ServerConfig, ServerEntry};
pub use errors::McpError;
pub use manager::ConnectionState;
pub use policy::{CallPolicy, ClientSettings, DispatchMode, EofPolicy};
pub use types::{InitializeResult, ServerInfo, ToolCallOutcome};
