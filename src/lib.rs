//! Stdio JSON-RPC client for locally launched MCP tool servers.
//!
//! ```no_run
//! use tool_bridge::{McpClient, McpConfig};
//!
//! # async fn demo() -> Result<(), tool_bridge::McpError> {
//! let config = McpConfig::load(std::path::Path::new("mcp-config.jsonc"))?;
//! let client = McpClient::new(config);
//! let result = client
//!     .call("notion", "API-post-search", serde_json::json!({"query": "roadmap"}), None)
//!     .await?;
//! println!("{result}");
//! client.shutdown_all().await;
//! # Ok(())
//! # }
//! ```

pub mod logging;
pub mod mcp_client;

pub use mcp_client::{
    CallPolicy, ClientSettings, ConnectionState, DispatchMode, EofPolicy, McpClient, McpConfig,
    McpError, ServerConfig, ToolCallOutcome,
};
