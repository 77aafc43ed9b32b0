use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};
use serde_json::Value;

use tool_bridge::logging::{self, LogTarget};
use tool_bridge::mcp_client::{find_config_path, CallPolicy, McpClient, McpConfig};

#[derive(Parser)]
#[command(name = "tool-bridge")]
#[command(about = "Call tools on locally launched MCP servers over stdio")]
#[command(version)]
struct Cli {
    /// Config file (default: $TOOL_BRIDGE_CONFIG, then mcp-config.* searched upward).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Write logs to tool-bridge.log in the data directory instead of stderr.
    #[arg(long, global = true, default_value_t = false)]
    log_file: bool,

    /// Debug-level logging for this crate (ignored when RUST_LOG is set).
    #[arg(short, long, global = true, default_value_t = false)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Call a tool and print its result as JSON.
    Call {
        server: String,
        tool: String,
        /// Tool arguments as a JSON object.
        #[arg(long, default_value = "{}")]
        args: String,
        /// Base per-attempt timeout in milliseconds.
        #[arg(long)]
        timeout_ms: Option<u64>,
        /// Maximum attempts, each on a fresh connection.
        #[arg(long)]
        attempts: Option<u32>,
        /// Linear backoff between attempts in milliseconds.
        #[arg(long)]
        backoff_ms: Option<u64>,
        /// Use the same timeout for every attempt instead of growing it.
        #[arg(long, default_value_t = false)]
        fixed_timeout: bool,
    },
    /// Connect to a server and print what it reports about itself.
    Check { server: String },
    /// Print a server's resolved launch config with env values masked.
    Show { server: String },
    /// List configured server names.
    Servers,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let target = if cli.log_file {
        LogTarget::File(logging::data_dir())
    } else {
        LogTarget::Stderr
    };
    logging::init_tracing(target, cli.verbose).context("failed to initialize logging")?;

    let config_path = match cli.config {
        Some(path) => path,
        None => {
            let cwd = std::env::current_dir().context("failed to read current directory")?;
            find_config_path(&cwd)?
        }
    };
    let config = McpConfig::load(&config_path)
        .with_context(|| format!("failed to load {}", config_path.display()))?;

    match cli.command {
        Command::Servers => {
            for name in config.configured_servers() {
                println!("{name}");
            }
            Ok(())
        }
        Command::Show { server } => {
            let resolved = config.resolve(&server)?;
            let masked: serde_json::Map<String, Value> = resolved
                .env
                .keys()
                .map(|key| (key.clone(), Value::String("********".into())))
                .collect();
            let effective = resolved.effective_policy(config.client.default_policy);
            let shown = serde_json::json!({
                "name": resolved.name,
                "command": resolved.command,
                "args": resolved.args,
                "env": masked,
                "workingDirectory": resolved.working_directory,
                "handshakeTimeoutMs": resolved.handshake_timeout(config.client.handshake_timeout()).as_millis() as u64,
                "policy": effective,
            });
            println!("{}", serde_json::to_string_pretty(&shown)?);
            Ok(())
        }
        Command::Check { server } => {
            let client = McpClient::new(config);
            let connected = client.ensure_connected(&server).await;
            let init = client.initialize_result(&server);
            let report = serde_json::json!({
                "server": server,
                "state": client.state(&server),
                "serverInfo": init.as_ref().and_then(|i| i.server_info.clone()),
                "protocolVersion": init.as_ref().and_then(|i| i.protocol_version.clone()),
                "capabilities": init.map(|i| i.capabilities),
            });
            client.shutdown_all().await;
            connected.with_context(|| format!("server '{server}' is not reachable"))?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(())
        }
        Command::Call {
            server,
            tool,
            args,
            timeout_ms,
            attempts,
            backoff_ms,
            fixed_timeout,
        } => {
            let arguments: Value =
                serde_json::from_str(&args).context("--args must be valid JSON")?;

            let overridden =
                timeout_ms.is_some() || attempts.is_some() || backoff_ms.is_some() || fixed_timeout;
            let policy = if overridden {
                let base = config
                    .resolve(&server)?
                    .effective_policy(config.client.default_policy);
                Some(CallPolicy {
                    timeout_base_ms: timeout_ms.unwrap_or(base.timeout_base_ms),
                    max_attempts: attempts.unwrap_or(base.max_attempts),
                    backoff_ms: backoff_ms.unwrap_or(base.backoff_ms),
                    escalate_timeout: base.escalate_timeout && !fixed_timeout,
                })
            } else {
                None
            };

            let client = McpClient::new(config);
            let outcome = client.call_detailed(&server, &tool, arguments, policy).await;
            client.shutdown_all().await;

            let outcome = outcome.with_context(|| format!("call to '{server}/{tool}' failed"))?;
            tracing::info!(
                server = %outcome.server,
                tool = %outcome.tool_name,
                attempts = outcome.attempts,
                elapsed_ms = outcome.elapsed_ms,
                "tool call finished"
            );
            println!("{}", serde_json::to_string_pretty(&outcome.result)?);
            Ok(())
        }
    }
}
