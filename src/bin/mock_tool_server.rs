//! Scriptable stdio MCP server for integration tests and smoke testing.
//!
//! Reads newline-delimited JSON-RPC from stdin, answers `initialize`, and
//! handles `tools/call` according to `--mode`. Exits on stdin EOF.
//!
//! Env:
//! - `MOCK_LAUNCH_LOG`: append one line per process launch.
//! - `MOCK_REQUEST_LOG`: append the method of every received message.
//! - `MOCK_INIT_DELAY_MS`: initialize delay in `slow-init` mode (default 2000).

use std::fs::OpenOptions;
use std::io::{BufRead, Write};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use clap::{Parser, ValueEnum};
use serde_json::{json, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Mode {
    /// Return the call arguments as the result. `delayMs` in the arguments
    /// delays the response without blocking other calls.
    Echo,
    /// Never answer tool calls.
    Silent,
    /// Never answer tool calls on the first launch, echo afterwards.
    SilentOnce,
    /// Answer every tool call with a JSON-RPC error.
    Error,
    /// Surround every response with junk lines and stray messages.
    Noisy,
    /// Delay the initialize response.
    SlowInit,
    /// Never answer initialize.
    NoInit,
    /// Exit as soon as a tool call arrives.
    CrashOnCall,
}

#[derive(Parser)]
#[command(name = "mock-tool-server")]
struct Cli {
    #[arg(long, value_enum, default_value_t = Mode::Echo)]
    mode: Mode,
}

type SharedStdout = Arc<Mutex<std::io::Stdout>>;

fn main() {
    let cli = Cli::parse();
    let launch = record_launch();
    let stdout: SharedStdout = Arc::new(Mutex::new(std::io::stdout()));

    eprintln!("mock-tool-server starting (mode {:?}, launch {launch})", cli.mode);

    let mut tool_calls = 0u32;
    for line in std::io::stdin().lock().lines() {
        let Ok(line) = line else { break };
        if line.trim().is_empty() {
            continue;
        }
        let Ok(message) = serde_json::from_str::<Value>(&line) else {
            eprintln!("mock-tool-server: ignoring unparseable line");
            continue;
        };

        let method = message.get("method").and_then(Value::as_str).unwrap_or("");
        append_log("MOCK_REQUEST_LOG", method);

        let Some(id) = message.get("id").cloned() else {
            // Notification.
            continue;
        };

        match method {
            "initialize" => match cli.mode {
                Mode::NoInit => {}
                Mode::SlowInit => {
                    let delay = std::env::var("MOCK_INIT_DELAY_MS")
                        .ok()
                        .and_then(|v| v.parse().ok())
                        .unwrap_or(2000);
                    std::thread::sleep(Duration::from_millis(delay));
                    respond(&stdout, &id, initialize_result());
                }
                _ => respond(&stdout, &id, initialize_result()),
            },
            "tools/call" => {
                tool_calls += 1;
                let arguments = message
                    .pointer("/params/arguments")
                    .cloned()
                    .unwrap_or(Value::Null);
                match cli.mode {
                    Mode::Silent => {}
                    Mode::SilentOnce if launch <= 1 => {}
                    Mode::Error => respond_error(&stdout, &id, -32602, "bad args"),
                    Mode::CrashOnCall => {
                        eprintln!("mock-tool-server: crashing on tool call {tool_calls}");
                        std::process::exit(1);
                    }
                    Mode::Noisy => {
                        write_line(&stdout, "Starting mock-tool-server on stdio...");
                        write_line(&stdout, "{not json");
                        write_json(
                            &stdout,
                            &json!({"jsonrpc": "2.0", "method": "notifications/message", "params": {"level": "info"}}),
                        );
                        write_json(&stdout, &json!({"jsonrpc": "2.0", "id": 9999, "result": "stray"}));
                        write_json(&stdout, &json!({"jsonrpc": "2.0", "id": id, "method": "ping"}));
                        respond(&stdout, &id, arguments);
                    }
                    _ => {
                        let delay = arguments
                            .get("delayMs")
                            .and_then(Value::as_u64)
                            .unwrap_or(0);
                        if delay == 0 {
                            respond(&stdout, &id, arguments);
                        } else {
                            let stdout = stdout.clone();
                            std::thread::spawn(move || {
                                std::thread::sleep(Duration::from_millis(delay));
                                respond(&stdout, &id, arguments);
                            });
                        }
                    }
                }
            }
            other => respond_error(&stdout, &id, -32601, &format!("method not found: {other}")),
        }
    }

    eprintln!("mock-tool-server: stdin closed, exiting");
}

fn initialize_result() -> Value {
    json!({
        "protocolVersion": "2024-11-05",
        "capabilities": {"tools": {}},
        "serverInfo": {"name": "mock-tool-server", "version": env!("CARGO_PKG_VERSION")},
    })
}

fn respond(stdout: &SharedStdout, id: &Value, result: Value) {
    write_json(stdout, &json!({"jsonrpc": "2.0", "id": id, "result": result}));
}

fn respond_error(stdout: &SharedStdout, id: &Value, code: i64, message: &str) {
    write_json(
        stdout,
        &json!({"jsonrpc": "2.0", "id": id, "error": {"code": code, "message": message}}),
    );
}

fn write_json(stdout: &SharedStdout, value: &Value) {
    write_line(stdout, &value.to_string());
}

fn write_line(stdout: &SharedStdout, line: &str) {
    let mut out = stdout.lock().unwrap_or_else(|e| e.into_inner());
    let _ = writeln!(out, "{line}");
    let _ = out.flush();
}

/// Append to the launch log and return this launch's 1-based number.
fn record_launch() -> usize {
    let Ok(path) = std::env::var("MOCK_LAUNCH_LOG") else {
        return 1;
    };
    append_log("MOCK_LAUNCH_LOG", &format!("launch {}", std::process::id()));
    std::fs::read_to_string(path)
        .map(|s| s.lines().count())
        .unwrap_or(1)
}

fn append_log(var: &str, line: &str) {
    let Ok(path) = std::env::var(var) else {
        return;
    };
    if let Ok(mut file) = OpenOptions::new().create(true).append(true).open(path) {
        let _ = writeln!(file, "{line}");
    }
}
