//! Server configuration loading and resolution.
//!
//! Reads an `mcpServers` map from a JSON/JSONC or YAML file and turns a named
//! entry into a launchable [`ServerConfig`], substituting `${VAR}` and
//! `${VAR:default}` placeholders from the process environment.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::errors::McpError;
use super::policy::{CallPolicy, ClientSettings};

/// Env var naming an explicit config file.
pub const CONFIG_PATH_ENV: &str = "TOOL_BRIDGE_CONFIG";

/// File names searched for when no explicit path is given, in order.
const CONFIG_FILE_NAMES: [&str; 4] = [
    "mcp-config.jsonc",
    "mcp-config.json",
    "mcp-config.yaml",
    "mcp-config.yml",
];

// ─── Public Types ────────────────────────────────────────────────────────────

/// One entry of the `mcpServers` map, exactly as written in the file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerEntry {
    #[serde(default)]
    pub command: Option<String>,
    /// Remote transport. Present only so it can be rejected explicitly.
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default, alias = "cwd")]
    pub working_directory: Option<String>,
    /// Base per-call timeout for this server.
    #[serde(default)]
    pub timeout_seconds: Option<u64>,
    #[serde(default)]
    pub handshake_timeout_seconds: Option<u64>,
    #[serde(default)]
    pub policy: Option<CallPolicy>,
}

/// A resolved, launchable stdio server definition. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    pub name: String,
    pub command: String,
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub working_directory: Option<PathBuf>,
    pub timeout_seconds: Option<u64>,
    pub handshake_timeout_seconds: Option<u64>,
    pub policy: Option<CallPolicy>,
}

impl ServerConfig {
    /// Minimal stdio config, mostly useful for embedding and tests.
    pub fn new(name: &str, command: &str) -> Self {
        Self {
            name: name.to_string(),
            command: command.to_string(),
            args: Vec::new(),
            env: BTreeMap::new(),
            working_directory: None,
            timeout_seconds: None,
            handshake_timeout_seconds: None,
            policy: None,
        }
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_env(mut self, key: &str, value: &str) -> Self {
        self.env.insert(key.to_string(), value.to_string());
        self
    }

    pub fn with_policy(mut self, policy: CallPolicy) -> Self {
        self.policy = Some(policy);
        self
    }

    pub fn with_handshake_timeout_seconds(mut self, secs: u64) -> Self {
        self.handshake_timeout_seconds = Some(secs);
        self
    }

    /// Policy used when the caller does not pass one.
    ///
    /// An explicit server `policy` wins; otherwise `timeoutSeconds` replaces
    /// the base timeout of the client default.
    pub fn effective_policy(&self, client_default: CallPolicy) -> CallPolicy {
        if let Some(policy) = self.policy {
            return policy;
        }
        match self.timeout_seconds {
            Some(secs) => client_default.with_timeout_base_ms(secs.saturating_mul(1000)),
            None => client_default,
        }
    }

    pub fn handshake_timeout(&self, client_default: Duration) -> Duration {
        self.handshake_timeout_seconds
            .map(Duration::from_secs)
            .unwrap_or(client_default)
    }

    /// Human-readable command line for log messages.
    pub fn command_line(&self) -> String {
        std::iter::once(self.command.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// File format of a config file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigFormat {
    /// JSON, with `//` and `/* */` comments and trailing commas tolerated.
    Json,
    Yaml,
}

impl ConfigFormat {
    pub fn from_path(path: &Path) -> Self {
        match path.extension().and_then(|e| e.to_str()) {
            Some("yaml") | Some("yml") => ConfigFormat::Yaml,
            _ => ConfigFormat::Json,
        }
    }
}

/// The loaded configuration: named server entries plus client settings.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct McpConfig {
    #[serde(rename = "mcpServers", alias = "servers")]
    pub servers: HashMap<String, ServerEntry>,
    #[serde(default)]
    pub client: ClientSettings,
    /// Directory relative working directories are resolved against.
    #[serde(skip)]
    base_dir: Option<PathBuf>,
}

// ─── Loading ─────────────────────────────────────────────────────────────────

impl McpConfig {
    /// Build a config from in-memory entries.
    pub fn from_servers(servers: HashMap<String, ServerEntry>) -> Self {
        Self {
            servers,
            client: ClientSettings::default(),
            base_dir: None,
        }
    }

    /// Load and parse a config file.
    pub fn load(path: &Path) -> Result<Self, McpError> {
        let raw = std::fs::read_to_string(path).map_err(|e| McpError::ConfigError {
            reason: format!("failed to read {}: {e}", path.display()),
        })?;

        let mut config = Self::parse(&raw, ConfigFormat::from_path(path)).map_err(|e| {
            McpError::ConfigError {
                reason: format!("{}: {e}", path.display()),
            }
        })?;
        config.base_dir = path.parent().map(Path::to_path_buf);

        tracing::info!(
            path = %path.display(),
            count = config.servers.len(),
            servers = ?config.configured_servers(),
            "loaded MCP server config"
        );
        Ok(config)
    }

    /// Parse config text in the given format.
    pub fn parse(raw: &str, format: ConfigFormat) -> Result<Self, McpError> {
        let parsed = match format {
            ConfigFormat::Json => serde_json::from_str::<McpConfig>(&strip_jsonc(raw))
                .map_err(|e| format!("failed to parse config: {e}")),
            ConfigFormat::Yaml => serde_yaml::from_str::<McpConfig>(raw)
                .map_err(|e| format!("failed to parse config: {e}")),
        };
        parsed.map_err(|reason| McpError::ConfigError { reason })
    }

    /// Sorted names of every configured server.
    pub fn configured_servers(&self) -> Vec<String> {
        let mut names: Vec<String> = self.servers.keys().cloned().collect();
        names.sort();
        names
    }

    // ─── Resolution ──────────────────────────────────────────────────────

    /// Resolve a named server against the process environment.
    pub fn resolve(&self, name: &str) -> Result<ServerConfig, McpError> {
        self.resolve_with(name, |var| std::env::var(var).ok())
    }

    /// Resolve a named server, looking placeholders up through `lookup`.
    pub fn resolve_with<F>(&self, name: &str, lookup: F) -> Result<ServerConfig, McpError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let entry = self.servers.get(name).ok_or_else(|| McpError::ConfigNotFound {
            name: name.to_string(),
        })?;

        let command = entry
            .command
            .as_deref()
            .map(str::trim)
            .filter(|c| !c.is_empty());
        let has_url = entry.url.as_deref().is_some_and(|u| !u.trim().is_empty());

        let command = match (command, has_url) {
            (Some(_), true) => {
                return Err(McpError::ConfigInvalid {
                    name: name.to_string(),
                    reason: "both `command` and `url` are set".into(),
                })
            }
            (None, true) => {
                return Err(McpError::ConfigInvalid {
                    name: name.to_string(),
                    reason: "url-based servers are not supported, config must be command-based (stdio)"
                        .into(),
                })
            }
            (None, false) => {
                return Err(McpError::ConfigInvalid {
                    name: name.to_string(),
                    reason: "neither `command` nor `url` is set".into(),
                })
            }
            (Some(command), false) => command,
        };

        let env = entry
            .env
            .iter()
            .map(|(key, value)| (key.clone(), substitute(value, name, key, &lookup)))
            .collect();

        let args = entry
            .args
            .iter()
            .map(|arg| substitute(arg, name, "args", &lookup))
            .collect();

        let working_directory = entry
            .working_directory
            .as_deref()
            .map(|dir| substitute(dir, name, "workingDirectory", &lookup))
            .filter(|dir| !dir.is_empty())
            .map(|dir| self.absolutize(PathBuf::from(dir)));

        Ok(ServerConfig {
            name: name.to_string(),
            command: substitute(command, name, "command", &lookup),
            args,
            env,
            working_directory,
            timeout_seconds: entry.timeout_seconds,
            handshake_timeout_seconds: entry.handshake_timeout_seconds,
            policy: entry.policy,
        })
    }

    fn absolutize(&self, dir: PathBuf) -> PathBuf {
        match &self.base_dir {
            Some(base) if dir.is_relative() => base.join(dir),
            _ => dir,
        }
    }
}

/// Locate a config file.
///
/// Resolution order:
/// 1. `TOOL_BRIDGE_CONFIG` env var, if it names an existing file.
/// 2. Walk upward from `start` looking for `mcp-config.{jsonc,json,yaml,yml}`.
pub fn find_config_path(start: &Path) -> Result<PathBuf, McpError> {
    if let Ok(explicit) = std::env::var(CONFIG_PATH_ENV) {
        let candidate = PathBuf::from(&explicit);
        if candidate.is_file() {
            return Ok(candidate);
        }
        tracing::warn!(path = %explicit, "{CONFIG_PATH_ENV} does not name a file, searching");
    }

    let mut dir = start.to_path_buf();
    loop {
        for file_name in CONFIG_FILE_NAMES {
            let candidate = dir.join(file_name);
            if candidate.is_file() {
                return Ok(candidate);
            }
        }
        if !dir.pop() {
            break;
        }
    }

    Err(McpError::ConfigError {
        reason: format!(
            "could not find any of {} above {}",
            CONFIG_FILE_NAMES.join(", "),
            start.display()
        ),
    })
}

// ─── Placeholder substitution ────────────────────────────────────────────────

/// Replace every `${VAR}` / `${VAR:default}` in `input`.
///
/// An unset or empty variable falls back to the default, else to the empty
/// string with a warning. Never fails.
fn substitute<F>(input: &str, server: &str, field: &str, lookup: &F) -> String
where
    F: Fn(&str) -> Option<String>,
{
    if !input.contains("${") {
        return input.to_string();
    }

    let mut out = String::with_capacity(input.len());
    let mut rest = input;
    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let Some(end) = after.find('}') else {
            tracing::warn!(server, field, "unterminated placeholder, keeping it literally");
            out.push_str(&rest[start..]);
            return out;
        };
        out.push_str(&resolve_placeholder(&after[..end], server, field, lookup));
        rest = &after[end + 1..];
    }
    out.push_str(rest);
    out
}

fn resolve_placeholder<F>(expr: &str, server: &str, field: &str, lookup: &F) -> String
where
    F: Fn(&str) -> Option<String>,
{
    let (var, default) = match expr.split_once(':') {
        Some((var, default)) => (var.trim(), default),
        None => (expr.trim(), ""),
    };

    if let Some(value) = lookup(var).filter(|v| !v.is_empty()) {
        return value;
    }

    if default.is_empty() {
        tracing::warn!(server, field, var, "environment variable referenced but not set");
    } else {
        tracing::debug!(server, field, var, default, "environment variable not set, using default");
    }
    default.to_string()
}

// ─── JSONC ───────────────────────────────────────────────────────────────────

/// Strip `//` and `/* */` comments and trailing commas so `serde_json` can
/// parse JSONC. String literals are left untouched.
fn strip_jsonc(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();
    let mut in_string = false;

    while let Some(ch) = chars.next() {
        if in_string {
            out.push(ch);
            match ch {
                '\\' => {
                    if let Some(escaped) = chars.next() {
                        out.push(escaped);
                    }
                }
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }

        match ch {
            '"' => {
                in_string = true;
                out.push(ch);
            }
            '/' if chars.peek() == Some(&'/') => {
                for c in chars.by_ref() {
                    if c == '\n' {
                        out.push('\n');
                        break;
                    }
                }
            }
            '/' if chars.peek() == Some(&'*') => {
                chars.next();
                let mut prev = '\0';
                for c in chars.by_ref() {
                    if prev == '*' && c == '/' {
                        break;
                    }
                    if c == '\n' {
                        out.push('\n');
                    }
                    prev = c;
                }
            }
            _ => out.push(ch),
        }
    }

    strip_trailing_commas(&out)
}

fn strip_trailing_commas(input: &str) -> String {
    let chars: Vec<char> = input.chars().collect();
    let mut out = String::with_capacity(input.len());
    let mut in_string = false;
    let mut i = 0;

    while i < chars.len() {
        let ch = chars[i];
        if in_string {
            out.push(ch);
            if ch == '\\' {
                if let Some(&escaped) = chars.get(i + 1) {
                    out.push(escaped);
                    i += 1;
                }
            } else if ch == '"' {
                in_string = false;
            }
        } else if ch == '"' {
            in_string = true;
            out.push(ch);
        } else if ch == ',' {
            let next = chars[i + 1..].iter().find(|c| !c.is_whitespace());
            if !matches!(next, Some('}') | Some(']')) {
                out.push(ch);
            }
        } else {
            out.push(ch);
        }
        i += 1;
    }

    out
}

// ─── Tests ───────────────────────────────────────────────────────────────────
