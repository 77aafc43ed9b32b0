//! Call policy and client-wide settings.
//!
//! A [`CallPolicy`] controls how a single `tools/call` is timed and retried.
//! [`ClientSettings`] holds the knobs shared by every connection the client
//! opens (handshake timeout, dispatch mode, what to do on stdout EOF).

use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::types::ClientInfo;

// ─── Constants ───────────────────────────────────────────────────────────────

/// MCP protocol version sent in `initialize`.
pub const DEFAULT_PROTOCOL_VERSION: &str = "2024-11-05";

/// Default timeout for the initialize handshake.
const DEFAULT_HANDSHAKE_TIMEOUT_SECS: u64 = 30;

/// Grace period between closing stdin and force-killing the child.
const DEFAULT_SHUTDOWN_GRACE_SECS: u64 = 5;

// ─── CallPolicy ──────────────────────────────────────────────────────────────

/// Timeout and retry policy for a tool call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallPolicy {
    /// Per-attempt timeout; multiplied by the attempt number when
    /// `escalate_timeout` is set.
    pub timeout_base_ms: u64,
    /// Total attempts, including the first one.
    pub max_attempts: u32,
    /// Sleep before attempt `n + 1` is `backoff_ms * n`.
    #[serde(default)]
    pub backoff_ms: u64,
    #[serde(default = "default_escalate")]
    pub escalate_timeout: bool,
}

fn default_escalate() -> bool {
    true
}

impl CallPolicy {
    /// Low-latency tool: fixed 30s timeout, one immediate reconnect-and-retry.
    pub const fn interactive() -> Self {
        Self {
            timeout_base_ms: 30_000,
            max_attempts: 2,
            backoff_ms: 0,
            escalate_timeout: false,
        }
    }

    /// Slow-starting tool: 120s growing per attempt, 3 attempts, 1s linear backoff.
    pub const fn heavyweight() -> Self {
        Self {
            timeout_base_ms: 120_000,
            max_attempts: 3,
            backoff_ms: 1_000,
            escalate_timeout: true,
        }
    }

    /// Timeout for a 1-based attempt number.
    pub fn timeout_for_attempt(&self, attempt: u32) -> Duration {
        let factor = if self.escalate_timeout {
            u64::from(attempt.max(1))
        } else {
            1
        };
        Duration::from_millis(self.timeout_base_ms.saturating_mul(factor))
    }

    /// Sleep before retrying after the given 1-based attempt failed.
    pub fn backoff_after_attempt(&self, attempt: u32) -> Duration {
        Duration::from_millis(self.backoff_ms.saturating_mul(u64::from(attempt)))
    }

    /// At least one attempt is always made.
    pub fn attempts(&self) -> u32 {
        self.max_attempts.max(1)
    }

    /// Same policy with a different base timeout.
    pub fn with_timeout_base_ms(mut self, timeout_base_ms: u64) -> Self {
        self.timeout_base_ms = timeout_base_ms;
        self
    }
}

impl Default for CallPolicy {
    fn default() -> Self {
        Self::interactive()
    }
}

// ─── Dispatch / EOF ──────────────────────────────────────────────────────────

/// Whether several calls may be outstanding on one connection at once.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DispatchMode {
    /// One logical call in flight per connection.
    #[default]
    Serialized,
    /// Multiple outstanding ids; writes stay mutually exclusive.
    Pipelined,
}

/// What the response router does with pending requests when stdout closes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EofPolicy {
    /// Leave pending requests to hit their own timeout.
    #[default]
    AwaitTimeout,
    /// Drop every pending slot so waiting callers fail immediately.
    FailPending,
}

// ─── ClientSettings ──────────────────────────────────────────────────────────

/// Client-wide settings, read from the `client` section of the config file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ClientSettings {
    pub name: String,
    pub version: String,
    pub protocol_version: String,
    pub handshake_timeout_seconds: u64,
    pub shutdown_grace_seconds: u64,
    pub dispatch: DispatchMode,
    pub on_eof: EofPolicy,
    pub default_policy: CallPolicy,
}

impl Default for ClientSettings {
    fn default() -> Self {
        let info = ClientInfo::default();
        Self {
            name: info.name,
            version: info.version,
            protocol_version: DEFAULT_PROTOCOL_VERSION.to_string(),
            handshake_timeout_seconds: DEFAULT_HANDSHAKE_TIMEOUT_SECS,
            shutdown_grace_seconds: DEFAULT_SHUTDOWN_GRACE_SECS,
            dispatch: DispatchMode::default(),
            on_eof: EofPolicy::default(),
            default_policy: CallPolicy::default(),
        }
    }
}

impl ClientSettings {
    pub fn client_info(&self) -> ClientInfo {
        ClientInfo {
            name: self.name.clone(),
            version: self.version.clone(),
        }
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_seconds)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_seconds)
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_escalating_timeout_grows_per_attempt() {
        let policy = CallPolicy::heavyweight();
        assert_eq!(policy.timeout_for_attempt(1), Duration::from_secs(120));
        assert_eq!(policy.timeout_for_attempt(2), Duration::from_secs(240));
        assert_eq!(policy.timeout_for_attempt(3), Duration::from_secs(360));
        assert_eq!(policy.backoff_after_attempt(1), Duration::from_secs(1));
        assert_eq!(policy.backoff_after_attempt(2), Duration::from_secs(2));
    }

    #[test]
    fn test_fixed_timeout_and_immediate_retry() {
        let policy = CallPolicy::interactive();
        assert_eq!(policy.timeout_for_attempt(1), Duration::from_secs(30));
        assert_eq!(policy.timeout_for_attempt(2), Duration::from_secs(30));
        assert_eq!(policy.backoff_after_attempt(1), Duration::ZERO);
        assert_eq!(policy.attempts(), 2);
    }

    #[test]
    fn test_zero_attempts_still_tries_once() {
        let policy = CallPolicy {
            max_attempts: 0,
            ..CallPolicy::interactive()
        };
        assert_eq!(policy.attempts(), 1);
    }

    #[test]
    fn test_policy_deserialize_defaults() {
        let policy: CallPolicy =
            serde_json::from_str(r#"{"timeoutBaseMs": 5000, "maxAttempts": 3}"#).unwrap();
        assert_eq!(policy.backoff_ms, 0);
        assert!(policy.escalate_timeout);
    }

    #[test]
    fn test_client_settings_partial_yaml() {
        let yaml = "handshakeTimeoutSeconds: 120\ndispatch: pipelined\nonEof: fail_pending\n";
        let settings: ClientSettings = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(settings.handshake_timeout(), Duration::from_secs(120));
        assert_eq!(settings.dispatch, DispatchMode::Pipelined);
        assert_eq!(settings.on_eof, EofPolicy::FailPending);
        assert_eq!(settings.protocol_version, DEFAULT_PROTOCOL_VERSION);
        assert_eq!(settings.default_policy, CallPolicy::interactive());
    }
}
