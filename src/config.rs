//! Connection credentials and tunables, parsed from environment variables.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

pub const DEFAULT_KEEPALIVE_SECS: u64 = 60;
/// Mirrors the wallet's WalletConnect request timeout.
pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 10;
pub const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 15;

// =============================================================================
// CREDENTIALS
// =============================================================================

/// Identity of one chat connection. Fixed for the lifetime of a `Connection`.
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    /// Service base URL, e.g. `"https://chat.example.org"`.
    pub host: String,
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub username: Option<String>,
    pub user_id: Option<String>,
    pub wallet_id: Option<String>,
    pub eth_address: Option<String>,
    /// Push-notification registration token.
    pub fcm_token: Option<String>,
}

impl Credentials {
    #[must_use]
    pub fn new(host: impl Into<String>, access_token: impl Into<String>) -> Self {
        Self { host: host.into(), access_token: access_token.into(), ..Self::default() }
    }

    #[must_use]
    pub fn with_username(mut self, username: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self
    }

    #[must_use]
    pub fn with_fcm_token(mut self, token: impl Into<String>) -> Self {
        self.fcm_token = Some(token.into());
        self
    }

    /// A socket can only be opened with both a host and an access token.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        !self.host.trim().is_empty() && !self.access_token.trim().is_empty()
    }

    /// Load credentials from `CHAT_*` environment variables.
    ///
    /// - `CHAT_HOST`, `CHAT_ACCESS_TOKEN` (empty when unset)
    /// - `CHAT_REFRESH_TOKEN`, `CHAT_USERNAME`, `CHAT_USER_ID`, `CHAT_WALLET_ID`,
    ///   `CHAT_ETH_ADDRESS`, `CHAT_FCM_TOKEN` (optional)
    #[must_use]
    pub fn from_env() -> Self {
        Self {
            host: std::env::var("CHAT_HOST").unwrap_or_default(),
            access_token: std::env::var("CHAT_ACCESS_TOKEN").unwrap_or_default(),
            refresh_token: env_opt("CHAT_REFRESH_TOKEN"),
            username: env_opt("CHAT_USERNAME"),
            user_id: env_opt("CHAT_USER_ID"),
            wallet_id: env_opt("CHAT_WALLET_ID"),
            eth_address: env_opt("CHAT_ETH_ADDRESS"),
            fcm_token: env_opt("CHAT_FCM_TOKEN"),
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("host", &self.host)
            .field("access_token", &redact(Some(&self.access_token)))
            .field("refresh_token", &redact(self.refresh_token.as_ref()))
            .field("username", &self.username)
            .field("user_id", &self.user_id)
            .field("wallet_id", &self.wallet_id)
            .field("eth_address", &self.eth_address)
            .field("fcm_token", &redact(self.fcm_token.as_ref()))
            .finish()
    }
}

fn redact(value: Option<&String>) -> &'static str {
    match value {
        Some(v) if !v.is_empty() => "<redacted>",
        _ => "<none>",
    }
}

// =============================================================================
// CONNECTION CONFIG
// =============================================================================

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ConnectionConfig {
    /// Interval between keepalive requests. The first one goes out on open.
    pub keepalive: Duration,
    /// How long `Connection::request` waits for the matching response.
    pub request_timeout: Duration,
    /// Upper bound on the websocket handshake.
    pub connect_timeout: Duration,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            keepalive: Duration::from_secs(DEFAULT_KEEPALIVE_SECS),
            request_timeout: Duration::from_secs(DEFAULT_REQUEST_TIMEOUT_SECS),
            connect_timeout: Duration::from_secs(DEFAULT_CONNECT_TIMEOUT_SECS),
        }
    }
}

impl ConnectionConfig {
    /// Load tunables with defaults.
    ///
    /// - `CHAT_KEEPALIVE_SECS`: default 60
    /// - `CHAT_REQUEST_TIMEOUT_SECS`: default 10
    /// - `CHAT_CONNECT_TIMEOUT_SECS`: default 15
    #[must_use]
    pub fn from_env() -> Self {
        Self {
            keepalive: Duration::from_secs(env_parse_u64("CHAT_KEEPALIVE_SECS", DEFAULT_KEEPALIVE_SECS)),
            request_timeout: Duration::from_secs(env_parse_u64(
                "CHAT_REQUEST_TIMEOUT_SECS",
                DEFAULT_REQUEST_TIMEOUT_SECS,
            )),
            connect_timeout: Duration::from_secs(env_parse_u64(
                "CHAT_CONNECT_TIMEOUT_SECS",
                DEFAULT_CONNECT_TIMEOUT_SECS,
            )),
        }
    }
}

fn env_opt(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|s| !s.is_empty())
}

fn env_parse_u64(key: &str, default: u64) -> u64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .filter(|v| *v > 0)
        .unwrap_or(default)
}

#[cfg(test)]
#[path = "config_test.rs"]
mod tests;
