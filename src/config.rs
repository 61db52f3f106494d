// SPDX-FileCopyrightText: 2026 Skyrelay Contributors
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! Configuration
//!
//! Relay server configuration loaded from environment variables, and the
//! client-side settings document the desktop GUI persists as JSON.

use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Relay server configuration.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Address to listen on.
    pub listen_addr: SocketAddr,
    /// Path to the JSON user registry. `None` keeps the registry in memory.
    pub users_path: Option<PathBuf>,
    /// Remote addresses refused at accept, before any protocol.
    pub deny_addrs: Vec<IpAddr>,
    /// Seconds a connection may stay unauthenticated.
    pub auth_timeout_secs: u64,
    /// Idle timeout for authenticated connections, in seconds.
    pub idle_timeout_secs: u64,
    /// Maximum inbound text frame size in bytes.
    pub max_message_size: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        RelayConfig {
            listen_addr: "0.0.0.0:8080".parse().unwrap(),
            users_path: Some(PathBuf::from("./data/users.json")),
            deny_addrs: Vec::new(),
            auth_timeout_secs: 5,
            idle_timeout_secs: 300,
            max_message_size: 4096,
        }
    }
}

impl RelayConfig {
    /// Loads configuration from environment variables.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(addr) = std::env::var("RELAY_LISTEN_ADDR") {
            if let Ok(parsed) = addr.parse() {
                config.listen_addr = parsed;
            }
        }

        if let Ok(path) = std::env::var("RELAY_USERS_PATH") {
            config.users_path = if path.is_empty() {
                None
            } else {
                Some(PathBuf::from(path))
            };
        }

        if let Ok(val) = std::env::var("RELAY_DENY_ADDRS") {
            config.deny_addrs = val
                .split(',')
                .filter_map(|s| s.trim().parse().ok())
                .collect();
        }

        if let Ok(val) = std::env::var("RELAY_AUTH_TIMEOUT") {
            if let Ok(parsed) = val.parse() {
                config.auth_timeout_secs = parsed;
            }
        }

        if let Ok(val) = std::env::var("RELAY_IDLE_TIMEOUT") {
            if let Ok(parsed) = val.parse() {
                config.idle_timeout_secs = parsed;
            }
        }

        if let Ok(val) = std::env::var("RELAY_MAX_MESSAGE_SIZE") {
            if let Ok(parsed) = val.parse() {
                config.max_message_size = parsed;
            }
        }

        config
    }

    /// Returns true when connections from this address are refused.
    pub fn is_denied(&self, addr: &IpAddr) -> bool {
        self.deny_addrs.contains(addr)
    }

    /// Returns the authentication deadline as a Duration.
    pub fn auth_timeout(&self) -> Duration {
        Duration::from_secs(self.auth_timeout_secs)
    }

    /// Returns the idle timeout as a Duration.
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }
}

/// Client settings as persisted by the desktop GUI (`setting.json`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientSettings {
    /// WebSocket URL of the relay, e.g. `ws://relay.example:8080`.
    pub server: String,
    /// This client's user id.
    pub id: String,
    /// Plaintext password; hashed before it leaves the process.
    pub pass: String,
    /// Callsign the GUI applies when it builds position records; carried
    /// here only so the settings document round-trips.
    #[serde(default)]
    pub callsign: String,
}

impl ClientSettings {
    /// Reads settings from a JSON file.
    pub fn load(path: &Path) -> Result<Self, String> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| format!("read {}: {e}", path.display()))?;
        serde_json::from_str(&raw).map_err(|e| format!("parse {}: {e}", path.display()))
    }
}
