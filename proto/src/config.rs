//! Settings shared by the server and the agent, loaded from a JSON file.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::addr::PortCompat;
use crate::error::{Error, Result};

/// What the server does when an agent registers while another is active.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionPolicy {
    /// Tear down the active session and install the new one.
    #[default]
    Supersede,
    /// Refuse the new agent until the active session dies.
    Reject,
}

/// Configuration file format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Server address the agent dials
    pub server_addr: String,
    /// Address the server listens on
    pub listen_addr: String,
    /// SOCKS5 port
    pub server_port: u16,
    /// Control port
    pub control_port: u16,
    /// Tunnel port
    pub tunnel_port: u16,
    /// Idle/read timeout for every protocol phase (seconds)
    pub timeout: u64,
    pub user_name: String,
    pub password: String,
    /// Enable debug logging
    pub debug: bool,
    /// Agent heartbeat period (milliseconds)
    pub heartbeat_interval_ms: u64,
    /// Silence after which the server declares the agent dead (milliseconds)
    pub heartbeat_timeout_ms: u64,
    /// Agent delay before redialing the server (milliseconds)
    pub reconnect_backoff_ms: u64,
    pub session_policy: SessionPolicy,
    pub port_compat: PortCompat,
    /// Agent reconnects instead of exiting when the server closes the
    /// control connection
    pub reconnect_on_close: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server_addr: "127.0.0.1".into(),
            listen_addr: "0.0.0.0".into(),
            server_port: 8864,
            control_port: 8964,
            tunnel_port: 9064,
            timeout: 600,
            user_name: "user".into(),
            password: "password".into(),
            debug: false,
            heartbeat_interval_ms: 2000,
            heartbeat_timeout_ms: 6000,
            reconnect_backoff_ms: 2000,
            session_policy: SessionPolicy::Supersede,
            port_compat: PortCompat::Strict,
            reconnect_on_close: false,
        }
    }
}

impl Config {
    /// `$HOME/.backhaul/config.json`
    pub fn default_path() -> PathBuf {
        let home = std::env::var_os("HOME").unwrap_or_default();
        PathBuf::from(home).join(".backhaul").join("config.json")
    }

    /// Load from `path`. A missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self> {
        let config = match std::fs::read_to_string(path) {
            Ok(content) => Self::from_json(&content)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!("{} not found, using default configuration", path.display());
                Self::default()
            }
            Err(e) => {
                return Err(Error::config(format!("read {}: {}", path.display(), e)));
            }
        };
        config.validate()?;
        Ok(config)
    }

    /// Parse a JSON document; absent fields keep their defaults.
    pub fn from_json(content: &str) -> Result<Self> {
        serde_json::from_str(content).map_err(|e| Error::config(e.to_string()))
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        if self.user_name.is_empty() || self.password.is_empty() {
            return Err(Error::config("user_name and password cannot be empty"));
        }
        if self.user_name.len() > 255 || self.password.len() > 255 {
            return Err(Error::config("user_name and password are limited to 255 bytes"));
        }
        if self.timeout == 0 {
            return Err(Error::config("timeout must be positive"));
        }
        if self.heartbeat_interval_ms == 0 {
            return Err(Error::config("heartbeat_interval_ms must be positive"));
        }
        if self.heartbeat_timeout_ms <= self.heartbeat_interval_ms {
            return Err(Error::config(
                "heartbeat_timeout_ms must be longer than heartbeat_interval_ms",
            ));
        }
        Ok(())
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_secs(self.timeout)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_millis(self.heartbeat_timeout_ms)
    }

    pub fn reconnect_backoff(&self) -> Duration {
        Duration::from_millis(self.reconnect_backoff_ms)
    }

    /// `server_addr:control_port`, dialed by the agent.
    pub fn control_endpoint(&self) -> String {
        format!("{}:{}", self.server_addr, self.control_port)
    }

    /// `server_addr:tunnel_port`, dialed by the agent.
    pub fn tunnel_endpoint(&self) -> String {
        format!("{}:{}", self.server_addr, self.tunnel_port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_default() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.control_endpoint(), "127.0.0.1:8964");
        assert_eq!(config.tunnel_endpoint(), "127.0.0.1:9064");
        assert_eq!(config.read_timeout(), Duration::from_secs(600));
        assert_eq!(config.heartbeat_interval(), Duration::from_secs(2));
    }

    #[test]
    fn test_partial_json_keeps_defaults() {
        let config = Config::from_json(
            r#"{
                "server_addr": "203.0.113.7",
                "control_port": 7000,
                "password": "s3cret",
                "session_policy": "reject",
                "port_compat": "swap_legacy"
            }"#,
        )
        .unwrap();

        assert_eq!(config.server_addr, "203.0.113.7");
        assert_eq!(config.control_port, 7000);
        assert_eq!(config.tunnel_port, 9064);
        assert_eq!(config.user_name, "user");
        assert_eq!(config.password, "s3cret");
        assert_eq!(config.session_policy, SessionPolicy::Reject);
        assert_eq!(config.port_compat, PortCompat::SwapLegacy);
    }

    #[test]
    fn test_malformed_json() {
        assert!(matches!(Config::from_json("{ nope"), Err(Error::Config(_))));
        assert!(matches!(
            Config::from_json(r#"{"session_policy": "queue"}"#),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn test_validation() {
        let mut config = Config::default();
        config.password.clear();
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.timeout = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.heartbeat_timeout_ms = config.heartbeat_interval_ms;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_missing_file_uses_defaults() {
        let path = std::env::temp_dir().join("backhaul-no-such-dir").join("config.json");
        assert_eq!(Config::load(&path).unwrap(), Config::default());
    }
}
