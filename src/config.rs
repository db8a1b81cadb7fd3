//! Server and client configuration.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{BusError, Result};

/// Bus server settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Listen address, e.g. `0.0.0.0:9001`.
    pub bind_addr: String,
    /// Name used in logs.
    #[serde(default = "default_server_name")]
    pub name: String,
}

fn default_server_name() -> String {
    "bus".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:9001".to_string(),
            name: default_server_name(),
        }
    }
}

impl ServerConfig {
    /// Loads configuration from a TOML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .map_err(|err| BusError::config(format!("failed to read config file: {err}")))?;
        toml::from_str(&contents)
            .map_err(|err| BusError::config(format!("failed to parse config: {err}")))
    }

    pub fn validate(&self) -> Result<()> {
        if self.bind_addr.is_empty() {
            return Err(BusError::config("bind_addr must not be empty"));
        }
        if self.name.is_empty() {
            return Err(BusError::config("name must not be empty"));
        }
        Ok(())
    }
}

/// Bus client settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Server address to dial.
    pub addr: String,
    /// Pause between redial attempts once the connection drops.
    #[serde(default = "default_dial_retry_secs")]
    pub dial_retry_secs: u64,
}

fn default_dial_retry_secs() -> u64 {
    10
}

impl ClientConfig {
    pub fn new(addr: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            dial_retry_secs: default_dial_retry_secs(),
        }
    }

    /// Loads configuration from a TOML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .map_err(|err| BusError::config(format!("failed to read config file: {err}")))?;
        toml::from_str(&contents)
            .map_err(|err| BusError::config(format!("failed to parse config: {err}")))
    }

    pub fn validate(&self) -> Result<()> {
        if self.addr.is_empty() {
            return Err(BusError::config("addr must not be empty"));
        }
        if self.dial_retry_secs == 0 {
            return Err(BusError::config("dial_retry_secs must be > 0"));
        }
        Ok(())
    }
}
