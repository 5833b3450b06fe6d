//! Server configuration.

use std::net::{Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::types::{Result, TftpError, DEFAULT_PORT};

/// Configuration for the TFTP server.
///
/// Every field has a default, so a JSON file only needs the values it
/// changes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Well-known endpoint where requests arrive
    pub bind_addr: SocketAddr,
    /// Directory served to clients
    pub root_dir: PathBuf,
    /// Receive timeout applied to every awaited packet, in milliseconds
    pub timeout_ms: u64,
    /// Consecutive timeouts tolerated while a full block is in flight
    pub max_retries: u32,
    /// Consecutive timeouts tolerated while the terminal block is in flight
    pub terminal_max_retries: u32,
    /// Dallying lasts `timeout_ms * dally_factor`
    pub dally_factor: u32,
    /// Packets answered or discarded while dallying before the session ends early
    pub dally_replies: u32,
    /// Probability in `[0, 1]` that an outbound datagram is dropped
    pub loss_probability: f64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from((Ipv4Addr::UNSPECIFIED, DEFAULT_PORT)),
            root_dir: PathBuf::from("."),
            timeout_ms: 100,
            max_retries: 20,
            terminal_max_retries: 10,
            dally_factor: 10,
            dally_replies: 20,
            loss_probability: 0.0,
        }
    }
}

impl ServerConfig {
    /// Parse and validate a JSON config.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: ServerConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a JSON config file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json(&json)
    }

    pub fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.loss_probability) {
            return Err(TftpError::InvalidConfig(format!(
                "loss_probability {} is outside [0, 1]",
                self.loss_probability
            )));
        }
        if self.timeout_ms == 0 {
            return Err(TftpError::InvalidConfig("timeout_ms must be positive".into()));
        }
        if self.dally_factor == 0 {
            return Err(TftpError::InvalidConfig("dally_factor must be positive".into()));
        }
        if self.dally_replies == 0 {
            return Err(TftpError::InvalidConfig("dally_replies must be positive".into()));
        }
        Ok(())
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// The retry and timeout rules every session runs under.
    pub fn transfer_policy(&self) -> TransferPolicy {
        let timeout = self.timeout();
        TransferPolicy {
            timeout,
            max_retries: self.max_retries,
            terminal_max_retries: self.terminal_max_retries,
            dally_timeout: timeout * self.dally_factor,
            max_dally_replies: self.dally_replies,
        }
    }
}

/// Per-session retry and timeout policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferPolicy {
    pub timeout: Duration,
    pub max_retries: u32,
    pub terminal_max_retries: u32,
    pub dally_timeout: Duration,
    /// Packets taken while dallying before giving up
    pub max_dally_replies: u32,
}

impl TransferPolicy {
    /// Timeouts tolerated for a block, depending on whether it ends the transfer.
    pub fn retry_limit(&self, terminal: bool) -> u32 {
        if terminal {
            self.terminal_max_retries
        } else {
            self.max_retries
        }
    }
}

impl Default for TransferPolicy {
    fn default() -> Self {
        ServerConfig::default().transfer_policy()
    }
}
