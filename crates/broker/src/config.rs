//! Broker configuration.

use std::path::Path;
use std::time::Duration;

use ringmq_membership::RingConfig;
use ringmq_protocol::{ConnectionConfig, MAX_FRAME_SIZE};
use serde::{Deserialize, Serialize};

use crate::error::{BrokerError, BrokerResult};

fn default_protocol() -> String {
    "tcp".to_string()
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

/// A client-facing listener.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct InterfaceConfig {
    /// Transport; only `tcp` is supported.
    #[serde(default = "default_protocol")]
    pub protocol: String,

    /// Port to bind; 0 picks an ephemeral port.
    pub port: u16,

    /// Host to bind.
    #[serde(default = "default_host")]
    pub host: String,
}

impl InterfaceConfig {
    /// TCP interface on `127.0.0.1:port`.
    #[must_use]
    pub fn tcp(port: u16) -> Self {
        Self {
            protocol: default_protocol(),
            port,
            host: default_host(),
        }
    }

    /// `host:port` to bind.
    #[must_use]
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Wire protocol limits.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProtocolConfig {
    /// Largest accepted frame body in bytes.
    #[serde(alias = "maxFrameSize")]
    pub max_frame_size: usize,

    /// How long any call waits for its acknowledgement.
    #[serde(alias = "ackTimeout")]
    pub ack_timeout_ms: u64,

    /// How long dialing a peer may take.
    #[serde(alias = "connectTimeout")]
    pub connect_timeout_ms: u64,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            max_frame_size: MAX_FRAME_SIZE,
            ack_timeout_ms: 30_000,
            connect_timeout_ms: 5_000,
        }
    }
}

impl ProtocolConfig {
    /// Connect timeout as a duration.
    #[must_use]
    pub const fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// Settings for every connection the broker opens or accepts.
    #[must_use]
    pub fn connection_config(&self) -> ConnectionConfig {
        ConnectionConfig {
            max_frame_size: self.max_frame_size,
            ack_timeout: Duration::from_millis(self.ack_timeout_ms),
            ..ConnectionConfig::default()
        }
    }
}

/// Everything a broker needs to start.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    /// Client-facing listeners. Must not be empty.
    pub interfaces: Vec<InterfaceConfig>,

    /// Ring addresses of seed nodes to join through.
    pub base: Vec<String>,

    /// Ring listener and membership protocol.
    #[serde(alias = "hashring")]
    pub ring: RingConfig,

    /// Wire protocol limits.
    pub protocol: ProtocolConfig,

    /// Log filter used when `RUST_LOG` is not set.
    #[serde(alias = "logLevel")]
    pub log_level: Option<String>,
}

impl BrokerConfig {
    /// Parse a JSON configuration.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::Configuration`] if the document does not parse.
    pub fn from_json(json: &str) -> BrokerResult<Self> {
        serde_json::from_str(json).map_err(|e| BrokerError::Configuration(e.to_string()))
    }

    /// Load a JSON configuration file.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::Configuration`] if the file cannot be read or
    /// parsed.
    pub fn from_file(path: impl AsRef<Path>) -> BrokerResult<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path).map_err(|e| {
            BrokerError::Configuration(format!("cannot read {}: {e}", path.display()))
        })?;
        Self::from_json(&json)
    }

    /// Check the configuration before any socket is bound.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::Configuration`] describing the first problem.
    pub fn validate(&self) -> BrokerResult<()> {
        if self.interfaces.is_empty() {
            return Err(BrokerError::Configuration("missing interfaces".to_string()));
        }
        if let Some(interface) = self.interfaces.iter().find(|i| i.protocol != "tcp") {
            return Err(BrokerError::Configuration(format!(
                "unsupported interface protocol '{}'",
                interface.protocol
            )));
        }
        if self.protocol.max_frame_size == 0 {
            return Err(BrokerError::Configuration(
                "max_frame_size must be positive".to_string(),
            ));
        }
        if self.protocol.ack_timeout_ms == 0 {
            return Err(BrokerError::Configuration(
                "ack_timeout_ms must be positive".to_string(),
            ));
        }
        if self.ring.join_timeout_ms == 0 {
            return Err(BrokerError::Configuration(
                "join_timeout_ms must be positive".to_string(),
            ));
        }
        Ok(())
    }

    /// Address the ring listener binds to.
    #[must_use]
    pub fn ring_bind_address(&self) -> String {
        format!("{}:{}", self.ring.host, self.ring.port)
    }
}
