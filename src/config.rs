//! Node configuration parameters.
//!
//! All tunable parameters for the messaging core. Values can be overridden
//! at node-assembly time or loaded from host tooling as JSON.

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::executor::Nanos;

/// Core node configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    // --- Datagram protocol ---
    /// How long a datagram client waits for the ack/nack response (ms).
    pub datagram_response_timeout_ms: u32,
    /// How long to wait for a destination alias to appear before giving up (ms).
    pub alias_lookup_timeout_ms: u32,
    /// Inbound reassembly entries older than this are dropped (ms, 0 = never).
    pub reassembly_timeout_ms: u32,
    /// Number of concurrent outbound datagram clients.
    pub datagram_clients: usize,

    // --- Buffer pools ---
    /// Target number of pooled CAN frame buffers.
    pub frame_pool_size: usize,
    /// Target number of pooled protocol message buffers.
    pub message_pool_size: usize,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            // Datagram protocol
            datagram_response_timeout_ms: 3000,
            alias_lookup_timeout_ms: 1000,
            reassembly_timeout_ms: 3000,
            datagram_clients: 2,

            // Buffer pools
            frame_pool_size: 16,
            message_pool_size: 8,
        }
    }
}

impl NodeConfig {
    /// Parse and validate a JSON config blob (host tooling side-load).
    pub fn from_json(input: &str) -> Result<Self, ConfigError> {
        let cfg: Self = serde_json::from_str(input).map_err(|e| {
            log::warn!("config parse failed: {e}");
            ConfigError::Parse
        })?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Range-check every field. Invalid values are rejected, not clamped.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.datagram_response_timeout_ms == 0 {
            return Err(ConfigError::Validation("datagram_response_timeout_ms must be > 0"));
        }
        if self.alias_lookup_timeout_ms == 0 {
            return Err(ConfigError::Validation("alias_lookup_timeout_ms must be > 0"));
        }
        if self.datagram_clients == 0 {
            return Err(ConfigError::Validation("datagram_clients must be > 0"));
        }
        if self.frame_pool_size == 0 || self.message_pool_size == 0 {
            return Err(ConfigError::Validation("pool sizes must be > 0"));
        }
        Ok(())
    }

    pub fn response_timeout(&self) -> Nanos {
        Nanos::from(self.datagram_response_timeout_ms) * 1_000_000
    }

    pub fn alias_lookup_timeout(&self) -> Nanos {
        Nanos::from(self.alias_lookup_timeout_ms) * 1_000_000
    }

    /// Reassembly reaper deadline; `None` disables the reaper.
    pub fn reassembly_timeout(&self) -> Option<Nanos> {
        match self.reassembly_timeout_ms {
            0 => None,
            ms => Some(Nanos::from(ms) * 1_000_000),
        }
    }
}
