/*!
 * Bypass Configuration
 *
 * Runtime configuration with defaults from `core::limits`, overridable by a
 * JSON file and `PIPE_BYPASS_*` environment variables.
 */

use super::errors::{BypassError, BypassResult};
use super::limits::*;
use super::sync::SpinConfig;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::debug;

/// Configuration shared by every session of a registry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BypassConfig {
    /// Master switch; when off every descriptor takes the native path
    pub enabled: bool,
    /// Prefix for negotiation lock resource names
    pub resource_prefix: String,
    /// Size of each shared stream block
    pub block_size: usize,
    /// Bound on waiting for a peer to answer a connect request
    pub negotiation_timeout_ms: u64,
    /// Stall on first I/O while no peer has claimed a slot
    pub startup_stall_ms: u64,
    /// Slice length of every bounded wait
    pub peer_check_interval_ms: u64,
    /// Append a newline to each record delivered by the alternate reader
    pub implied_newline: bool,
    /// Ring buffer lock tuning
    pub spin: SpinConfig,
}

impl Default for BypassConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            resource_prefix: DEFAULT_RESOURCE_PREFIX.to_string(),
            block_size: DEFAULT_BLOCK_SIZE,
            negotiation_timeout_ms: DEFAULT_NEGOTIATION_TIMEOUT.as_millis() as u64,
            startup_stall_ms: DEFAULT_STARTUP_STALL.as_millis() as u64,
            peer_check_interval_ms: DEFAULT_PEER_CHECK_INTERVAL.as_millis() as u64,
            implied_newline: false,
            spin: SpinConfig::default(),
        }
    }
}

impl BypassConfig {
    /// Load configuration from the environment
    ///
    /// Environment variables:
    /// - PIPE_BYPASS_CONFIG: path to a JSON file used as the base
    /// - PIPE_BYPASS_DISABLE: "1" or "true" disables the bypass
    /// - PIPE_BYPASS_TIMEOUT_MS: negotiation timeout
    /// - PIPE_BYPASS_STALL_MS: startup stall
    /// - PIPE_BYPASS_IMPLIED_NEWLINE: "1" or "true" enables record newlines
    pub fn from_env() -> BypassResult<Self> {
        let mut config = match std::env::var("PIPE_BYPASS_CONFIG") {
            Ok(path) => Self::from_file(path)?,
            Err(_) => Self::default(),
        };

        if env_flag("PIPE_BYPASS_DISABLE") {
            config.enabled = false;
        }
        if let Some(ms) = env_millis("PIPE_BYPASS_TIMEOUT_MS")? {
            config.negotiation_timeout_ms = ms;
        }
        if let Some(ms) = env_millis("PIPE_BYPASS_STALL_MS")? {
            config.startup_stall_ms = ms;
        }
        if env_flag("PIPE_BYPASS_IMPLIED_NEWLINE") {
            config.implied_newline = true;
        }

        config.validate()?;
        debug!(?config, "Bypass configuration loaded");
        Ok(config)
    }

    /// Load configuration from a JSON file
    pub fn from_file(path: impl AsRef<Path>) -> BypassResult<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&text)
            .map_err(|e| BypassError::Config(format!("{}: {}", path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values that would make the protocol unusable
    pub fn validate(&self) -> BypassResult<()> {
        if self.block_size < COMMBUF_MIN_BLOCK {
            return Err(BypassError::Config(format!(
                "block_size {} is below the minimum of {}",
                self.block_size, COMMBUF_MIN_BLOCK
            )));
        }
        if self.block_size > u32::MAX as usize {
            return Err(BypassError::Config("block_size exceeds 4GB".into()));
        }
        if self.resource_prefix.contains('/') {
            return Err(BypassError::Config("resource_prefix must not contain '/'".into()));
        }
        if self.peer_check_interval_ms == 0 {
            return Err(BypassError::Config("peer_check_interval_ms must be non-zero".into()));
        }
        Ok(())
    }

    pub fn negotiation_timeout(&self) -> Duration {
        Duration::from_millis(self.negotiation_timeout_ms)
    }

    pub fn startup_stall(&self) -> Duration {
        Duration::from_millis(self.startup_stall_ms)
    }

    pub fn peer_check_interval(&self) -> Duration {
        Duration::from_millis(self.peer_check_interval_ms)
    }
}

fn env_flag(key: &str) -> bool {
    std::env::var(key)
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
        .unwrap_or(false)
}

fn env_millis(key: &str) -> BypassResult<Option<u64>> {
    match std::env::var(key) {
        Ok(v) => v
            .trim()
            .parse::<u64>()
            .map(Some)
            .map_err(|e| BypassError::Config(format!("{}={:?}: {}", key, v, e))),
        Err(_) => Ok(None),
    }
}
