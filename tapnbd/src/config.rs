//! Configuration for the NBD client driver.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Export requested from newstyle servers via `NBD_OPT_EXPORT_NAME`.
    /// The empty string selects the server's default export.
    pub export_name: String,

    /// Bound on each blocking receive during the handshake.
    pub handshake_timeout_secs: u64,

    /// Deadline for flushing the disconnect request during `close`.
    pub disconnect_timeout_secs: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            export_name: String::new(),
            handshake_timeout_secs: 10,
            disconnect_timeout_secs: 10,
        }
    }
}

impl ClientConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(ConfigError::ReadError)?;
        let config: ClientConfig =
            toml::from_str(&content).map_err(|e| ConfigError::ParseError(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.handshake_timeout_secs == 0 {
            return Err(ConfigError::InvalidValue {
                field: "handshake_timeout_secs",
                reason: "must be > 0",
            });
        }
        if self.disconnect_timeout_secs == 0 {
            return Err(ConfigError::InvalidValue {
                field: "disconnect_timeout_secs",
                reason: "must be > 0",
            });
        }
        Ok(())
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_secs)
    }

    pub fn disconnect_timeout(&self) -> Duration {
        Duration::from_secs(self.disconnect_timeout_secs)
    }
}
