//! Store configuration.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors loading a configuration file.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid config: {0}")]
    Json(#[from] serde_json::Error),
}

/// Configuration for the session manager and everything it owns.
///
/// Durations are in seconds. A zero `session_ttl_secs` disables idle expiry
/// and a zero `lock_timeout_secs` disables heartbeat expiry of optimizer
/// locks (liveness tokens still apply).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// History entries kept per variable.
    pub history_limit: usize,
    /// Idle time after which a session is reaped.
    pub session_ttl_secs: u64,
    /// Period of the background sweep.
    pub sweep_interval_secs: u64,
    /// Holder inactivity after which an optimizer lock is force-released.
    pub lock_timeout_secs: u64,
    /// Events queued per subscriber before it is dropped as lagging.
    pub watch_buffer: usize,
    /// Maximum concurrent sessions (0 = unlimited).
    pub max_sessions: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            history_limit: 100,
            session_ttl_secs: 3600,
            sweep_interval_secs: 30,
            lock_timeout_secs: 300,
            watch_buffer: 1024,
            max_sessions: 1024,
        }
    }
}

impl StoreConfig {
    /// Load a JSON config file. Missing fields take their defaults.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&text)?)
    }

    pub fn session_ttl(&self) -> Option<Duration> {
        (self.session_ttl_secs > 0).then(|| Duration::from_secs(self.session_ttl_secs))
    }

    pub fn lock_timeout(&self) -> Option<Duration> {
        (self.lock_timeout_secs > 0).then(|| Duration::from_secs(self.lock_timeout_secs))
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.max(1))
    }
}
