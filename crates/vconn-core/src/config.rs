//! Messenger configuration

use crate::errors::{VconnError, VconnResult};
use serde::{Deserialize, Serialize};
use std::time::Duration;

// ----------------------------------------------------------------------------
// Messenger Configuration
// ----------------------------------------------------------------------------

/// Configuration for a virtual messenger
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MessengerConfig {
    /// Name shown in logs and diagnostics
    pub name: String,
    /// A dispatch tier taking at least this long is sampled
    pub slow_dispatch_threshold_ms: u64,
    /// Capacity of the slow-message sample ring
    pub slow_sample_capacity: usize,
    /// Upper bound for `get_connection` waiting on a physical binding
    pub connect_timeout_ms: u64,
    /// Refuse sessions whose authorizer fails verification
    pub reject_invalid_authorizers: bool,
}

impl Default for MessengerConfig {
    fn default() -> Self {
        Self {
            name: "vmsgr".to_string(),
            slow_dispatch_threshold_ms: 1000,
            slow_sample_capacity: 100,
            connect_timeout_ms: 5000,
            reject_invalid_authorizers: false,
        }
    }
}

impl MessengerConfig {
    /// Sample every message and fail fast on connection waits
    pub fn testing() -> Self {
        Self {
            name: "vmsgr-test".to_string(),
            slow_dispatch_threshold_ms: 0,
            slow_sample_capacity: 16,
            connect_timeout_ms: 500,
            reject_invalid_authorizers: false,
        }
    }

    /// Refuse sessions with invalid authorizers
    pub fn strict() -> Self {
        Self {
            reject_invalid_authorizers: true,
            ..Self::default()
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn slow_dispatch_threshold(&self) -> Duration {
        Duration::from_millis(self.slow_dispatch_threshold_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn validate(&self) -> VconnResult<()> {
        if self.slow_sample_capacity == 0 {
            return Err(VconnError::config_error(
                "slow_sample_capacity must be greater than zero",
            ));
        }
        if self.connect_timeout_ms == 0 {
            return Err(VconnError::config_error(
                "connect_timeout_ms must be greater than zero",
            ));
        }
        Ok(())
    }
}
