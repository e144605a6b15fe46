//! vconn CLI Configuration
//!
//! A TOML file with a `[messenger]` table (the messenger configuration every
//! simulated node uses) and a `[simulation]` table describing the mesh.
//! Missing tables and fields fall back to defaults.

use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::debug;

use vconn_core::MessengerConfig;

use crate::error::{CliError, Result};

/// Complete configuration for the vconn CLI
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CliAppConfig {
    pub messenger: MessengerConfig,
    pub simulation: SimulationConfig,
}

/// Shape of the simulated mesh
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulationConfig {
    /// Storage members, all talking to each other
    pub members: usize,
    /// Clients, each talking to every member
    pub clients: usize,
    /// Messages per sender and destination
    pub messages_per_peer: usize,
    /// How long to wait for deliveries before reporting
    pub settle_timeout_ms: u64,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            members: 3,
            clients: 2,
            messages_per_peer: 4,
            settle_timeout_ms: 2000,
        }
    }
}

impl SimulationConfig {
    pub fn validate(&self) -> Result<()> {
        if self.members == 0 {
            return Err(CliError::Config(
                "simulation needs at least one member".to_string(),
            ));
        }
        if self.settle_timeout_ms == 0 {
            return Err(CliError::Config(
                "settle_timeout_ms must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

impl CliAppConfig {
    /// Load and validate a TOML configuration file
    pub fn load_from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        debug!(path = %path.display(), "reading configuration");
        let text = std::fs::read_to_string(path)?;
        Self::from_toml(&text)
    }

    pub fn from_toml(text: &str) -> Result<Self> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml(&self) -> Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    pub fn validate(&self) -> Result<()> {
        self.messenger.validate()?;
        self.simulation.validate()
    }

    pub fn with_messenger(messenger: MessengerConfig) -> Self {
        Self {
            messenger,
            ..Self::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_file_uses_defaults() {
        let config = CliAppConfig::from_toml(
            r#"
            [messenger]
            connect_timeout_ms = 250

            [simulation]
            members = 5
            "#,
        )
        .unwrap();

        assert_eq!(config.messenger.connect_timeout_ms, 250);
        assert_eq!(config.messenger.name, MessengerConfig::default().name);
        assert_eq!(config.simulation.members, 5);
        assert_eq!(config.simulation.clients, SimulationConfig::default().clients);
    }

    #[test]
    fn test_toml_round_trip_of_strict_preset() {
        let config = CliAppConfig::with_messenger(MessengerConfig::strict());
        let text = config.to_toml().unwrap();
        assert!(text.contains("reject_invalid_authorizers = true"));
        assert_eq!(CliAppConfig::from_toml(&text).unwrap(), config);
    }

    #[test]
    fn test_invalid_values_rejected() {
        let err = CliAppConfig::from_toml("[messenger]\nslow_sample_capacity = 0\n").unwrap_err();
        assert!(matches!(err, CliError::Vconn(_)));

        let err = CliAppConfig::from_toml("[simulation]\nmembers = 0\n").unwrap_err();
        assert!(matches!(err, CliError::Config(_)));

        let err = CliAppConfig::from_toml("[messenger]\nconnect_timeout_ms = \"soon\"\n").unwrap_err();
        assert!(matches!(err, CliError::TomlParsing(_)));
    }
}
