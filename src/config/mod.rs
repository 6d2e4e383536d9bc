//! Configuration management

use crate::domain::occupancy::OccupancyConfig;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Environment variable prefix, e.g. `VOXCHANNEL__PRESENCE__DISCOVERY_DELAY_MS`
pub const ENV_PREFIX: &str = "VOXCHANNEL";

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub presence: PresenceConfig,
    pub storage: StorageConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PresenceConfig {
    /// Discovery window after a join, in milliseconds
    pub discovery_delay_ms: u64,
    /// Discovery window for probe joins
    pub probe_discovery_delay_ms: u64,
    /// Bound on waiting for probe join/leave callbacks
    pub probe_join_timeout_ms: u64,
    /// Bound on waiting for the leave callback before forcing idle
    pub leave_timeout_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    Memory,
    File,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub backend: StorageBackend,
    pub path: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
}

impl Default for PresenceConfig {
    fn default() -> Self {
        Self {
            discovery_delay_ms: 800,
            probe_discovery_delay_ms: 500,
            probe_join_timeout_ms: 5000,
            leave_timeout_ms: 3000,
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackend::File,
            path: "data/call_state.json".to_string(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl PresenceConfig {
    pub fn discovery_delay(&self) -> Duration {
        Duration::from_millis(self.discovery_delay_ms)
    }

    pub fn probe_discovery_delay(&self) -> Duration {
        Duration::from_millis(self.probe_discovery_delay_ms)
    }

    pub fn probe_join_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_join_timeout_ms)
    }

    pub fn leave_timeout(&self) -> Duration {
        Duration::from_millis(self.leave_timeout_ms)
    }
}

impl From<&PresenceConfig> for OccupancyConfig {
    fn from(config: &PresenceConfig) -> Self {
        OccupancyConfig {
            discovery_delay: config.discovery_delay(),
            probe_discovery_delay: config.probe_discovery_delay(),
            probe_join_timeout: config.probe_join_timeout(),
        }
    }
}

impl Config {
    /// Load from an optional TOML file, then apply environment overrides
    pub fn load(path: Option<&Path>) -> Result<Self, ::config::ConfigError> {
        let mut builder = ::config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(::config::File::from(path).required(false));
        }
        builder
            .add_source(::config::Environment::with_prefix(ENV_PREFIX).separator("__"))
            .build()?
            .try_deserialize()
    }

    /// Parse a TOML document; missing keys take their defaults
    pub fn from_toml_str(raw: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.presence.discovery_delay(), Duration::from_millis(800));
        assert_eq!(config.presence.probe_discovery_delay(), Duration::from_millis(500));
        assert_eq!(config.storage.backend, StorageBackend::File);
    }

    #[test]
    fn test_partial_toml() {
        let config = Config::from_toml_str(
            r#"
            [presence]
            discovery_delay_ms = 1200

            [storage]
            backend = "memory"
            "#,
        )
        .unwrap();

        assert_eq!(config.presence.discovery_delay_ms, 1200);
        assert_eq!(config.presence.probe_discovery_delay_ms, 500);
        assert_eq!(config.storage.backend, StorageBackend::Memory);
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_occupancy_config_from_presence() {
        let presence = PresenceConfig {
            discovery_delay_ms: 100,
            probe_discovery_delay_ms: 50,
            probe_join_timeout_ms: 1000,
            leave_timeout_ms: 10,
        };
        let occupancy = OccupancyConfig::from(&presence);
        assert_eq!(occupancy.discovery_delay, Duration::from_millis(100));
        assert_eq!(occupancy.probe_discovery_delay, Duration::from_millis(50));
        assert_eq!(occupancy.probe_join_timeout, Duration::from_secs(1));
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("voxchannel.toml");
        std::fs::write(&path, "[presence]\nprobe_discovery_delay_ms = 250\n").unwrap();

        let config = Config::load(Some(&path)).unwrap();
        assert_eq!(config.presence.probe_discovery_delay_ms, 250);
        assert_eq!(config.presence.discovery_delay_ms, 800);
    }
}
