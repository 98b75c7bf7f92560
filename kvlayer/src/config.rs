use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

use crate::core::{Result, SettingsOverrides};
use crate::driver::DriverConfig;

/// Database configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// Storage driver name (`memory` or `dirty`)
    pub driver: String,
    pub driver_settings: DriverConfig,
    /// Overrides for the cache and buffer settings
    pub cache: SettingsOverrides,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            driver: "memory".to_string(),
            driver_settings: DriverConfig::default(),
            cache: SettingsOverrides::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "plain".to_string(),
        }
    }
}

impl DatabaseConfig {
    /// Load configuration from YAML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        Self::from_yaml(&content)
    }

    pub fn from_yaml(content: &str) -> Result<Self> {
        let config: DatabaseConfig = serde_yaml::from_str(content)?;
        Ok(config)
    }
}
