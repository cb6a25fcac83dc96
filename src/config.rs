//! Configuration management for the broker
//!
//! Loads and saves broker timing and synthetic pipeline settings as TOML.

use crate::errors::BrokerError;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Root configuration structure
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct BrokerConfig {
    pub broker: BrokerSettings,
    pub pipeline: PipelineSettings,
}

/// Select/teardown policy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerSettings {
    /// How long `select` waits for a permission grant, in milliseconds
    pub select_timeout_ms: u64,
    /// Reap disconnected, unreferenced sessions whenever a client unbinds
    pub reap_on_unbind: bool,
}

/// Synthetic capture pipeline settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineSettings {
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    /// Pixel format label attached to every frame
    pub format: String,
}

impl Default for BrokerSettings {
    fn default() -> Self {
        Self {
            select_timeout_ms: 2000,
            reap_on_unbind: true,
        }
    }
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            width: 640,
            height: 480,
            fps: 30,
            format: "RGB24".to_string(),
        }
    }
}

impl BrokerSettings {
    pub fn select_timeout(&self) -> Duration {
        Duration::from_millis(self.select_timeout_ms)
    }
}

/// Largest accepted frame width or height
pub const MAX_DIMENSION: u32 = 8192;

fn config_error(msg: String) -> BrokerError {
    BrokerError::Config(msg)
}

impl BrokerConfig {
    /// Load configuration from TOML file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, BrokerError> {
        let path = path.as_ref();

        if !path.exists() {
            log::info!("Config file not found at {:?}, using defaults", path);
            return Ok(Self::default());
        }

        let contents = fs::read_to_string(path)
            .map_err(|e| config_error(format!("Failed to read config file: {}", e)))?;

        let config: BrokerConfig = toml::from_str(&contents)
            .map_err(|e| config_error(format!("Failed to parse config file: {}", e)))?;

        log::info!("Loaded configuration from {:?}", path);
        Ok(config)
    }

    /// Save configuration to TOML file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<(), BrokerError> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| config_error(format!("Failed to create config directory: {}", e)))?;
        }

        let toml_string = self.to_toml()?;
        fs::write(path, toml_string)
            .map_err(|e| config_error(format!("Failed to write config file: {}", e)))?;

        log::info!("Saved configuration to {:?}", path);
        Ok(())
    }

    pub fn to_toml(&self) -> Result<String, BrokerError> {
        toml::to_string_pretty(self)
            .map_err(|e| config_error(format!("Failed to serialize config: {}", e)))
    }

    /// Get default config file path
    pub fn default_path() -> PathBuf {
        PathBuf::from("uvcbroker.toml")
    }

    /// Load from default location or fall back to defaults
    pub fn load_or_default() -> Self {
        Self::load_from_file(Self::default_path()).unwrap_or_else(|e| {
            log::warn!("Failed to load config, using defaults: {}", e);
            Self::default()
        })
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<(), String> {
        if self.broker.select_timeout_ms == 0 {
            return Err("Select timeout must be greater than zero".to_string());
        }
        if self.broker.select_timeout_ms > 600_000 {
            return Err("Select timeout must be at most 10 minutes".to_string());
        }
        if self.pipeline.width == 0 || self.pipeline.height == 0 {
            return Err("Invalid pipeline resolution".to_string());
        }
        if self.pipeline.width > MAX_DIMENSION || self.pipeline.height > MAX_DIMENSION {
            return Err(format!(
                "Pipeline resolution {}x{} exceeds {}x{}",
                self.pipeline.width, self.pipeline.height, MAX_DIMENSION, MAX_DIMENSION
            ));
        }
        if self.pipeline.fps == 0 || self.pipeline.fps > 240 {
            return Err("Invalid pipeline FPS (must be 1-240)".to_string());
        }
        if self.pipeline.format.is_empty() {
            return Err("Pipeline format must not be empty".to_string());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_default_config() {
        let config = BrokerConfig::default();
        assert_eq!(config.broker.select_timeout(), Duration::from_secs(2));
        assert!(config.broker.reap_on_unbind);
        assert_eq!(config.pipeline.fps, 30);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation() {
        let mut bad_timeout = BrokerConfig::default();
        bad_timeout.broker.select_timeout_ms = 0;
        assert!(bad_timeout.validate().is_err());

        let mut bad_resolution = BrokerConfig::default();
        bad_resolution.pipeline.height = 0;
        assert!(bad_resolution.validate().is_err());

        let mut huge = BrokerConfig::default();
        huge.pipeline.width = u32::MAX;
        huge.pipeline.height = u32::MAX;
        assert!(huge.validate().unwrap_err().contains("exceeds"));

        let mut widest = BrokerConfig::default();
        widest.pipeline.width = MAX_DIMENSION;
        assert!(widest.validate().is_ok());

        let mut bad_fps = BrokerConfig::default();
        bad_fps.pipeline.fps = 500;
        assert!(bad_fps.validate().is_err());
    }

    #[test]
    fn test_config_save_and_load() {
        let dir = tempdir().unwrap();
        let config_path = dir.path().join("nested").join("uvcbroker.toml");

        let mut config = BrokerConfig::default();
        config.broker.select_timeout_ms = 750;
        config.pipeline.format = "NV21".to_string();
        config.save_to_file(&config_path).unwrap();

        let loaded = BrokerConfig::load_from_file(&config_path).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_config_toml_format() {
        let toml_string = BrokerConfig::default().to_toml().unwrap();
        assert!(toml_string.contains("[broker]"));
        assert!(toml_string.contains("[pipeline]"));
        assert!(toml_string.contains("select_timeout_ms"));
        assert!(toml_string.contains("reap_on_unbind"));
    }

    #[test]
    fn test_load_nonexistent_file() {
        let result = BrokerConfig::load_from_file("nonexistent_uvcbroker.toml");
        assert_eq!(result.unwrap(), BrokerConfig::default());
    }

    #[test]
    fn test_partial_file_fills_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("partial.toml");
        fs::write(&path, "[broker]\nselect_timeout_ms = 500\n").unwrap();

        let loaded = BrokerConfig::load_from_file(&path).unwrap();
        assert_eq!(loaded.broker.select_timeout_ms, 500);
        assert!(loaded.broker.reap_on_unbind);
        assert_eq!(loaded.pipeline, PipelineSettings::default());
    }

    #[test]
    fn test_load_malformed_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("bad.toml");
        fs::write(&path, "[broker\nselect_timeout_ms = ").unwrap();
        assert!(BrokerConfig::load_from_file(&path).is_err());
    }
}
