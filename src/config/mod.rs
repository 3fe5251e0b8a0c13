// Configuration module for bus-recorder
//
// Provides:
// - YAML configuration file loading
// - Environment variable substitution
// - Secret file reading
// - Configuration validation
// - Default values

mod loader;
pub mod types;

pub use loader::{read_secret, ConfigLoader};
pub use types::*;

use anyhow::{Context, Result};
use std::path::Path;

/// Load configuration from a YAML file
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<RecorderConfig> {
    ConfigLoader::load(path).context("Failed to load configuration")
}

/// Load configuration with environment variable overrides
pub fn load_config_with_env<P: AsRef<Path>>(path: P) -> Result<RecorderConfig> {
    let mut config = load_config(path)?;
    apply_env_overrides(&mut config)?;
    ConfigLoader::validate(&config)?;
    Ok(config)
}

/// Apply the well-known environment overrides on top of file values
pub fn apply_env_overrides(config: &mut RecorderConfig) -> Result<()> {
    if let Some(mqtt) = config.bus.mqtt.as_mut() {
        if let Ok(host) = std::env::var("MQTT_HOST") {
            mqtt.host = host;
        }
        if let Ok(port) = std::env::var("MQTT_PORT") {
            mqtt.port = port
                .parse()
                .with_context(|| format!("MQTT_PORT is not a port number: '{}'", port))?;
        }
    }

    if let Ok(path) = std::env::var("DATABASE_PATH") {
        if let Some(sqlite) = config.storage.sqlite.as_mut() {
            sqlite.path = path;
        }
    }

    if let Ok(listen) = std::env::var("LISTEN_ADDR") {
        config.server.listen = listen;
    }

    if let Ok(level) = std::env::var("LOG_LEVEL") {
        config.logging.level = level;
    }

    Ok(())
}
