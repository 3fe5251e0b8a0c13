// Configuration loader with environment variable substitution

use super::types::*;
use anyhow::{bail, Context, Result};
use regex::{Captures, Regex};
use std::net::SocketAddr;
use std::path::Path;

pub struct ConfigLoader;

impl ConfigLoader {
    /// Load configuration from file with environment variable substitution
    pub fn load<P: AsRef<Path>>(path: P) -> Result<RecorderConfig> {
        let content = std::fs::read_to_string(path.as_ref())
            .with_context(|| format!("Failed to read config file {}", path.as_ref().display()))?;

        Self::load_str(&content)
    }

    /// Parse and validate configuration text
    pub fn load_str(content: &str) -> Result<RecorderConfig> {
        let content = Self::substitute_env_vars(content)?;

        let config: RecorderConfig =
            serde_yaml::from_str(&content).context("Failed to parse YAML configuration")?;

        Self::validate(&config)?;

        Ok(config)
    }

    /// Substitute ${VAR} and ${VAR:-default} patterns with environment variables
    ///
    /// Unset variables without a default are left untouched.
    fn substitute_env_vars(content: &str) -> Result<String> {
        let re = Regex::new(r"\$\{([^}:]+)(?::-([^}]*))?\}")
            .context("Invalid substitution pattern")?;

        let substituted = re.replace_all(content, |caps: &Captures| {
            let var_name = &caps[1];
            match std::env::var(var_name) {
                Ok(value) => value,
                Err(_) => match caps.get(2) {
                    Some(default) => default.as_str().to_string(),
                    None => caps[0].to_string(),
                },
            }
        });

        Ok(substituted.into_owned())
    }

    /// Validate configuration
    pub fn validate(config: &RecorderConfig) -> Result<()> {
        match config.bus.backend.as_str() {
            "mqtt" => {
                let Some(mqtt) = config.bus.mqtt.as_ref() else {
                    bail!("mqtt bus selected but mqtt config missing");
                };
                Self::validate_mqtt(mqtt)?;
            }
            "memory" => {}
            unknown => bail!("Unknown bus backend: '{}'. Supported: mqtt, memory", unknown),
        }

        match config.storage.backend.as_str() {
            "sqlite" => {
                let Some(sqlite) = config.storage.sqlite.as_ref() else {
                    bail!("sqlite backend selected but sqlite config missing");
                };
                if sqlite.path.trim().is_empty() {
                    bail!("storage.sqlite.path cannot be empty");
                }
                if sqlite.max_connections == 0 {
                    bail!("storage.sqlite.max_connections must be > 0");
                }
            }
            "memory" => {}
            unknown => bail!(
                "Unknown storage backend: '{}'. Supported: sqlite, memory",
                unknown
            ),
        }

        let recorder = &config.recorder;
        if recorder.queue_capacity == 0 {
            bail!("recorder.queue_capacity must be > 0");
        }
        if recorder.flush_policy.batch_size == 0 {
            bail!("recorder.flush_policy.batch_size must be > 0");
        }
        if recorder.flush_policy.flush_interval_ms == 0 {
            bail!("recorder.flush_policy.flush_interval_ms must be > 0");
        }
        if recorder.receive_poll_ms == 0 {
            bail!("recorder.receive_poll_ms must be > 0");
        }

        config
            .server
            .listen
            .parse::<SocketAddr>()
            .with_context(|| format!("Invalid server.listen address '{}'", config.server.listen))?;

        Ok(())
    }

    fn validate_mqtt(mqtt: &MqttConfig) -> Result<()> {
        if mqtt.host.trim().is_empty() {
            bail!("bus.mqtt.host cannot be empty");
        }
        if mqtt.client_id.trim().is_empty() {
            bail!("bus.mqtt.client_id cannot be empty");
        }
        if mqtt.subscribe_qos > 2 || mqtt.publish_qos > 2 {
            bail!("bus.mqtt qos must be 0, 1 or 2");
        }
        if mqtt.channel_capacity == 0 {
            bail!("bus.mqtt.channel_capacity must be > 0");
        }
        if mqtt.tls.enabled && mqtt.tls.ca_file.is_none() {
            bail!("bus.mqtt.tls.ca_file must be set when tls is enabled");
        }
        if mqtt.tls.cert_file.is_some() != mqtt.tls.key_file.is_some() {
            bail!("bus.mqtt.tls.cert_file and key_file must be set together");
        }
        Ok(())
    }
}

/// Read a trimmed secret from a mounted file; missing or empty files yield None
pub fn read_secret(path: &str) -> Option<String> {
    if path.is_empty() {
        return None;
    }
    let value = std::fs::read_to_string(path).ok()?;
    let value = value.trim();
    (!value.is_empty()).then(|| value.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_env_var_substitution() {
        std::env::set_var("BUS_RECORDER_TEST_HOST", "broker.local");

        let input = "host: ${BUS_RECORDER_TEST_HOST}";
        let output = ConfigLoader::substitute_env_vars(input).unwrap();
        assert_eq!(output, "host: broker.local");

        std::env::remove_var("BUS_RECORDER_TEST_HOST");
    }

    #[test]
    fn test_env_var_with_default() {
        std::env::remove_var("BUS_RECORDER_TEST_UNSET");

        let input = "client_id: ${BUS_RECORDER_TEST_UNSET:-recorder-a}";
        let output = ConfigLoader::substitute_env_vars(input).unwrap();
        assert_eq!(output, "client_id: recorder-a");
    }

    #[test]
    fn test_unset_var_without_default_is_kept() {
        std::env::remove_var("BUS_RECORDER_TEST_MISSING");

        let output = ConfigLoader::substitute_env_vars("x: ${BUS_RECORDER_TEST_MISSING}").unwrap();
        assert_eq!(output, "x: ${BUS_RECORDER_TEST_MISSING}");
    }

    #[test]
    fn test_default_config_is_valid() {
        assert!(ConfigLoader::validate(&RecorderConfig::default()).is_ok());
    }

    #[test]
    fn test_validation_zero_batch_size() {
        let mut config = RecorderConfig::default();
        config.recorder.flush_policy.batch_size = 0;

        let result = ConfigLoader::validate(&config);
        assert!(result.unwrap_err().to_string().contains("batch_size"));
    }

    #[test]
    fn test_validation_invalid_qos() {
        let mut config = RecorderConfig::default();
        if let Some(mqtt) = config.bus.mqtt.as_mut() {
            mqtt.publish_qos = 3;
        }

        let result = ConfigLoader::validate(&config);
        assert!(result.unwrap_err().to_string().contains("qos"));
    }

    #[test]
    fn test_validation_tls_requires_ca() {
        let mut config = RecorderConfig::default();
        if let Some(mqtt) = config.bus.mqtt.as_mut() {
            mqtt.tls.enabled = true;
        }

        let result = ConfigLoader::validate(&config);
        assert!(result.unwrap_err().to_string().contains("ca_file"));
    }

    #[test]
    fn test_validation_unknown_backend() {
        let mut config = RecorderConfig::default();
        config.storage.backend = "postgres".to_string();

        let result = ConfigLoader::validate(&config);
        assert!(result.unwrap_err().to_string().contains("Unknown storage backend"));
    }

    #[test]
    fn test_read_secret_trims() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mqtt_password");
        std::fs::write(&path, "s3cret\n").unwrap();

        assert_eq!(read_secret(path.to_str().unwrap()), Some("s3cret".to_string()));
        assert_eq!(read_secret(dir.path().join("absent").to_str().unwrap()), None);
        assert_eq!(read_secret(""), None);
    }
}
