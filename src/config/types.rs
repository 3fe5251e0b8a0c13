// Copyright 2025 coScene
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

// Configuration types for bus-recorder

use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::loader::read_secret;

/// Main configuration structure
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct RecorderConfig {
    #[serde(default)]
    pub bus: BusConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub recorder: RecorderSettings,
    #[serde(default)]
    pub playback: PlaybackSettings,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Bus transport configuration with backend selection
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BusConfig {
    /// Backend type: "mqtt" or "memory"
    #[serde(default = "default_bus_backend")]
    pub backend: String,

    #[serde(default)]
    pub mqtt: Option<MqttConfig>,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            backend: default_bus_backend(),
            mqtt: Some(MqttConfig::default()),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MqttConfig {
    #[serde(default = "default_mqtt_host")]
    pub host: String,

    #[serde(default = "default_mqtt_port")]
    pub port: u16,

    #[serde(default = "default_client_id")]
    pub client_id: String,

    #[serde(default)]
    pub username: Option<String>,

    /// Path to a mounted secret holding the password
    #[serde(default)]
    pub password_file: Option<String>,

    #[serde(default = "default_keep_alive")]
    pub keep_alive_seconds: u64,

    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_ms: u64,

    #[serde(default)]
    pub subscribe_qos: u8,

    #[serde(default)]
    pub publish_qos: u8,

    /// Incoming publishes buffered between the event loop and the recorder
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,

    #[serde(default)]
    pub tls: TlsConfig,
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            host: default_mqtt_host(),
            port: default_mqtt_port(),
            client_id: default_client_id(),
            username: None,
            password_file: None,
            keep_alive_seconds: default_keep_alive(),
            connect_timeout_ms: default_connect_timeout(),
            subscribe_qos: 0,
            publish_qos: 0,
            channel_capacity: default_channel_capacity(),
            tls: TlsConfig::default(),
        }
    }
}

impl MqttConfig {
    /// Password read from `password_file`, if any
    pub fn password(&self) -> Option<String> {
        self.password_file.as_deref().and_then(read_secret)
    }

    pub fn keep_alive(&self) -> Duration {
        Duration::from_secs(self.keep_alive_seconds)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct TlsConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub ca_file: Option<String>,
    #[serde(default)]
    pub cert_file: Option<String>,
    #[serde(default)]
    pub key_file: Option<String>,
}

/// Storage configuration with backend selection
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StorageConfig {
    /// Backend type: "sqlite" or "memory"
    #[serde(default = "default_storage_backend")]
    pub backend: String,

    #[serde(default)]
    pub sqlite: Option<SqliteConfig>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: default_storage_backend(),
            sqlite: Some(SqliteConfig::default()),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SqliteConfig {
    /// Database file, or ":memory:"
    #[serde(default = "default_sqlite_path")]
    pub path: String,

    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

impl Default for SqliteConfig {
    fn default() -> Self {
        Self {
            path: default_sqlite_path(),
            max_connections: default_max_connections(),
        }
    }
}

impl SqliteConfig {
    pub fn in_memory() -> Self {
        Self {
            path: ":memory:".to_string(),
            max_connections: 1,
        }
    }

    pub fn is_in_memory(&self) -> bool {
        self.path == ":memory:"
    }
}

/// Recorder-specific settings
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RecorderSettings {
    #[serde(default)]
    pub flush_policy: FlushPolicy,

    /// Pending messages between the bus receive loop and the writer
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    /// Upper bound on how long the receive loop blocks before checking for stop
    #[serde(default = "default_receive_poll")]
    pub receive_poll_ms: u64,
}

impl Default for RecorderSettings {
    fn default() -> Self {
        Self {
            flush_policy: FlushPolicy::default(),
            queue_capacity: default_queue_capacity(),
            receive_poll_ms: default_receive_poll(),
        }
    }
}

impl RecorderSettings {
    pub fn receive_poll(&self) -> Duration {
        Duration::from_millis(self.receive_poll_ms)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct FlushPolicy {
    /// Rows per bulk insert
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Maximum time between flushes while messages are pending
    #[serde(default = "default_flush_interval")]
    pub flush_interval_ms: u64,
}

impl Default for FlushPolicy {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            flush_interval_ms: default_flush_interval(),
        }
    }
}

impl FlushPolicy {
    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PlaybackSettings {
    #[serde(default = "default_topic_prefix")]
    pub default_topic_prefix: String,
}

impl Default for PlaybackSettings {
    fn default() -> Self {
        Self {
            default_topic_prefix: default_topic_prefix(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    #[serde(default = "default_listen")]
    pub listen: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String, // "trace", "debug", "info", "warn", "error"

    #[serde(default = "default_log_format")]
    pub format: String, // "text", "json"

    /// Append log lines to this file instead of stdout
    #[serde(default)]
    pub file: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
            file: None,
        }
    }
}

// Default value functions
fn default_bus_backend() -> String { "mqtt".to_string() }
fn default_mqtt_host() -> String { "localhost".to_string() }
fn default_mqtt_port() -> u16 { 1883 }
fn default_client_id() -> String { "mqtt-recorder".to_string() }
fn default_keep_alive() -> u64 { 30 }
fn default_connect_timeout() -> u64 { 5000 }
fn default_channel_capacity() -> usize { 1024 }
fn default_storage_backend() -> String { "sqlite".to_string() }
fn default_sqlite_path() -> String { "data/recordings.db".to_string() }
fn default_max_connections() -> u32 { 5 }
fn default_queue_capacity() -> usize { 5000 }
fn default_receive_poll() -> u64 { 250 }
fn default_batch_size() -> usize { 500 }
fn default_flush_interval() -> u64 { 200 }
fn default_topic_prefix() -> String { "replay/".to_string() }
fn default_listen() -> String { "0.0.0.0:8080".to_string() }
fn default_log_level() -> String { "info".to_string() }
fn default_log_format() -> String { "text".to_string() }
