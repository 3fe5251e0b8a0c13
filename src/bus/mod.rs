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

// Bus transport module
//
// The engines only talk to the bus through these traits. Each recorder or
// playback run opens its own connection and closes it on exit.

pub mod factory;
pub mod memory;
pub mod mqtt;

pub use factory::BusFactory;
pub use memory::MemoryBus;
pub use mqtt::MqttConnector;

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::TransportError;

/// A message delivered by the bus
#[derive(Debug, Clone, PartialEq)]
pub struct IncomingMessage {
    /// Concrete topic, never a filter
    pub topic: String,
    pub payload: Bytes,
    pub qos: u8,
    pub retain: bool,
}

/// Which engine a connection belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionRole {
    Recorder,
    Player,
}

impl ConnectionRole {
    /// Client id suffix keeping the two engines' connections apart
    pub fn client_id_suffix(self) -> &'static str {
        match self {
            ConnectionRole::Recorder => "",
            ConnectionRole::Player => "-player",
        }
    }
}

/// Opens bus connections
#[async_trait]
pub trait BusConnector: Send + Sync {
    async fn connect(&self, role: ConnectionRole) -> Result<Box<dyn BusConnection>, TransportError>;

    /// Get transport type identifier
    fn transport_type(&self) -> &str;
}

/// One open bus connection, owned by a single run
#[async_trait]
pub trait BusConnection: Send {
    async fn subscribe(&mut self, filter: &str) -> Result<(), TransportError>;

    /// Wait for the next incoming message
    ///
    /// Cancel-safe: dropping the returned future never loses a message.
    /// `Ok(None)` means the connection was closed.
    async fn recv(&mut self) -> Result<Option<IncomingMessage>, TransportError>;

    async fn publish(&mut self, topic: &str, payload: Vec<u8>) -> Result<(), TransportError>;

    async fn close(&mut self) -> Result<(), TransportError>;
}

/// MQTT topic filter matching (`+` one level, `#` remaining levels)
pub fn topic_matches(filter: &str, topic: &str) -> bool {
    // Wildcards never match the broker's $-topics at the first level
    if topic.starts_with('$') && (filter.starts_with('+') || filter.starts_with('#')) {
        return false;
    }

    let mut filter_levels = filter.split('/');
    let mut topic_levels = topic.split('/');
    loop {
        match (filter_levels.next(), topic_levels.next()) {
            (Some("#"), _) => return true,
            (Some("+"), Some(_)) => continue,
            (Some(f), Some(t)) if f == t => continue,
            (None, None) => return true,
            _ => return false,
        }
    }
}

/// Whether `filter` is a well-formed MQTT subscription filter
pub fn valid_filter(filter: &str) -> bool {
    if filter.is_empty() {
        return false;
    }
    let levels: Vec<&str> = filter.split('/').collect();
    let last = levels.len() - 1;
    levels.iter().enumerate().all(|(i, level)| match *level {
        "#" => i == last,
        "+" => true,
        other => !other.contains('#') && !other.contains('+'),
    })
}
