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

use anyhow::{anyhow, Result};
use std::sync::Arc;

use super::{BusConnector, MemoryBus, MqttConnector};
use crate::config::BusConfig;

/// Factory for creating bus connectors
pub struct BusFactory;

impl BusFactory {
    /// Create a bus connector from configuration
    pub fn create(config: &BusConfig) -> Result<Arc<dyn BusConnector>> {
        match config.backend.as_str() {
            "mqtt" => {
                let mqtt = config
                    .mqtt
                    .clone()
                    .ok_or_else(|| anyhow!("mqtt bus selected but mqtt config missing"))?;
                Ok(Arc::new(MqttConnector::new(mqtt)))
            }
            "memory" => Ok(Arc::new(MemoryBus::new())),
            unknown => Err(anyhow!(
                "Unknown bus backend: '{}'. Supported: mqtt, memory",
                unknown
            )),
        }
    }
}
