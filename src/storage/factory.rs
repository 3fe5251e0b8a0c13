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

// Backend factory for creating storage backends from configuration

use super::backend::RecordingStore;
use super::memory::MemoryStore;
use super::sqlite::SqliteBackend;
use crate::config::StorageConfig;
use anyhow::{bail, Result};
use std::sync::Arc;

pub struct StorageFactory;

impl StorageFactory {
    /// Create storage backend from configuration
    pub fn create(config: &StorageConfig) -> Result<Arc<dyn RecordingStore>> {
        match config.backend.as_str() {
            "sqlite" => {
                let sqlite = config
                    .sqlite
                    .as_ref()
                    .ok_or_else(|| anyhow::anyhow!("SQLite config missing"))?;

                let backend = SqliteBackend::new(sqlite)?;
                Ok(Arc::new(backend))
            }

            "memory" => Ok(Arc::new(MemoryStore::new())),

            unknown => bail!(
                "Unknown storage backend: '{}'. Supported: sqlite, memory",
                unknown
            ),
        }
    }
}
