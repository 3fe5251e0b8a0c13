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

// Storage backend module
//
// Provides a trait-based abstraction over where sessions and recorded
// messages live, so the engines can run against SQLite in production and
// an in-memory store in tests.

pub mod backend;
pub mod factory;
pub mod memory;
pub mod sqlite;

pub use backend::RecordingStore;
pub use factory::StorageFactory;
pub use memory::MemoryStore;
pub use sqlite::SqliteBackend;
