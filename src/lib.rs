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

// MQTT bus recorder with SQLite storage
//
// Records the traffic of an MQTT broker into durable storage and replays
// recorded sessions back onto the bus:
// - Subscribes to a session's topic filters and normalizes every payload
// - Batches rows and flushes them on size or time thresholds
// - Replays sessions in capture order with scaled inter-message timing
// - Allows one recording and one playback per process
// - Exposes start/stop/list operations over HTTP

pub mod buffer;
pub mod bus;
pub mod config;
pub mod control;
pub mod error;
pub mod guard;
pub mod logging;
pub mod normalizer;
pub mod playback;
pub mod protocol;
pub mod recorder;
pub mod storage;

// Re-export main types
pub use buffer::{ingest_queue, BatchWriter, IngestItem, IngestReceiver, IngestSender};
pub use bus::{BusConnection, BusConnector, BusFactory, IncomingMessage, MemoryBus};
pub use config::{load_config, load_config_with_env, RecorderConfig};
pub use control::ControlInterface;
pub use error::{RecorderError, Result, StorageError, TransportError};
pub use guard::{EnginePhase, RunSlot, RunStatus};
pub use normalizer::normalize;
pub use playback::Player;
pub use protocol::{
    BusMessage, MessageQuery, NewBusMessage, NewSession, PlaybackOptions, PlaybackReport,
    RecordingReport, RecordingSession, SessionState,
};
pub use recorder::Recorder;
pub use storage::{MemoryStore, RecordingStore, SqliteBackend, StorageFactory};
