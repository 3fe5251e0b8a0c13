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

// Storage backend trait for sessions and recorded messages

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::StorageError;
use crate::protocol::{BusMessage, MessageQuery, NewBusMessage, NewSession, RecordingSession};

/// Durable storage for recording sessions and the messages captured for them
///
/// The recorder is the only writer of message rows; playback and the
/// retrieval API only read them.
#[async_trait]
pub trait RecordingStore: Send + Sync {
    /// Create tables/indexes if needed
    async fn initialize(&self) -> Result<(), StorageError>;

    async fn create_session(&self, new: NewSession) -> Result<RecordingSession, StorageError>;

    async fn get_session(&self, id: Uuid) -> Result<Option<RecordingSession>, StorageError>;

    /// All sessions, newest first
    async fn list_sessions(&self) -> Result<Vec<RecordingSession>, StorageError>;

    /// CREATED -> RECORDING, setting `started_at`
    ///
    /// Returns false (and changes nothing) when the session is in any other state.
    async fn mark_recording(&self, id: Uuid, at: DateTime<Utc>) -> Result<bool, StorageError>;

    /// RECORDING -> STOPPED, setting `stopped_at`
    ///
    /// Returns false (and changes nothing) when the session is in any other state.
    async fn mark_stopped(&self, id: Uuid, at: DateTime<Utc>) -> Result<bool, StorageError>;

    /// Insert a batch of messages as one unit
    ///
    /// Either every row is stored or none is. Rows receive increasing ids in
    /// slice order.
    async fn insert_messages(&self, batch: &[NewBusMessage]) -> Result<u64, StorageError>;

    /// Every message of a session ordered by (timestamp, id)
    async fn session_messages(&self, session_id: Uuid) -> Result<Vec<BusMessage>, StorageError>;

    /// One page of a session's messages ordered by (timestamp, id)
    async fn query_messages(&self, query: &MessageQuery) -> Result<Vec<BusMessage>, StorageError>;

    /// Get backend type identifier
    fn backend_type(&self) -> &str;
}
