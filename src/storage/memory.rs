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

// In-memory backend, for tests and dry runs

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use tokio::sync::RwLock;
use uuid::Uuid;

use super::backend::RecordingStore;
use crate::error::StorageError;
use crate::protocol::{
    BusMessage, MessageQuery, NewBusMessage, NewSession, RecordingSession, SessionState,
};

#[derive(Default)]
struct MemoryState {
    sessions: HashMap<Uuid, RecordingSession>,
    messages: Vec<BusMessage>,
    next_id: i64,
}

/// Process-local store; everything is lost on exit
#[derive(Default)]
pub struct MemoryStore {
    state: RwLock<MemoryState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored messages across all sessions
    pub async fn message_count(&self) -> usize {
        self.state.read().await.messages.len()
    }
}

fn sorted(mut rows: Vec<BusMessage>) -> Vec<BusMessage> {
    rows.sort_by(|a, b| a.timestamp.cmp(&b.timestamp).then(a.id.cmp(&b.id)));
    rows
}

#[async_trait]
impl RecordingStore for MemoryStore {
    async fn initialize(&self) -> Result<(), StorageError> {
        Ok(())
    }

    async fn create_session(&self, new: NewSession) -> Result<RecordingSession, StorageError> {
        let session = RecordingSession::new(new.node, new.topic_filters);
        let mut state = self.state.write().await;
        state.sessions.insert(session.id, session.clone());
        Ok(session)
    }

    async fn get_session(&self, id: Uuid) -> Result<Option<RecordingSession>, StorageError> {
        Ok(self.state.read().await.sessions.get(&id).cloned())
    }

    async fn list_sessions(&self) -> Result<Vec<RecordingSession>, StorageError> {
        let state = self.state.read().await;
        let mut sessions: Vec<_> = state.sessions.values().cloned().collect();
        sessions.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(sessions)
    }

    async fn mark_recording(&self, id: Uuid, at: DateTime<Utc>) -> Result<bool, StorageError> {
        let mut state = self.state.write().await;
        match state.sessions.get_mut(&id) {
            Some(session) if session.state == SessionState::Created => {
                session.state = SessionState::Recording;
                session.started_at = Some(at);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn mark_stopped(&self, id: Uuid, at: DateTime<Utc>) -> Result<bool, StorageError> {
        let mut state = self.state.write().await;
        match state.sessions.get_mut(&id) {
            Some(session) if session.state == SessionState::Recording => {
                session.state = SessionState::Stopped;
                session.stopped_at = Some(at);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn insert_messages(&self, batch: &[NewBusMessage]) -> Result<u64, StorageError> {
        let mut state = self.state.write().await;

        // Check every row first so a bad batch leaves nothing behind
        if let Some(msg) = batch
            .iter()
            .find(|m| !state.sessions.contains_key(&m.session_id))
        {
            return Err(StorageError::UnknownSession(msg.session_id));
        }

        for msg in batch {
            state.next_id += 1;
            let id = state.next_id;
            state.messages.push(BusMessage {
                id,
                session_id: msg.session_id,
                timestamp: msg.timestamp,
                topic: msg.topic.clone(),
                payload: msg.payload.clone(),
                qos: msg.qos,
                retained: msg.retained,
            });
        }

        Ok(batch.len() as u64)
    }

    async fn session_messages(&self, session_id: Uuid) -> Result<Vec<BusMessage>, StorageError> {
        let state = self.state.read().await;
        let rows = state
            .messages
            .iter()
            .filter(|m| m.session_id == session_id)
            .cloned()
            .collect();
        Ok(sorted(rows))
    }

    async fn query_messages(&self, query: &MessageQuery) -> Result<Vec<BusMessage>, StorageError> {
        let state = self.state.read().await;
        let rows = state
            .messages
            .iter()
            .filter(|m| m.session_id == query.session_id)
            .filter(|m| query.prefix().map_or(true, |p| m.topic.starts_with(p)))
            .cloned()
            .collect();
        Ok(sorted(rows)
            .into_iter()
            .skip(query.offset as usize)
            .take(query.limit as usize)
            .collect())
    }

    fn backend_type(&self) -> &str {
        "memory"
    }
}
